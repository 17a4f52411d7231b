use rumqttc::{MqttOptions, QoS, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::MqttError;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl TopicConfig {
    pub fn new(topic: impl Into<String>, qos: u8) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

impl fmt::Display for TopicConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (QoS {})", self.topic, self.qos)
    }
}

/// Settings of the outbound MQTT client session
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttClientConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    /// Base reconnect delay, also the value the backoff resets to
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Warm-up delay before the first connection attempt
    pub startup_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub max_inflight: u16,
    pub topics: Vec<TopicConfig>,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_url: "tcp://127.0.0.1:1883".to_string(),
            client_id: "protocol-server-client".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            max_reconnect_delay_ms: 60000,
            startup_delay_ms: 5000,
            connect_timeout_secs: 30,
            max_inflight: 100,
            topics: Vec::new(),
        }
    }
}

// Password stays out of the logs
impl fmt::Debug for MqttClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MqttClientConfig")
            .field("enabled", &self.enabled)
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("clean_session", &self.clean_session)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("max_reconnect_delay_ms", &self.max_reconnect_delay_ms)
            .field("topics", &self.topics)
            .finish()
    }
}

impl MqttClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the rumqttc options for one session.
    ///
    /// `session_client_id` is the per-attempt identifier (configured id plus a
    /// millisecond suffix), so two gateway instances never kick each other off.
    pub fn mqtt_options(&self, session_client_id: &str) -> Result<MqttOptions, MqttError> {
        let endpoint = BrokerEndpoint::parse(&self.broker_url)?;
        let mut options = MqttOptions::new(session_client_id, endpoint.host.clone(), endpoint.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(1)))
            .set_clean_session(self.clean_session)
            .set_inflight(self.max_inflight.max(1));

        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            let password = self.password.clone().unwrap_or_default();
            options.set_credentials(username, password);
        }

        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        Ok(options)
    }
}

/// Host, port and transport extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or a bare `host[:port]`.
    pub fn parse(url: &str) -> Result<Self, MqttError> {
        let url = url.trim();
        let (rest, tls) = match url.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => (rest, false),
            Some(("ssl" | "mqtts" | "tls", rest)) => (rest, true),
            Some((scheme, _)) => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "unsupported scheme '{}' in {}",
                    scheme, url
                )))
            }
            None => (url, false),
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(MqttError::InvalidBrokerUrl(format!("missing host in '{}'", url)));
        }

        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    MqttError::InvalidBrokerUrl(format!("invalid port in '{}': {}", url, e))
                })?;
                (host, port)
            }
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(MqttError::InvalidBrokerUrl(format!("missing host in '{}'", url)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

fn default_qos() -> u8 {
    1
}

/// Maps a numeric QoS level onto rumqttc's enum; anything above 2 is rejected
/// by config validation, and clamps to exactly-once here.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_url() {
        let endpoint = BrokerEndpoint::parse("tcp://127.0.0.1:1884").unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 1884);
        assert!(!endpoint.tls);
    }

    #[test]
    fn bare_host_uses_default_port() {
        let endpoint = BrokerEndpoint::parse("broker.local").unwrap();
        assert_eq!(endpoint.port, 1883);
        let tls = BrokerEndpoint::parse("ssl://broker.local").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(BrokerEndpoint::parse("http://x:1").is_err());
        assert!(BrokerEndpoint::parse("tcp://").is_err());
        assert!(BrokerEndpoint::parse("tcp://host:notaport").is_err());
        assert!(BrokerEndpoint::parse("tcp://:1883").is_err());
    }

    #[test]
    fn qos_levels_map_onto_rumqttc() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn debug_output_hides_password() {
        let config = MqttClientConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn topic_qos_defaults_to_one() {
        let topic: TopicConfig = toml::from_str(r#"topic = "sensor/#""#).unwrap();
        assert_eq!(topic.qos, 1);
    }
}

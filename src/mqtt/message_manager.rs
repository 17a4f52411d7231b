//! Inbound message handling for the client session.
//!
//! Every publish received on a subscription becomes a [`Record`] and is handed
//! to the batch writer. Nothing here may fail the transport task: the record is
//! built lossily and enqueueing never blocks.

use rumqttc::QoS;
use tracing::debug;

use crate::persistence::RecordSink;
use crate::record::Record;

/// Converts one inbound publish into a record and forwards it.
pub fn on_message_arrived(sink: &RecordSink, topic: &str, payload: &[u8], qos: QoS) -> Record {
    debug!(
        "MQTT message received - topic: {}, {} bytes, QoS: {:?}",
        topic,
        payload.len(),
        qos
    );

    let record = Record::from_subscription(topic, payload);
    sink.enqueue(record.clone());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{OverflowPolicy, PendingQueue};
    use std::sync::Arc;

    #[test]
    fn arrived_message_is_queued_as_record() {
        let queue = Arc::new(PendingQueue::new(10, OverflowPolicy::DropOldest));
        let sink = RecordSink::new(queue.clone(), true);

        let record = on_message_arrived(
            &sink,
            "sensor/device001/temperature",
            br#"{"deviceId":"device001","data":{"temp":21.5}}"#,
            QoS::AtLeastOnce,
        );

        assert_eq!(record.device_id.as_deref(), Some("device001"));
        let queued = queue.drain();
        assert_eq!(queued, vec![record]);
    }

    #[test]
    fn disabled_sink_drops_silently() {
        let queue = Arc::new(PendingQueue::new(10, OverflowPolicy::DropOldest));
        let sink = RecordSink::new(queue.clone(), false);

        on_message_arrived(&sink, "a/b", b"x", QoS::AtMostOnce);
        assert!(queue.is_empty());
    }
}

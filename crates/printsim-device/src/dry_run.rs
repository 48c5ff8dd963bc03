use printsim_client::{Ack, PublishError, Publisher, QoS};

/// Logs payloads instead of sending them. Never fails.
#[derive(Debug, Default)]
pub struct DryRunPublisher;

impl Publisher for DryRunPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<Ack, PublishError> {
        tracing::debug!(
            topic,
            ?qos,
            "[dry-run] {}",
            String::from_utf8_lossy(payload)
        );
        Ok(Ack { packet_id: None })
    }
}

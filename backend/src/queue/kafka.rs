//! Kafka transport for issue requests.
//!
//! Offsets are committed only after the handler returns, so a crash
//! mid-message redelivers it (at-least-once). The ledger's uniqueness
//! rules absorb the duplicate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{IssueCouponMessage, IssueMessageHandler, IssuePublisher, ISSUE_DEAD_LETTER_TOPIC, ISSUE_TOPIC};
use crate::error::CouponError;

#[derive(Clone)]
pub struct KafkaIssuePublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaIssuePublisher {
    pub fn new(brokers: &str, send_timeout: Duration) -> Result<Self, CouponError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| CouponError::Internal(format!("Failed to create Kafka producer: {}", e)))?;

        info!("Kafka producer ready ({})", brokers);
        Ok(Self { producer, send_timeout })
    }

    async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<(), CouponError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        match self.producer.send(record, Timeout::After(self.send_timeout)).await {
            Ok((partition, offset)) => {
                debug!("Sent to {} partition {} offset {}", topic, partition, offset);
                Ok(())
            }
            Err((e, _)) => {
                error!("Failed to send message to Kafka topic {}: {:?}", topic, e);
                Err(CouponError::Internal(format!("Failed to send message to Kafka: {}", e)))
            }
        }
    }
}

#[async_trait]
impl IssuePublisher for KafkaIssuePublisher {
    async fn publish(&self, message: &IssueCouponMessage) -> Result<(), CouponError> {
        let payload = message.to_json()?;
        self.send(ISSUE_TOPIC, message.partition_key(), &payload).await
    }

    async fn publish_dead_letter(&self, message: &IssueCouponMessage, reason: &str) -> Result<(), CouponError> {
        let payload = serde_json::json!({
            "coupon_policy_code": message.coupon_policy_code,
            "user_id": message.user_id,
            "reason": reason,
        })
        .to_string();
        self.send(ISSUE_DEAD_LETTER_TOPIC, message.partition_key(), &payload).await
    }
}

pub struct KafkaIssueConsumer {
    consumer: StreamConsumer,
}

impl KafkaIssueConsumer {
    pub fn new(brokers: &str, group_id: &str) -> Result<Self, CouponError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| CouponError::Internal(format!("Failed to create Kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[ISSUE_TOPIC])
            .map_err(|e| CouponError::Internal(format!("Failed to subscribe to {}: {}", ISSUE_TOPIC, e)))?;

        info!("Kafka consumer subscribed to {} as {}", ISSUE_TOPIC, group_id);
        Ok(Self { consumer })
    }

    /// Consume until shutdown, committing each offset after its message is
    /// handled. Returns how many messages were handled.
    pub async fn run(self, handler: Arc<dyn IssueMessageHandler>, shutdown: CancellationToken) -> usize {
        let mut handled = 0usize;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    error!("Kafka error: {:?}", e);
                    continue;
                }
            };

            match message.payload_view::<str>() {
                Some(Ok(text)) => match IssueCouponMessage::from_json(text) {
                    Ok(issue) => {
                        handler.handle(issue).await;
                        handled += 1;
                    }
                    Err(e) => warn!("Skipping malformed issue message at offset {}: {}", message.offset(), e),
                },
                _ => warn!("Skipping non-UTF-8 issue message at offset {}", message.offset()),
            }

            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                warn!("Failed to commit offset {}: {}", message.offset(), e);
            }
        }

        info!("Kafka issue consumer stopped after {} message(s)", handled);
        handled
    }
}

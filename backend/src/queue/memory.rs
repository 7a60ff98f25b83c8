//! In-process partitioned queue over bounded tokio channels.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{partition_for, DeadLetter, IssueCouponMessage, IssueMessageHandler, IssuePublisher};
use crate::error::CouponError;

pub struct ChannelQueue {
    senders: Vec<mpsc::Sender<IssueCouponMessage>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl ChannelQueue {
    /// A queue with `partitions` channels of `capacity` each, plus the
    /// receiving ends to hand to consumers.
    pub fn new(partitions: usize, capacity: usize) -> (Self, Vec<PartitionReceiver>) {
        let partitions = partitions.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions)
            .map(|partition| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (tx, PartitionReceiver { partition, receiver: rx })
            })
            .unzip();

        let queue = Self {
            senders,
            dead_letters: Mutex::new(Vec::new()),
        };
        (queue, receivers)
    }

    /// Snapshot of everything dead-lettered so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IssuePublisher for ChannelQueue {
    async fn publish(&self, message: &IssueCouponMessage) -> Result<(), CouponError> {
        let partition = partition_for(message.partition_key(), self.senders.len());
        self.senders[partition]
            .send(message.clone())
            .await
            .map_err(|_| CouponError::Internal(format!("issue queue partition {} is closed", partition)))?;
        debug!(
            "Queued issue request {}/{} on partition {}",
            message.coupon_policy_code, message.user_id, partition
        );
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &IssueCouponMessage, reason: &str) -> Result<(), CouponError> {
        let mut letters = self
            .dead_letters
            .lock()
            .map_err(|_| CouponError::Internal("dead-letter store poisoned".to_string()))?;
        letters.push(DeadLetter {
            message: message.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }
}

/// The consuming end of one partition.
pub struct PartitionReceiver {
    partition: usize,
    receiver: mpsc::Receiver<IssueCouponMessage>,
}

impl PartitionReceiver {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Feed messages to `handler` one at a time until shutdown or until
    /// every sender is gone. Returns how many messages were handled.
    ///
    /// Shutdown is only observed between messages.
    pub async fn run(mut self, handler: Arc<dyn IssueMessageHandler>, shutdown: CancellationToken) -> usize {
        info!("Issue consumer started on partition {}", self.partition);
        let mut handled = 0usize;

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(message) => message,
                    None => {
                        warn!("Issue queue partition {} closed", self.partition);
                        break;
                    }
                },
            };

            handler.handle(message).await;
            handled += 1;
        }

        info!(
            "Issue consumer on partition {} stopped after {} message(s)",
            self.partition, handled
        );
        handled
    }
}

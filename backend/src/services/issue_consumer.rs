//! # Issue Consumer
//!
//! Drains queued issue requests into the ledger, one partition per task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::IssuanceCoordinator;
use crate::error::CouponError;
use crate::queue::{IssueCouponMessage, IssueMessageHandler, PartitionReceiver};

/// Handler behind every partition consumer.
///
/// Failures are already compensated and dead-lettered by the coordinator,
/// so they are only logged here and never stop the consumer.
#[derive(Clone)]
pub struct IssueConsumer {
    coordinator: IssuanceCoordinator,
}

impl IssueConsumer {
    pub fn new(coordinator: IssuanceCoordinator) -> Self {
        Self { coordinator }
    }

    /// Start one task per in-process partition.
    pub fn spawn_partitions(
        self,
        receivers: Vec<PartitionReceiver>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<usize>> {
        let handler: Arc<dyn IssueMessageHandler> = Arc::new(self);
        receivers
            .into_iter()
            .map(|receiver| {
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(receiver.run(handler, shutdown))
            })
            .collect()
    }
}

#[async_trait]
impl IssueMessageHandler for IssueConsumer {
    async fn handle(&self, message: IssueCouponMessage) {
        match self.coordinator.process_issue_message(&message).await {
            Ok(coupon) => debug!("Issued {} from queue", coupon.code),
            Err(CouponError::QuotaExceeded(reason)) => {
                warn!(
                    coupon_policy_code = %message.coupon_policy_code,
                    user_id = %message.user_id,
                    "Queued request refused by ledger: {}",
                    reason
                );
            }
            Err(e) => {
                warn!(
                    coupon_policy_code = %message.coupon_policy_code,
                    user_id = %message.user_id,
                    error_code = e.code(),
                    "Queued request failed: {}",
                    e
                );
            }
        }
    }
}

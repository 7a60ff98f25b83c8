//! # Issue Request Queue
//!
//! Decouples accepting an issue request from persisting the coupon.
//!
//! ```text
//!   request_issue ──publish──► coupon-issue-request (partitioned by policy code)
//!                                   │
//!                                   ▼
//!                         IssueMessageHandler::handle
//!                                   │
//!                        terminal failure
//!                                   ▼
//!                       coupon-issue-request-dlt
//! ```
//!
//! Delivery is at-least-once. Messages for the same policy share a
//! partition and are handled in publish order by one consumer.
//!
//! Two transports: [`ChannelQueue`] (in-process, always available) and
//! a Kafka transport behind the `kafka` cargo feature.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CouponError;

pub use memory::{ChannelQueue, PartitionReceiver};

pub const ISSUE_TOPIC: &str = "coupon-issue-request";
pub const ISSUE_DEAD_LETTER_TOPIC: &str = "coupon-issue-request-dlt";

/// Payload of an accepted issue request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueCouponMessage {
    pub coupon_policy_code: String,
    pub user_id: String,
}

impl IssueCouponMessage {
    pub fn new(coupon_policy_code: &str, user_id: &str) -> Self {
        Self {
            coupon_policy_code: coupon_policy_code.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Messages for one policy land on one partition.
    pub fn partition_key(&self) -> &str {
        &self.coupon_policy_code
    }

    pub fn to_json(&self) -> Result<String, CouponError> {
        serde_json::to_string(self)
            .map_err(|e| CouponError::Internal(format!("failed to encode issue message: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self, CouponError> {
        serde_json::from_str(raw)
            .map_err(|e| CouponError::Internal(format!("malformed issue message: {}", e)))
    }
}

/// A message the consumer gave up on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: IssueCouponMessage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait IssuePublisher: Send + Sync {
    /// Resolves once the transport has accepted the message.
    async fn publish(&self, message: &IssueCouponMessage) -> Result<(), CouponError>;

    async fn publish_dead_letter(&self, message: &IssueCouponMessage, reason: &str) -> Result<(), CouponError>;
}

/// Receives one message at a time. The consumer loop does not pull the next
/// message until `handle` returns.
#[async_trait]
pub trait IssueMessageHandler: Send + Sync {
    async fn handle(&self, message: IssueCouponMessage);
}

/// Stable partition for a key (FNV-1a).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .bytes()
        .fold(FNV_OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(FNV_PRIME));
    (hash % partitions as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_snake_case() {
        let msg = IssueCouponMessage::new("SUMMER10", "user-1");
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"coupon_policy_code":"SUMMER10","user_id":"user-1"}"#);
        assert_eq!(IssueCouponMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_malformed_message_is_rejected() {
        assert!(IssueCouponMessage::from_json(r#"{"user_id":"u"}"#).is_err());
    }

    #[test]
    fn test_partition_is_stable_and_bounded() {
        for key in ["SUMMER10", "WINTER20", "A", ""] {
            let p = partition_for(key, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(key, 4));
        }
        assert_eq!(partition_for("SUMMER10", 1), 0);
        assert_eq!(partition_for("SUMMER10", 0), 0);
    }
}

//! Redis-backed quota counter and coupon state cache.
//!
//! Uses a single `ConnectionManager`, which reconnects on its own and
//! multiplexes commands, so clones are cheap and no pool is needed.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{coupon_state_key, decode_coupon, encode_coupon, quota_key, CouponStateCache, QuotaCounter};
use crate::db::Coupon;
use crate::error::CouponError;

const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

/// `DECR` only when the key exists, `nil` otherwise.
const DECREMENT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('DECR', KEYS[1])
end
return false
"#;

/// `INCR` only when the key exists, `nil` otherwise.
const INCREMENT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCR', KEYS[1])
end
return false
"#;

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CouponError> {
        info!("Connecting to Redis...");

        let client = Client::open(redis_url)
            .map_err(|e| CouponError::Internal(format!("Failed to create Redis client: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CouponError::Internal(format!("Failed to connect to Redis: {}", e)))?;

        info!("Redis connection established");
        Ok(Self { connection })
    }

    /// Shared connection handle for the lock service.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl QuotaCounter for RedisCache {
    async fn get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn.get(quota_key(policy_code)).await?;
        Ok(value)
    }

    async fn set(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<(), CouponError> {
        let mut conn = self.connection.clone();
        let _: () = ::redis::cmd("SET")
            .arg(quota_key(policy_code))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn seed(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<bool, CouponError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(quota_key(policy_code))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn decrement_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = Script::new(DECREMENT_IF_EXISTS)
            .key(quota_key(policy_code))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn increment_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = Script::new(INCREMENT_IF_EXISTS)
            .key(quota_key(policy_code))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn ping(&self) -> bool {
        let check = async {
            let mut conn = self.connection.clone();
            let pong: Result<String, _> = ::redis::cmd("PING").query_async(&mut conn).await;
            pong
        };

        match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Redis health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Redis health check timed out");
                false
            }
        }
    }
}

#[async_trait]
impl CouponStateCache for RedisCache {
    async fn put_coupon(&self, coupon: &Coupon, ttl: Duration) -> Result<(), CouponError> {
        let payload = encode_coupon(coupon)?;
        let mut conn = self.connection.clone();
        let _: () = ::redis::cmd("SET")
            .arg(coupon_state_key(&coupon.code))
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_coupon(&self, coupon_code: &str) -> Result<Option<Coupon>, CouponError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(coupon_state_key(coupon_code)).await?;
        raw.as_deref().map(decode_coupon).transpose()
    }

    async fn remove_coupon(&self, coupon_code: &str) -> Result<(), CouponError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(coupon_state_key(coupon_code)).await?;
        Ok(())
    }
}

//! # Utilities Module
//!
//! Helpers shared across the backend: coupon code generation, cache TTL
//! arithmetic, caller id validation and the injectable clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Shortest TTL handed to the cache, used when a policy has already ended.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(1);

/// Maximum accepted length of a caller-supplied user id.
pub const MAX_USER_ID_LEN: usize = 128;

/// Source of "now". Injected so period checks can be tested at exact boundaries.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Generate a globally unique redemption code.
///
/// 32 uppercase hex characters from a v4 UUID.
pub fn generate_coupon_code() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// TTL for a cache entry that must not outlive `end_time`.
///
/// Falls back to [`MIN_CACHE_TTL`] once the policy has ended.
pub fn ttl_until(end_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (end_time - now)
        .to_std()
        .ok()
        .filter(|ttl| *ttl >= MIN_CACHE_TTL)
        .unwrap_or(MIN_CACHE_TTL)
}

/// Validate a caller id taken from the `X-USER-ID` header.
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err("user id must not be empty".to_string());
    }
    if trimmed.len() > MAX_USER_ID_LEN {
        return Err(format!(
            "user id too long: {} (max {})",
            trimmed.len(),
            MAX_USER_ID_LEN
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err("user id contains control characters".to_string());
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coupon_codes_are_unique() {
        let a = generate_coupon_code();
        let b = generate_coupon_code();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_ttl_until_end() {
        let now = Utc::now();
        let ttl = ttl_until(now + chrono::Duration::minutes(10), now);
        assert_eq!(ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_ttl_for_ended_policy_is_minimal() {
        let now = Utc::now();
        assert_eq!(ttl_until(now - chrono::Duration::hours(1), now), MIN_CACHE_TTL);
        assert_eq!(ttl_until(now, now), MIN_CACHE_TTL);
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("user-42").is_ok());
        assert!(validate_user_id("   ").is_err());
        assert!(validate_user_id(&"u".repeat(MAX_USER_ID_LEN + 1)).is_err());
        assert!(validate_user_id("bad\nid").is_err());
    }
}

//! # Issuance Coordinator
//!
//! Drives one issue request through
//! `Received → PolicyValidated → QuotaReserved → Persisted → Acknowledged`,
//! rejecting at any step.
//!
//! ## Admission Strategies
//!
//! | Strategy | Serialization point | Over-issue possible? |
//! |----------|--------------------|----------------------|
//! | `Transactional` | counter reservation, then the policy row lock held through the insert | no |
//! | `CacheAssisted` | distributed lock around the counter decrement | no, if the counter is seeded from the ledger |
//! | `Naive` | none | yes, kept as a regression baseline |
//!
//! Both guarded strategies reserve from the counter first, so a slot held by
//! an accepted queued request is never handed to a synchronous caller. The
//! transactional insert then rechecks the ledger count under the row lock.
//!
//! ## Cache-Assisted Flow
//!
//! ```text
//! lock(policy) ─► decrement ─► Miss? seed from ledger, decrement
//!                    │
//!                 < 0 ? ─► increment, unlock, QuotaExceeded
//!                    │
//!                 unlock ─► insert (detached) ─► failure? increment
//! ```
//!
//! The queued path (`request_issue`) always reserves through the lock and
//! counter, then publishes instead of inserting. The consumer side
//! (`process_issue_message`) inserts through the ledger's exclusive path, so
//! the ledger count is checked again at persist time.
//!
//! Admission runs on the caller's task and stops if the caller goes away.
//! Once admitted, persistence runs on a detached task and always finishes,
//! including its compensation.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::Backends;
use crate::db::{Coupon, CouponPolicy};
use crate::error::CouponError;
use crate::ledger::IssueSnapshot;
use crate::lock::{acquire_with_backoff, LockSettings};
use crate::queue::IssueCouponMessage;
use crate::utils::ttl_until;

/// How the synchronous path decides admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionStrategy {
    /// Count then insert with no serialization. Over-issues under load.
    Naive,
    /// Row lock on the policy for the whole check-and-insert.
    #[default]
    Transactional,
    /// Distributed lock around a cached counter, insert afterwards.
    CacheAssisted,
}

impl AdmissionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionStrategy::Naive => "naive",
            AdmissionStrategy::Transactional => "transactional",
            AdmissionStrategy::CacheAssisted => "cache_assisted",
        }
    }
}

impl fmt::Display for AdmissionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "naive" => Ok(AdmissionStrategy::Naive),
            "transactional" => Ok(AdmissionStrategy::Transactional),
            "cache_assisted" => Ok(AdmissionStrategy::CacheAssisted),
            other => Err(format!(
                "unknown admission strategy '{}' (expected naive, transactional or cache_assisted)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub strategy: AdmissionStrategy,
    pub one_coupon_per_user: bool,
    pub lock: LockSettings,
    /// Upper bound on a broker publish before the request fails closed.
    pub publish_timeout: Duration,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            strategy: AdmissionStrategy::default(),
            one_coupon_per_user: true,
            lock: LockSettings::default(),
            publish_timeout: Duration::from_secs(2),
        }
    }
}

/// Acknowledgement for a queued issue request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssueAccepted {
    pub coupon_policy_code: String,
    pub user_id: String,
    /// Counter value right after this request's reservation.
    pub remaining_quota: i64,
}

#[derive(Clone)]
pub struct IssuanceCoordinator {
    backends: Backends,
    settings: IssuanceSettings,
}

impl IssuanceCoordinator {
    pub fn new(backends: Backends, settings: IssuanceSettings) -> Self {
        info!(
            "Issuance coordinator ready (strategy: {}, one coupon per user: {})",
            settings.strategy, settings.one_coupon_per_user
        );
        Self { backends, settings }
    }

    pub fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    /// Issue a coupon synchronously with the configured strategy.
    pub async fn issue_coupon(&self, policy_code: &str, user_id: &str) -> Result<Coupon, CouponError> {
        debug!(coupon_policy_code = %policy_code, user_id = %user_id, "Issue request received");

        let policy = self.validated_policy(policy_code).await?;

        let issued = match self.settings.strategy {
            AdmissionStrategy::Naive => self.issue_naive(&policy, user_id).await,
            AdmissionStrategy::Transactional => self.issue_transactional(&policy, user_id).await,
            AdmissionStrategy::CacheAssisted => self.issue_cache_assisted(&policy, user_id).await,
        };

        let coupon = issued.map_err(|e| {
            info!(
                coupon_policy_code = %policy.code,
                user_id = %user_id,
                reason = e.code(),
                "Issue request rejected"
            );
            e
        })?;

        info!(
            coupon_policy_code = %policy.code,
            user_id = %user_id,
            coupon_code = %coupon.code,
            "Coupon issued"
        );
        self.cache_coupon_state(&coupon, &policy).await;
        Ok(coupon)
    }

    /// Reserve quota and queue the request for persistence.
    ///
    /// Returns once the message is on the queue. A publish failure or
    /// timeout releases the reservation and fails with `Internal`.
    pub async fn request_issue(&self, policy_code: &str, user_id: &str) -> Result<IssueAccepted, CouponError> {
        let policy = self.validated_policy(policy_code).await?;
        self.ensure_no_existing_coupon(&policy, user_id).await?;

        let remaining_quota = self.reserve_quota(&policy).await?;

        let message = IssueCouponMessage::new(&policy.code, user_id);
        let this = self.clone();
        run_detached(async move { this.publish_reserved(message).await }).await?;

        info!(
            coupon_policy_code = %policy.code,
            user_id = %user_id,
            remaining_quota,
            "Issue request accepted"
        );
        Ok(IssueAccepted {
            coupon_policy_code: policy.code,
            user_id: user_id.to_string(),
            remaining_quota,
        })
    }

    /// Persist a queued issue request.
    ///
    /// Every failure is terminal for the message and is dead-lettered.
    /// The reservation made by `request_issue` is released only on
    /// `Internal`. A `Conflict` is usually a redelivery whose coupon is
    /// already stored and still holds that slot.
    pub async fn process_issue_message(&self, message: &IssueCouponMessage) -> Result<Coupon, CouponError> {
        let code = &message.coupon_policy_code;

        let policy = match self.backends.ledger.find_policy_by_code(code).await {
            Ok(policy) => policy,
            Err(e) => {
                if matches!(e, CouponError::Internal(_)) {
                    self.release_reservation(code).await;
                }
                self.dead_letter(message, &e).await;
                return Err(e);
            }
        };

        let rule = admission_rule(
            message.user_id.clone(),
            self.settings.one_coupon_per_user,
            self.backends.clock.now(),
        );

        match self
            .backends
            .ledger
            .issue_exclusive(&policy.code, &message.user_id, &rule)
            .await
        {
            Ok(coupon) => {
                info!(
                    coupon_policy_code = %policy.code,
                    user_id = %message.user_id,
                    coupon_code = %coupon.code,
                    "Queued coupon persisted"
                );
                self.cache_coupon_state(&coupon, &policy).await;
                Ok(coupon)
            }
            Err(e) => {
                if matches!(e, CouponError::Internal(_)) {
                    self.release_reservation(&policy.code).await;
                }
                self.dead_letter(message, &e).await;
                Err(e)
            }
        }
    }

    /// `Received → PolicyValidated`.
    async fn validated_policy(&self, policy_code: &str) -> Result<CouponPolicy, CouponError> {
        let policy = self.backends.ledger.find_policy_by_code(policy_code).await?;
        let now = self.backends.clock.now();

        if !policy.is_within_issuance_window(now) {
            return Err(CouponError::InvalidPeriod(format!(
                "policy {} issues from {} until {}",
                policy.code, policy.start_time, policy.end_time
            )));
        }
        if policy.total_quantity <= 0 {
            return Err(quota_exceeded(&policy));
        }
        Ok(policy)
    }

    async fn ensure_no_existing_coupon(&self, policy: &CouponPolicy, user_id: &str) -> Result<(), CouponError> {
        if self.settings.one_coupon_per_user
            && self.backends.ledger.user_holds_coupon(policy.id, user_id).await?
        {
            return Err(duplicate_issue(policy, user_id));
        }
        Ok(())
    }

    async fn issue_naive(&self, policy: &CouponPolicy, user_id: &str) -> Result<Coupon, CouponError> {
        self.ensure_no_existing_coupon(policy, user_id).await?;

        let issued = self.backends.ledger.count_issued(policy.id).await?;
        if issued >= i64::from(policy.total_quantity) {
            return Err(quota_exceeded(policy));
        }

        let coupon = Coupon::issue(policy.id, user_id, self.backends.clock.now());
        self.backends.ledger.insert_coupon(&coupon).await
    }

    async fn issue_transactional(&self, policy: &CouponPolicy, user_id: &str) -> Result<Coupon, CouponError> {
        self.ensure_no_existing_coupon(policy, user_id).await?;
        self.reserve_quota(policy).await?;

        let this = self.clone();
        let policy = policy.clone();
        let user_id = user_id.to_string();
        run_detached(async move { this.persist_exclusive(&policy, &user_id).await }).await
    }

    /// `QuotaReserved → Persisted` for the transactional strategy.
    ///
    /// A `QuotaExceeded` from the ledger means the counter was ahead of it,
    /// so the reservation stays spent.
    async fn persist_exclusive(&self, policy: &CouponPolicy, user_id: &str) -> Result<Coupon, CouponError> {
        let rule = admission_rule(
            user_id.to_string(),
            self.settings.one_coupon_per_user,
            self.backends.clock.now(),
        );

        match self.backends.ledger.issue_exclusive(&policy.code, user_id, &rule).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                if !matches!(e, CouponError::QuotaExceeded(_)) {
                    self.release_reservation(&policy.code).await;
                }
                Err(e)
            }
        }
    }

    async fn issue_cache_assisted(&self, policy: &CouponPolicy, user_id: &str) -> Result<Coupon, CouponError> {
        self.ensure_no_existing_coupon(policy, user_id).await?;
        self.reserve_quota(policy).await?;

        let this = self.clone();
        let policy = policy.clone();
        let user_id = user_id.to_string();
        run_detached(async move { this.persist_reserved(&policy, &user_id).await }).await
    }

    /// `QuotaReserved → Persisted` for the cache-assisted strategy.
    async fn persist_reserved(&self, policy: &CouponPolicy, user_id: &str) -> Result<Coupon, CouponError> {
        let coupon = Coupon::issue(policy.id, user_id, self.backends.clock.now());

        match self.backends.ledger.insert_coupon(&coupon).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                warn!(
                    coupon_policy_code = %policy.code,
                    user_id = %user_id,
                    "Insert after reservation failed: {}",
                    e
                );
                self.release_reservation(&policy.code).await;
                Err(match e {
                    CouponError::Conflict(msg) => CouponError::Conflict(msg),
                    CouponError::Internal(msg) => CouponError::Internal(msg),
                    other => CouponError::Internal(other.to_string()),
                })
            }
        }
    }

    /// `PolicyValidated → QuotaReserved` through the lock and counter.
    ///
    /// The lock covers the counter decision only.
    async fn reserve_quota(&self, policy: &CouponPolicy) -> Result<i64, CouponError> {
        let lock = self.backends.lock.as_ref();
        let guard = acquire_with_backoff(lock, &policy.code, &self.settings.lock).await?;

        let decision = self.decide_under_lock(policy).await;
        guard.release(lock).await;
        decision
    }

    async fn decide_under_lock(&self, policy: &CouponPolicy) -> Result<i64, CouponError> {
        let remaining = self.decrement_counter(policy).await?;
        if remaining < 0 {
            self.release_reservation(&policy.code).await;
            return Err(quota_exceeded(policy));
        }
        debug!("Reserved quota for {} ({} left)", policy.code, remaining);
        Ok(remaining)
    }

    /// Decrement, seeding the counter from the ledger on a Miss.
    async fn decrement_counter(&self, policy: &CouponPolicy) -> Result<i64, CouponError> {
        let counter = &self.backends.counter;
        if let Some(remaining) = counter.decrement_and_get(&policy.code).await? {
            return Ok(remaining);
        }

        let issued = self.backends.ledger.count_issued(policy.id).await?;
        let seed = policy.remaining_after(issued);
        let ttl = ttl_until(policy.end_time, self.backends.clock.now());
        if counter.seed(&policy.code, seed, ttl).await? {
            info!(
                "Seeded quota counter for {} at {} ({} issued, ttl {:?})",
                policy.code, seed, issued, ttl
            );
        }

        counter.decrement_and_get(&policy.code).await?.ok_or_else(|| {
            CouponError::Internal(format!("quota counter for {} vanished after seeding", policy.code))
        })
    }

    /// Compensation: hand a reserved slot back to the counter.
    async fn release_reservation(&self, policy_code: &str) {
        match self.backends.counter.increment_and_get(policy_code).await {
            Ok(Some(remaining)) => debug!("Released reservation for {} ({} left)", policy_code, remaining),
            Ok(None) => debug!("No quota counter for {}, nothing to release", policy_code),
            Err(e) => error!("Failed to release reservation for {}: {}", policy_code, e),
        }
    }

    async fn publish_reserved(&self, message: IssueCouponMessage) -> Result<(), CouponError> {
        let published = match timeout(
            self.settings.publish_timeout,
            self.backends.publisher.publish(&message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CouponError::Internal(format!(
                "publish timed out after {:?}",
                self.settings.publish_timeout
            ))),
        };

        if let Err(e) = published {
            error!(
                coupon_policy_code = %message.coupon_policy_code,
                user_id = %message.user_id,
                "Failed to queue issue request: {}",
                e
            );
            self.release_reservation(&message.coupon_policy_code).await;
            return Err(CouponError::Internal(format!("issue request not queued: {}", e)));
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &IssueCouponMessage, reason: &CouponError) {
        warn!(
            coupon_policy_code = %message.coupon_policy_code,
            user_id = %message.user_id,
            "Dead-lettering issue request: {}",
            reason
        );
        if let Err(e) = self
            .backends
            .publisher
            .publish_dead_letter(message, &reason.to_string())
            .await
        {
            error!("Failed to dead-letter issue request: {}", e);
        }
    }

    async fn cache_coupon_state(&self, coupon: &Coupon, policy: &CouponPolicy) {
        let ttl = ttl_until(policy.end_time, self.backends.clock.now());
        if let Err(e) = self.backends.state_cache.put_coupon(coupon, ttl).await {
            warn!("Failed to cache state of coupon {}: {}", coupon.code, e);
        }
    }
}

/// The check run while the policy is exclusively held.
fn admission_rule(
    user_id: String,
    one_coupon_per_user: bool,
    now: DateTime<Utc>,
) -> impl Fn(&CouponPolicy, &IssueSnapshot) -> Result<Coupon, CouponError> + Send + Sync + 'static {
    move |policy: &CouponPolicy, snapshot: &IssueSnapshot| {
        if one_coupon_per_user && snapshot.user_holds_coupon {
            return Err(duplicate_issue(policy, &user_id));
        }
        if snapshot.issued >= i64::from(policy.total_quantity) {
            return Err(quota_exceeded(policy));
        }
        Ok(Coupon::issue(policy.id, &user_id, now))
    }
}

/// Run `task` on its own tokio task so dropping the caller cannot cut it short.
async fn run_detached<T, F>(task: F) -> Result<T, CouponError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CouponError>> + Send + 'static,
{
    tokio::spawn(task)
        .await
        .map_err(|e| CouponError::Internal(format!("persistence task failed: {}", e)))?
}

fn quota_exceeded(policy: &CouponPolicy) -> CouponError {
    CouponError::QuotaExceeded(format!(
        "policy {} has issued all {} coupons",
        policy.code, policy.total_quantity
    ))
}

fn duplicate_issue(policy: &CouponPolicy, user_id: &str) -> CouponError {
    CouponError::Conflict(format!(
        "user {} already holds a coupon for policy {}",
        user_id, policy.code
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::db::CouponStatus;
    use crate::ledger::memory::fixtures::open_policy;
    use crate::ledger::{CouponLedger, InMemoryLedger};
    use crate::lock::lock_key;
    use crate::queue::{ChannelQueue, IssuePublisher, PartitionReceiver};
    use crate::utils::test_clock::ManualClock;

    struct Harness {
        coordinator: IssuanceCoordinator,
        backends: Backends,
        ledger: Arc<InMemoryLedger>,
        queue: Arc<ChannelQueue>,
        receivers: Vec<PartitionReceiver>,
        policy: CouponPolicy,
    }

    async fn harness(strategy: AdmissionStrategy, quantity: i32, one_coupon_per_user: bool) -> Harness {
        build(strategy, quantity, one_coupon_per_user, InMemoryLedger::new(one_coupon_per_user)).await
    }

    async fn build(
        strategy: AdmissionStrategy,
        quantity: i32,
        one_coupon_per_user: bool,
        ledger: InMemoryLedger,
    ) -> Harness {
        let ledger = Arc::new(ledger);
        let policy = open_policy("SUMMER10", quantity, Utc::now());
        ledger.add_policy(policy.clone()).await;

        let (queue, receivers) = ChannelQueue::new(2, 64);
        let queue = Arc::new(queue);
        let backends = Backends::in_memory(ledger.clone(), queue.clone());
        let settings = IssuanceSettings {
            strategy,
            one_coupon_per_user,
            ..IssuanceSettings::default()
        };

        Harness {
            coordinator: IssuanceCoordinator::new(backends.clone(), settings),
            backends,
            ledger,
            queue,
            receivers,
            policy,
        }
    }

    async fn fire_concurrently(
        coordinator: &IssuanceCoordinator,
        users: &[&str],
    ) -> Vec<Result<Coupon, CouponError>> {
        let handles: Vec<_> = users
            .iter()
            .map(|user| {
                let coordinator = coordinator.clone();
                let user = user.to_string();
                tokio::spawn(async move { coordinator.issue_coupon("SUMMER10", &user).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    fn tally(results: &[Result<Coupon, CouponError>]) -> (usize, usize) {
        let issued = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(CouponError::QuotaExceeded(_))))
            .count();
        (issued, exhausted)
    }

    const FIVE_USERS: [&str; 5] = ["u1", "u2", "u3", "u4", "u5"];

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_quota_bound_transactional() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;

        let results = fire_concurrently(&h.coordinator, &FIVE_USERS).await;

        assert_eq!(tally(&results), (3, 2));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 3);
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_quota_bound_cache_assisted() {
        let h = harness(AdmissionStrategy::CacheAssisted, 3, true).await;

        let results = fire_concurrently(&h.coordinator, &FIVE_USERS).await;

        assert_eq!(tally(&results), (3, 2));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 3);
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_naive_strategy_over_issues() {
        let ledger = InMemoryLedger::new(false).with_latency(Duration::from_millis(10));
        let h = build(AdmissionStrategy::Naive, 3, false, ledger).await;

        let results = fire_concurrently(&h.coordinator, &FIVE_USERS).await;

        let (issued, _) = tally(&results);
        assert!(issued > 3, "naive admission issued only {}", issued);
        assert!(h.ledger.count_issued(h.policy.id).await.unwrap() > 3);
    }

    #[tokio::test]
    async fn test_naive_strategy_respects_quota_sequentially() {
        let h = harness(AdmissionStrategy::Naive, 1, false).await;

        h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();
        let err = h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
        assert!(matches!(err, CouponError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_failed_insert_restores_counter() {
        let h = harness(AdmissionStrategy::CacheAssisted, 3, true).await;
        h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));

        h.ledger.fail_next_inserts(1);
        let err = h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
        assert!(matches!(err, CouponError::Internal(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));

        h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap();
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_exhausted_counter_is_compensated() {
        let h = harness(AdmissionStrategy::CacheAssisted, 1, true).await;
        h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();

        let err = h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
        assert!(matches!(err, CouponError::QuotaExceeded(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_counter_seeded_from_ledger_count() {
        let h = harness(AdmissionStrategy::CacheAssisted, 5, false).await;
        for user in ["a", "b"] {
            h.ledger
                .insert_coupon(&Coupon::issue(h.policy.id, user, Utc::now()))
                .await
                .unwrap();
        }

        h.coordinator.issue_coupon("SUMMER10", "c").await.unwrap();
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_zero_quantity_always_rejects() {
        for strategy in [
            AdmissionStrategy::Naive,
            AdmissionStrategy::Transactional,
            AdmissionStrategy::CacheAssisted,
        ] {
            let h = harness(strategy, 0, true).await;
            let err = h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap_err();
            assert!(matches!(err, CouponError::QuotaExceeded(_)), "{}: {:?}", strategy, err);
        }
    }

    #[tokio::test]
    async fn test_unknown_policy_is_not_found() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;
        let err = h.coordinator.issue_coupon("NOPE", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_period_boundary() {
        let mut h = harness(AdmissionStrategy::Transactional, 3, true).await;
        let clock = Arc::new(ManualClock::new(h.policy.end_time));
        h.backends = h.backends.clone().with_clock(clock.clone());
        let coordinator = IssuanceCoordinator::new(h.backends.clone(), h.coordinator.settings().clone());

        let err = coordinator.issue_coupon("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidPeriod(_)));

        clock.set(h.policy.end_time - chrono::Duration::nanoseconds(1));
        let coupon = coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();
        assert_eq!(coupon.status, CouponStatus::Available);

        clock.set(h.policy.start_time - chrono::Duration::nanoseconds(1));
        let err = coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidPeriod(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_reports_too_many_requests() {
        let h = harness(AdmissionStrategy::CacheAssisted, 3, true).await;
        let key = lock_key("SUMMER10");
        assert!(h
            .backends
            .lock
            .try_acquire(&key, "someone-else", Duration::from_secs(30))
            .await
            .unwrap());

        let err = h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::TooManyRequests(_)));
        assert!(err.is_retryable());
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), None);
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_summer10_end_to_end() {
        for strategy in [AdmissionStrategy::Transactional, AdmissionStrategy::CacheAssisted] {
            let h = harness(strategy, 3, true).await;

            let results = fire_concurrently(&h.coordinator, &FIVE_USERS).await;
            assert_eq!(tally(&results), (3, 2), "{}", strategy);

            let winners: Vec<&Coupon> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert!(winners.iter().all(|c| c.status == CouponStatus::Available));
            let codes: HashSet<&str> = winners.iter().map(|c| c.code.as_str()).collect();
            assert_eq!(codes.len(), 3);

            let err = h
                .coordinator
                .issue_coupon("SUMMER10", &winners[0].user_id)
                .await
                .unwrap_err();
            assert!(matches!(err, CouponError::Conflict(_)), "{}: {:?}", strategy, err);
        }
    }

    #[tokio::test]
    async fn test_issued_coupon_state_is_cached() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;
        let coupon = h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();

        let cached = h.backends.state_cache.get_coupon(&coupon.code).await.unwrap();
        assert_eq!(cached, Some(coupon));
    }

    #[tokio::test]
    async fn test_request_then_process_persists_once() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;

        let accepted = h.coordinator.request_issue("SUMMER10", "u1").await.unwrap();
        assert_eq!(accepted.remaining_quota, 2);
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 0);

        let message = IssueCouponMessage::new("SUMMER10", "u1");
        let coupon = h.coordinator.process_issue_message(&message).await.unwrap();
        assert_eq!(coupon.user_id, "u1");
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 1);
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));

        // Redelivery of the same message.
        let err = h.coordinator.process_issue_message(&message).await.unwrap_err();
        assert!(matches!(err, CouponError::Conflict(_)));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 1);
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));
        assert_eq!(h.queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_free_a_slot() {
        let h = harness(AdmissionStrategy::CacheAssisted, 1, true).await;
        let message = IssueCouponMessage::new("SUMMER10", "u1");

        h.coordinator.request_issue("SUMMER10", "u1").await.unwrap();
        h.coordinator.process_issue_message(&message).await.unwrap();
        let err = h.coordinator.process_issue_message(&message).await.unwrap_err();
        assert!(matches!(err, CouponError::Conflict(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));

        let err = h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
        assert!(matches!(err, CouponError::QuotaExceeded(_)));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accepted_request_keeps_its_slot() {
        for strategy in [AdmissionStrategy::Transactional, AdmissionStrategy::CacheAssisted] {
            let h = harness(strategy, 1, true).await;

            h.coordinator.request_issue("SUMMER10", "u1").await.unwrap();
            let err = h.coordinator.issue_coupon("SUMMER10", "u2").await.unwrap_err();
            assert!(matches!(err, CouponError::QuotaExceeded(_)), "{}: {:?}", strategy, err);

            let coupon = h
                .coordinator
                .process_issue_message(&IssueCouponMessage::new("SUMMER10", "u1"))
                .await
                .unwrap();
            assert_eq!(coupon.user_id, "u1");
            assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 1);
            assert!(h.queue.dead_letters().is_empty());
        }
    }

    #[tokio::test]
    async fn test_transactional_rechecks_ledger_when_counter_is_ahead() {
        let h = harness(AdmissionStrategy::Transactional, 1, true).await;
        h.ledger
            .insert_coupon(&Coupon::issue(h.policy.id, "walk-in", Utc::now()))
            .await
            .unwrap();
        h.backends
            .counter
            .set("SUMMER10", 1, Duration::from_secs(60))
            .await
            .unwrap();

        let err = h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::QuotaExceeded(_)));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 1);
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_transactional_insert_failure_releases_reservation() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;
        h.ledger.fail_next_inserts(1);

        let err = h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::Internal(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(3));
        assert_eq!(h.ledger.count_issued(h.policy.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_request_issue_rejects_duplicate_before_reserving() {
        let h = harness(AdmissionStrategy::Transactional, 3, true).await;
        h.coordinator.issue_coupon("SUMMER10", "u1").await.unwrap();

        let err = h.coordinator.request_issue("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::Conflict(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_process_when_ledger_full_does_not_compensate() {
        let h = harness(AdmissionStrategy::Transactional, 1, true).await;
        h.coordinator.request_issue("SUMMER10", "u1").await.unwrap();
        h.ledger
            .insert_coupon(&Coupon::issue(h.policy.id, "walk-in", Utc::now()))
            .await
            .unwrap();

        let err = h
            .coordinator
            .process_issue_message(&IssueCouponMessage::new("SUMMER10", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CouponError::QuotaExceeded(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(0));
        assert_eq!(h.queue.dead_letters()[0].message.user_id, "u1");
    }

    #[tokio::test]
    async fn test_process_unknown_policy_is_dead_lettered() {
        let h = harness(AdmissionStrategy::Transactional, 1, true).await;

        let err = h
            .coordinator
            .process_issue_message(&IssueCouponMessage::new("GONE", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CouponError::NotFound(_)));
        assert_eq!(h.queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_fails_closed_and_compensates() {
        let mut h = harness(AdmissionStrategy::Transactional, 3, true).await;
        h.receivers.clear();

        let err = h.coordinator.request_issue("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::Internal(_)));
        assert_eq!(h.backends.counter.get("SUMMER10").await.unwrap(), Some(3));
    }

    struct StalledPublisher;

    #[async_trait]
    impl IssuePublisher for StalledPublisher {
        async fn publish(&self, _: &IssueCouponMessage) -> Result<(), CouponError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn publish_dead_letter(&self, _: &IssueCouponMessage, _: &str) -> Result<(), CouponError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_fails_closed_and_compensates() {
        let ledger = Arc::new(InMemoryLedger::new(true));
        ledger.add_policy(open_policy("SUMMER10", 3, Utc::now())).await;
        let backends = Backends::in_memory(ledger, Arc::new(StalledPublisher));
        let coordinator = IssuanceCoordinator::new(
            backends.clone(),
            IssuanceSettings {
                publish_timeout: Duration::from_millis(100),
                ..IssuanceSettings::default()
            },
        );

        let err = coordinator.request_issue("SUMMER10", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::Internal(_)));
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(3));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("naive".parse::<AdmissionStrategy>().unwrap(), AdmissionStrategy::Naive);
        assert_eq!(
            "Cache-Assisted".parse::<AdmissionStrategy>().unwrap(),
            AdmissionStrategy::CacheAssisted
        );
        assert_eq!(
            " transactional ".parse::<AdmissionStrategy>().unwrap(),
            AdmissionStrategy::Transactional
        );
        assert!("optimistic".parse::<AdmissionStrategy>().is_err());
        assert_eq!(AdmissionStrategy::default(), AdmissionStrategy::Transactional);
    }
}

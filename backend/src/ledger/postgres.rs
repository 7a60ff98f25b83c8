//! PostgreSQL-backed ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{coupon_not_found, policy_not_found, stale_transition, AdmissionRule, CouponLedger, IssueSnapshot};
use crate::db::{queries, Coupon, CouponPolicy, CouponStatus, Database, DatabaseError};
use crate::error::CouponError;

#[derive(Clone)]
pub struct PostgresLedger {
    db: Database,
}

impl PostgresLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CouponLedger for PostgresLedger {
    async fn find_policy_by_code(&self, code: &str) -> Result<CouponPolicy, CouponError> {
        let client = self.db.client().await?;
        queries::get_policy_by_code(&**client, code)
            .await?
            .ok_or_else(|| policy_not_found(code))
    }

    async fn find_policy_by_id(&self, id: Uuid) -> Result<CouponPolicy, CouponError> {
        let client = self.db.client().await?;
        queries::get_policy_by_id(&**client, id)
            .await?
            .ok_or_else(|| policy_not_found(&id.to_string()))
    }

    async fn list_active_policies(&self, now: DateTime<Utc>) -> Result<Vec<CouponPolicy>, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::get_active_policies(&**client, now).await?)
    }

    async fn count_issued(&self, policy_id: Uuid) -> Result<i64, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::count_issued_coupons(&**client, policy_id).await?)
    }

    async fn user_holds_coupon(&self, policy_id: Uuid, user_id: &str) -> Result<bool, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::user_has_coupon(&**client, policy_id, user_id).await?)
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> Result<Coupon, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::insert_coupon(&**client, coupon).await?)
    }

    async fn issue_exclusive(
        &self,
        policy_code: &str,
        user_id: &str,
        admit: &AdmissionRule<'_>,
    ) -> Result<Coupon, CouponError> {
        let mut client = self.db.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let policy = queries::get_policy_by_code_for_update(&*tx, policy_code)
            .await?
            .ok_or_else(|| policy_not_found(policy_code))?;

        let snapshot = IssueSnapshot {
            issued: queries::count_issued_coupons(&*tx, policy.id).await?,
            user_holds_coupon: queries::user_has_coupon(&*tx, policy.id, user_id).await?,
        };
        debug!(
            "Exclusive read of {}: {}/{} issued",
            policy.code, snapshot.issued, policy.total_quantity
        );

        // Dropping `tx` without commit rolls back and frees the row lock.
        let coupon = admit(&policy, &snapshot)?;
        let stored = queries::insert_coupon(&*tx, &coupon).await?;

        tx.commit().await.map_err(|e| {
            warn!("Commit failed for policy {}: {}", policy.code, e);
            CouponError::from(DatabaseError::from(e))
        })?;

        Ok(stored)
    }

    async fn find_coupon_by_code(&self, code: &str) -> Result<Coupon, CouponError> {
        let client = self.db.client().await?;
        queries::get_coupon_by_code(&**client, code)
            .await?
            .ok_or_else(|| coupon_not_found(code))
    }

    async fn update_coupon(&self, coupon: &Coupon, expected: CouponStatus) -> Result<Coupon, CouponError> {
        let client = self.db.client().await?;
        queries::update_coupon_status(&**client, coupon, expected)
            .await?
            .ok_or_else(|| stale_transition(coupon, expected))
    }

    async fn find_coupons_by_user(&self, user_id: &str) -> Result<Vec<Coupon>, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::get_coupons_by_user(&**client, user_id).await?)
    }

    async fn find_coupons_by_policy(&self, policy_id: Uuid) -> Result<Vec<Coupon>, CouponError> {
        let client = self.db.client().await?;
        Ok(queries::get_coupons_by_policy(&**client, policy_id).await?)
    }

    async fn ping(&self) -> bool {
        match self.db.client().await {
            Ok(client) => client.query_one("SELECT 1", &[]).await.is_ok(),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                false
            }
        }
    }
}

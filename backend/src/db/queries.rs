//! # Database Queries
//!
//! All SQL the ledger runs. Functions are generic over
//! [`GenericClient`] so the same statement works on a pooled client and
//! inside a transaction.
//!
//! ## Query Organization
//!
//! - `*_policy*` - `coupon_policies` reads
//! - `*_coupon*` - `coupons` reads and writes

use chrono::{DateTime, Utc};
use tokio_postgres::{GenericClient, Row};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::DatabaseError;

const POLICY_COLUMNS: &str = r#"
    id, code, name, description, total_quantity, start_time, end_time,
    discount_type, discount_value, minimum_order_amount, maximum_discount_amount,
    created_at, updated_at
"#;

const COUPON_COLUMNS: &str = r#"
    id, code, status, used_at, user_id, order_id, coupon_policy_id, created_at, updated_at
"#;

// ============================================
// HELPER FUNCTIONS
// ============================================

fn row_to_policy(row: &Row) -> Result<CouponPolicy, DatabaseError> {
    let discount_type: String = row.get("discount_type");
    Ok(CouponPolicy {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        description: row.get("description"),
        total_quantity: row.get("total_quantity"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        discount_type: discount_type
            .parse()
            .map_err(|e| DatabaseError::InvalidData(format!("{}", e)))?,
        discount_value: row.get("discount_value"),
        minimum_order_amount: row.get("minimum_order_amount"),
        maximum_discount_amount: row.get("maximum_discount_amount"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_coupon(row: &Row) -> Result<Coupon, DatabaseError> {
    let status: String = row.get("status");
    Ok(Coupon {
        id: row.get("id"),
        code: row.get("code"),
        status: status
            .parse()
            .map_err(|e| DatabaseError::InvalidData(format!("{}", e)))?,
        used_at: row.get("used_at"),
        user_id: row.get("user_id"),
        order_id: row.get("order_id"),
        coupon_policy_id: row.get("coupon_policy_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn rows_to_coupons(rows: &[Row]) -> Result<Vec<Coupon>, DatabaseError> {
    rows.iter().map(row_to_coupon).collect()
}

// ============================================
// POLICY QUERIES
// ============================================

/// Get a policy by its code.
pub async fn get_policy_by_code<C: GenericClient>(
    client: &C,
    code: &str,
) -> Result<Option<CouponPolicy>, DatabaseError> {
    debug!("Fetching coupon policy: {}", code);

    let sql = format!("SELECT {} FROM coupon_policies WHERE code = $1", POLICY_COLUMNS);
    let row = client.query_opt(sql.as_str(), &[&code]).await?;

    row.as_ref().map(row_to_policy).transpose()
}

/// Get a policy by code and take a row lock on it.
///
/// Must run inside a transaction. Concurrent callers for the same policy
/// block here until the holder commits or rolls back.
pub async fn get_policy_by_code_for_update<C: GenericClient>(
    client: &C,
    code: &str,
) -> Result<Option<CouponPolicy>, DatabaseError> {
    debug!("Locking coupon policy: {}", code);

    let sql = format!(
        "SELECT {} FROM coupon_policies WHERE code = $1 FOR UPDATE",
        POLICY_COLUMNS
    );
    let row = client.query_opt(sql.as_str(), &[&code]).await?;

    row.as_ref().map(row_to_policy).transpose()
}

/// Get a policy by id.
pub async fn get_policy_by_id<C: GenericClient>(
    client: &C,
    id: Uuid,
) -> Result<Option<CouponPolicy>, DatabaseError> {
    let sql = format!("SELECT {} FROM coupon_policies WHERE id = $1", POLICY_COLUMNS);
    let row = client.query_opt(sql.as_str(), &[&id]).await?;

    row.as_ref().map(row_to_policy).transpose()
}

/// Policies whose issuance window contains `now`.
pub async fn get_active_policies<C: GenericClient>(
    client: &C,
    now: DateTime<Utc>,
) -> Result<Vec<CouponPolicy>, DatabaseError> {
    debug!("Fetching active coupon policies at {}", now);

    let sql = format!(
        "SELECT {} FROM coupon_policies WHERE start_time <= $1 AND end_time > $1 ORDER BY code",
        POLICY_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[&now]).await?;

    rows.iter().map(row_to_policy).collect()
}

// ============================================
// COUPON QUERIES
// ============================================

/// Live coupons (not `CANCELLED`) under a policy.
pub async fn count_issued_coupons<C: GenericClient>(
    client: &C,
    policy_id: Uuid,
) -> Result<i64, DatabaseError> {
    let row = client
        .query_one(
            r#"
            SELECT COUNT(*) AS issued
            FROM coupons
            WHERE coupon_policy_id = $1 AND status <> 'CANCELLED'
            "#,
            &[&policy_id],
        )
        .await?;

    Ok(row.get("issued"))
}

/// Whether `user_id` holds any coupon under the policy, in any status.
pub async fn user_has_coupon<C: GenericClient>(
    client: &C,
    policy_id: Uuid,
    user_id: &str,
) -> Result<bool, DatabaseError> {
    let row = client
        .query_one(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM coupons WHERE coupon_policy_id = $1 AND user_id = $2
            ) AS held
            "#,
            &[&policy_id, &user_id],
        )
        .await?;

    Ok(row.get("held"))
}

/// Insert a new coupon and return the stored row.
pub async fn insert_coupon<C: GenericClient>(
    client: &C,
    coupon: &Coupon,
) -> Result<Coupon, DatabaseError> {
    debug!("Inserting coupon {} for user {}", coupon.code, coupon.user_id);

    let sql = format!(
        r#"
        INSERT INTO coupons (
            id, code, status, used_at, user_id, order_id, coupon_policy_id, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {}
        "#,
        COUPON_COLUMNS
    );
    let row = client
        .query_one(
            sql.as_str(),
            &[
                &coupon.id,
                &coupon.code,
                &coupon.status.as_str(),
                &coupon.used_at,
                &coupon.user_id,
                &coupon.order_id,
                &coupon.coupon_policy_id,
                &coupon.created_at,
                &coupon.updated_at,
            ],
        )
        .await?;

    row_to_coupon(&row)
}

/// Get a coupon by its redemption code.
pub async fn get_coupon_by_code<C: GenericClient>(
    client: &C,
    code: &str,
) -> Result<Option<Coupon>, DatabaseError> {
    debug!("Fetching coupon: {}", code);

    let sql = format!("SELECT {} FROM coupons WHERE code = $1", COUPON_COLUMNS);
    let row = client.query_opt(sql.as_str(), &[&code]).await?;

    row.as_ref().map(row_to_coupon).transpose()
}

/// Write a coupon's lifecycle fields if it is still in `expected` status.
///
/// Returns `None` when the row moved on since it was read.
pub async fn update_coupon_status<C: GenericClient>(
    client: &C,
    coupon: &Coupon,
    expected: CouponStatus,
) -> Result<Option<Coupon>, DatabaseError> {
    debug!(
        "Updating coupon {}: {} -> {}",
        coupon.code, expected, coupon.status
    );

    let sql = format!(
        r#"
        UPDATE coupons
        SET status = $2, used_at = $3, order_id = $4, updated_at = $5
        WHERE id = $1 AND status = $6
        RETURNING {}
        "#,
        COUPON_COLUMNS
    );
    let row = client
        .query_opt(
            sql.as_str(),
            &[
                &coupon.id,
                &coupon.status.as_str(),
                &coupon.used_at,
                &coupon.order_id,
                &coupon.updated_at,
                &expected.as_str(),
            ],
        )
        .await?;

    row.as_ref().map(row_to_coupon).transpose()
}

/// All coupons held by a user, newest first.
pub async fn get_coupons_by_user<C: GenericClient>(
    client: &C,
    user_id: &str,
) -> Result<Vec<Coupon>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM coupons WHERE user_id = $1 ORDER BY created_at DESC",
        COUPON_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[&user_id]).await?;

    rows_to_coupons(&rows)
}

/// All coupons issued under a policy, newest first.
pub async fn get_coupons_by_policy<C: GenericClient>(
    client: &C,
    policy_id: Uuid,
) -> Result<Vec<Coupon>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM coupons WHERE coupon_policy_id = $1 ORDER BY created_at DESC",
        COUPON_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[&policy_id]).await?;

    rows_to_coupons(&rows)
}

//! Coupon Usage Ledger
//!
//! Owns the `times_used` counter of every coupon. Each reservation or release
//! is a single version-guarded write: the row is updated only if its version
//! still matches the one that was read, and a lost race surfaces as
//! `ServiceError::Conflict` instead of blocking or overwriting.
//!
//! The `*_on` functions take any connection so the application service can
//! run them inside its own transaction; [`CouponLedger`] runs them directly
//! against the pool.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::coupon::{self, Entity as Coupon, Model as CouponModel};
use crate::errors::ServiceError;

async fn load<C: ConnectionTrait>(conn: &C, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
    Coupon::find_by_id(coupon_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))
}

/// Writes `times_used` for the coupon if its version is still `snapshot.version`.
async fn write_usage<C: ConnectionTrait>(
    conn: &C,
    snapshot: &CouponModel,
    times_used: i32,
) -> Result<CouponModel, ServiceError> {
    let now = Utc::now();
    let result = Coupon::update_many()
        .col_expr(coupon::Column::TimesUsed, Expr::value(times_used))
        .col_expr(coupon::Column::Version, Expr::value(snapshot.version + 1))
        .col_expr(coupon::Column::UpdatedAt, Expr::value(now))
        .filter(coupon::Column::Id.eq(snapshot.id))
        .filter(coupon::Column::Version.eq(snapshot.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        counter!("storefront_coupons.ledger.conflict", 1);
        warn!(
            coupon_id = %snapshot.id,
            expected_version = snapshot.version,
            "Coupon usage changed concurrently"
        );
        return Err(ServiceError::Conflict(format!(
            "Coupon {} was modified concurrently",
            snapshot.id
        )));
    }

    Ok(CouponModel {
        times_used,
        version: snapshot.version + 1,
        updated_at: now,
        ..snapshot.clone()
    })
}

/// Takes one use of the coupon as read in `snapshot`.
pub async fn reserve_on<C: ConnectionTrait>(
    conn: &C,
    snapshot: &CouponModel,
) -> Result<CouponModel, ServiceError> {
    if !snapshot.has_capacity() {
        counter!("storefront_coupons.ledger.capacity_exceeded", 1);
        return Err(ServiceError::CapacityExceeded(format!(
            "Coupon {} has reached its usage limit",
            snapshot.code
        )));
    }

    let reserved = write_usage(conn, snapshot, snapshot.times_used + 1).await?;
    debug!(coupon_id = %reserved.id, times_used = reserved.times_used, "Coupon use reserved");
    Ok(reserved)
}

/// Gives back one use of the coupon as read in `snapshot`, never going below zero.
pub async fn release_on<C: ConnectionTrait>(
    conn: &C,
    snapshot: &CouponModel,
) -> Result<CouponModel, ServiceError> {
    if snapshot.times_used <= 0 {
        warn!(coupon_id = %snapshot.id, "Release requested for unused coupon");
        return Ok(snapshot.clone());
    }

    let released = write_usage(conn, snapshot, snapshot.times_used - 1).await?;
    debug!(coupon_id = %released.id, times_used = released.times_used, "Coupon use released");
    Ok(released)
}

/// Reads the coupon and reserves one use of it.
pub async fn try_reserve_on<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
) -> Result<CouponModel, ServiceError> {
    let snapshot = load(conn, coupon_id).await?;
    reserve_on(conn, &snapshot).await
}

/// Reads the coupon and releases one use of it.
pub async fn try_release_on<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
) -> Result<CouponModel, ServiceError> {
    let snapshot = load(conn, coupon_id).await?;
    release_on(conn, &snapshot).await
}

/// Usage ledger working directly on the pool, one short write per call.
#[derive(Debug, Clone)]
pub struct CouponLedger {
    db_pool: Arc<DbPool>,
}

impl CouponLedger {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Reserves one use. Fails with `CapacityExceeded` when the cap is reached,
    /// `NotFound` for an unknown coupon and `Conflict` when another writer won.
    #[instrument(skip(self))]
    pub async fn try_reserve(&self, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
        try_reserve_on(&*self.db_pool, coupon_id).await
    }

    /// Releases one use, floored at zero.
    #[instrument(skip(self))]
    pub async fn release(&self, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
        try_release_on(&*self.db_pool, coupon_id).await
    }
}

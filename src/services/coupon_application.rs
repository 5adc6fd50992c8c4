//! Coupon Application Service
//!
//! Applying a coupon is one transaction: look the coupon up among the ones
//! dated for today, price the order, hand the previous coupon's use back,
//! take a use of the new one and store the order's new total. Every write is
//! version-guarded; any failure drops the transaction and nothing persists.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, TransactionTrait};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::coupon::Entity as Coupon;
use crate::entities::order::{self, Entity as OrderEntity, Model as OrderModel};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::order_repository::OrderWithItems;
use crate::services::category_hierarchy::CategoryHierarchyResolver;
use crate::services::coupon_ledger::{release_on, reserve_on, try_release_on};
use crate::services::coupons::{find_redeemable_by_code, load_rule};
use crate::services::discount::{compute_final_total, settle_total, PricedItem, PricedOrder};

const DEFAULT_CURRENCY_SCALE: u32 = 2;

/// Builds the calculator's view of an order, resolving each product's category chain.
pub async fn price_order(
    resolver: &CategoryHierarchyResolver,
    order: &OrderWithItems,
) -> Result<PricedOrder, ServiceError> {
    let product_ids: Vec<Uuid> = order.items.iter().map(|item| item.product_id).collect();
    let names = resolver.ancestor_names_by_product(&product_ids).await?;

    let items = order
        .items
        .iter()
        .map(|item| {
            let category_names = names.get(&item.product_id).cloned().unwrap_or_default();
            PricedItem::from_order_item(item, category_names)
        })
        .collect();

    Ok(PricedOrder {
        sub_total: order.order.sub_total,
        items,
    })
}

/// Writes the order's coupon and total if its version is still `order.version`.
async fn store_order_total<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    coupon_id: Option<Uuid>,
    final_total: Decimal,
) -> Result<OrderModel, ServiceError> {
    let now = Utc::now();
    let result = OrderEntity::update_many()
        .col_expr(order::Column::CouponId, Expr::value(coupon_id))
        .col_expr(order::Column::FinalTotal, Expr::value(final_total))
        .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
        .col_expr(order::Column::Version, Expr::value(order.version + 1))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(
            order_id = %order.id,
            expected_version = order.version,
            "Order changed concurrently"
        );
        return Err(ServiceError::Conflict(format!(
            "Order {} was modified concurrently",
            order.id
        )));
    }

    Ok(OrderModel {
        coupon_id,
        final_total,
        updated_at: Some(now),
        version: order.version + 1,
        ..order.clone()
    })
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, ServiceError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(ServiceError::Conflict(_)) => "conflict",
        Err(ServiceError::CapacityExceeded(_)) => "capacity_exceeded",
        Err(ServiceError::NotFound(_)) => "not_found",
        Err(_) => "error",
    };
    counter!("storefront_coupons.coupon_operations", 1, "operation" => operation, "outcome" => outcome);
}

#[derive(Clone)]
pub struct CouponApplicationService {
    db_pool: Arc<DbPool>,
    resolver: CategoryHierarchyResolver,
    event_sender: Option<Arc<EventSender>>,
    currency_scale: u32,
}

impl CouponApplicationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        resolver: CategoryHierarchyResolver,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            resolver,
            event_sender,
            currency_scale: DEFAULT_CURRENCY_SCALE,
        }
    }

    /// Number of decimal places stored totals are rounded to.
    pub fn with_currency_scale(mut self, currency_scale: u32) -> Self {
        self.currency_scale = currency_scale;
        self
    }

    /// Applies the coupon with `coupon_code` to `order`.
    ///
    /// `order` is the caller's snapshot; if the stored order has moved past its
    /// version the call fails with `Conflict`. An unknown, expired or not yet
    /// started code fails with `NotFound` and a used-up one with
    /// `CapacityExceeded`. A coupon already on the order is released in the
    /// same transaction. Conflicts are not retried.
    #[instrument(skip(self, order), fields(order_id = %order.order.id))]
    pub async fn apply_coupon(
        &self,
        order: &OrderWithItems,
        coupon_code: &str,
    ) -> Result<OrderModel, ServiceError> {
        let result = self.apply_coupon_inner(order, coupon_code).await;
        record_outcome("apply", &result);

        let (updated, replaced) = result?;
        if let (Some(event_sender), Some(coupon_id)) = (&self.event_sender, updated.coupon_id) {
            if let Some(previous) = replaced {
                event_sender
                    .send_or_log(Event::coupon_released(updated.id, previous))
                    .await;
            }
            event_sender
                .send_or_log(Event::coupon_applied(
                    updated.id,
                    coupon_id,
                    replaced,
                    updated.final_total,
                ))
                .await;
        }
        Ok(updated)
    }

    async fn apply_coupon_inner(
        &self,
        order: &OrderWithItems,
        code: &str,
    ) -> Result<(OrderModel, Option<Uuid>), ServiceError> {
        // Matched exactly, surrounding whitespace included
        if code.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Coupon code is required".to_string(),
            ));
        }

        // Catalog reads go through the pool, so they happen before the transaction
        let priced = price_order(&self.resolver, order).await?;
        let today = Utc::now().date_naive();
        let order_id = order.order.id;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to start transaction for coupon application");
            ServiceError::db_error(e)
        })?;

        let coupon = find_redeemable_by_code(&txn, code, today)
            .await?
            .ok_or_else(|| {
                info!(order_id = %order_id, code = %code, "Coupon not available");
                ServiceError::NotFound("Coupon not found or not available".to_string())
            })?;

        let rule = load_rule(&txn, &coupon).await?;
        let final_total = settle_total(
            compute_final_total(&priced, Some(&rule)),
            self.currency_scale,
        );

        let previous = order.order.coupon_id;
        let replaced = match previous {
            Some(previous_id) if previous_id == coupon.id => None,
            Some(previous_id) => {
                try_release_on(&txn, previous_id).await?;
                reserve_on(&txn, &coupon).await?;
                Some(previous_id)
            }
            None => {
                reserve_on(&txn, &coupon).await?;
                None
            }
        };

        let updated = store_order_total(&txn, &order.order, Some(coupon.id), final_total).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit coupon application");
            ServiceError::db_error(e)
        })?;

        info!(
            order_id = %order_id,
            coupon_id = %coupon.id,
            replaced_coupon_id = ?replaced,
            sub_total = %updated.sub_total,
            final_total = %updated.final_total,
            "Coupon applied"
        );
        Ok((updated, replaced))
    }

    /// Takes the coupon off `order`, giving its use back and restoring the subtotal.
    ///
    /// An order without a coupon is returned unchanged.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn remove_coupon(&self, order: &OrderModel) -> Result<OrderModel, ServiceError> {
        let Some(coupon_id) = order.coupon_id else {
            return Ok(order.clone());
        };

        let result = self.remove_coupon_inner(order, coupon_id).await;
        record_outcome("remove", &result);
        let updated = result?;

        if let Some(event_sender) = &self.event_sender {
            event_sender
                .send_or_log(Event::coupon_released(updated.id, coupon_id))
                .await;
        }
        Ok(updated)
    }

    async fn remove_coupon_inner(
        &self,
        order: &OrderModel,
        coupon_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, order_id = %order.id, "Failed to start transaction for coupon removal");
            ServiceError::db_error(e)
        })?;

        let coupon = Coupon::find_by_id(coupon_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        match coupon {
            Some(snapshot) => {
                release_on(&txn, &snapshot).await?;
            }
            None => warn!(order_id = %order.id, coupon_id = %coupon_id, "Order references a missing coupon"),
        }

        let restored = settle_total(order.sub_total, self.currency_scale);
        let updated = store_order_total(&txn, order, None, restored).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order.id, "Failed to commit coupon removal");
            ServiceError::db_error(e)
        })?;

        info!(order_id = %order.id, coupon_id = %coupon_id, "Coupon removed");
        Ok(updated)
    }
}

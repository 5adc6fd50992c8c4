//! Coupon Recommendation Service
//!
//! Read-only: finds the available coupons that could apply to an order and
//! ranks them by how much they would save.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Condition;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::coupon::{self, Entity as Coupon, Model as CouponModel};
use crate::entities::CouponTarget;
use crate::errors::ServiceError;
use crate::repositories::order_repository::OrderWithItems;
use crate::services::category_hierarchy::CategoryHierarchyResolver;
use crate::services::coupon_application::price_order;
use crate::services::coupons::{
    availability_condition, coupon_ids_for_category_names, coupon_ids_for_products, load_rule,
};
use crate::services::discount::{compute_final_total, settle_total};

const DEFAULT_CURRENCY_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponRecommendation {
    pub coupon: CouponModel,
    pub sub_total: Decimal,
    pub final_total: Decimal,
}

impl CouponRecommendation {
    pub fn savings(&self) -> Decimal {
        self.sub_total - self.final_total
    }
}

/// Biggest savings first, then the coupon that expires soonest, then by code.
/// Coupons without an end date sort after dated ones.
pub fn rank(recommendations: &mut [CouponRecommendation]) {
    recommendations.sort_by(|a, b| {
        b.savings()
            .cmp(&a.savings())
            .then_with(|| compare_end_dates(a.coupon.end_date, b.coupon.end_date))
            .then_with(|| a.coupon.code.cmp(&b.coupon.code))
    });
}

fn compare_end_dates(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Clone)]
pub struct CouponRecommendationService {
    db_pool: Arc<DbPool>,
    resolver: CategoryHierarchyResolver,
    currency_scale: u32,
}

impl CouponRecommendationService {
    pub fn new(db_pool: Arc<DbPool>, resolver: CategoryHierarchyResolver) -> Self {
        Self {
            db_pool,
            resolver,
            currency_scale: DEFAULT_CURRENCY_SCALE,
        }
    }

    pub fn with_currency_scale(mut self, currency_scale: u32) -> Self {
        self.currency_scale = currency_scale;
        self
    }

    /// Available coupons applicable to `order`, best savings first.
    ///
    /// A coupon qualifies when it is available today, the order meets its
    /// minimum amount, and it either targets the whole order or is associated
    /// with one of the order's products or categories (ancestors included).
    #[instrument(skip(self, order), fields(order_id = %order.order.id))]
    pub async fn recommend(
        &self,
        order: &OrderWithItems,
    ) -> Result<Vec<CouponRecommendation>, ServiceError> {
        let db = &*self.db_pool;
        let priced = price_order(&self.resolver, order).await?;
        let sub_total = priced.sub_total;

        let mut product_ids: Vec<Uuid> = Vec::new();
        let mut category_names: Vec<String> = Vec::new();
        {
            let mut seen_products = HashSet::new();
            let mut seen_names = HashSet::new();
            for item in &priced.items {
                if seen_products.insert(item.product_id) {
                    product_ids.push(item.product_id);
                }
                for name in &item.category_names {
                    if seen_names.insert(name.clone()) {
                        category_names.push(name.clone());
                    }
                }
            }
        }

        let mut linked = coupon_ids_for_products(db, &product_ids).await?;
        linked.extend(coupon_ids_for_category_names(db, &category_names).await?);

        let today = Utc::now().date_naive();
        let candidates = Coupon::find()
            .filter(availability_condition(today))
            .filter(
                Condition::any()
                    .add(coupon::Column::Target.eq(CouponTarget::All))
                    .add(coupon::Column::Id.is_in(linked)),
            )
            .order_by_asc(coupon::Column::Code)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut recommendations = Vec::with_capacity(candidates.len());
        for coupon in candidates {
            if !meets_minimum(&coupon, sub_total) {
                debug!(coupon_id = %coupon.id, "Order below coupon minimum");
                continue;
            }
            let rule = load_rule(db, &coupon).await?;
            let final_total = settle_total(
                compute_final_total(&priced, Some(&rule)),
                self.currency_scale,
            );
            recommendations.push(CouponRecommendation {
                coupon,
                sub_total,
                final_total,
            });
        }

        rank(&mut recommendations);
        info!(
            order_id = %order.order.id,
            recommended = recommendations.len(),
            "Coupon recommendations computed"
        );
        Ok(recommendations)
    }
}

/// A missing minimum is no lower bound.
fn meets_minimum(coupon: &CouponModel, sub_total: Decimal) -> bool {
    coupon
        .minimum_order_amount
        .map_or(true, |minimum| minimum <= sub_total)
}

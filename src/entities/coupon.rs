use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// How the discount value of a coupon is interpreted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscountType {
    /// `discount_value` is a percentage (0-100) of the discounted base.
    #[sea_orm(string_value = "percentage")]
    Percentage,
    /// `discount_value` is an amount in the order currency.
    #[sea_orm(string_value = "fixed")]
    Fixed,
}

/// Which part of an order a coupon discounts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CouponTarget {
    /// The whole order subtotal.
    #[sea_orm(string_value = "all")]
    All,
    /// Only items matching the coupon's products or categories.
    #[sea_orm(string_value = "single")]
    Single,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub target: CouponTarget,
    pub minimum_order_amount: Option<Decimal>,
    pub maximum_discount_amount: Option<Decimal>,
    pub max_usage: Option<i32>,
    pub times_used: i32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl Model {
    /// True while the usage cap (if any) still has room.
    pub fn has_capacity(&self) -> bool {
        self.max_usage
            .map(|max| self.times_used < max)
            .unwrap_or(true)
    }

    /// True when `day` falls inside the coupon's validity window.
    pub fn is_within_window(&self, day: NaiveDate) -> bool {
        let started = self.start_date.map(|start| start <= day).unwrap_or(true);
        let not_ended = self.end_date.map(|end| end >= day).unwrap_or(true);
        started && not_ended
    }

    pub fn is_available_on(&self, day: NaiveDate) -> bool {
        self.is_within_window(day) && self.has_capacity()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::coupon_product::Entity")]
    CouponProducts,
    #[sea_orm(has_many = "super::coupon_category::Entity")]
    CouponCategories,
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::coupon_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CouponProducts.def()
    }
}

impl Related<super::coupon_category::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CouponCategories.def()
    }
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        super::coupon_product::Relation::Product.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::coupon_product::Relation::Coupon.def().rev())
    }
}

impl Related<super::category::Entity> for Entity {
    fn to() -> RelationDef {
        super::coupon_category::Relation::Category.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::coupon_category::Relation::Coupon.def().rev())
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

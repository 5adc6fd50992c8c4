pub mod category;
pub mod coupon;
pub mod coupon_category;
pub mod coupon_product;
pub mod order;
pub mod order_item;
pub mod product;
pub mod product_category;

pub use coupon::{CouponTarget, DiscountType};

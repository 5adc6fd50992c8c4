// Pure discount arithmetic
pub mod discount;

// Catalog traversal
pub mod category_hierarchy;

// Usage counters and coupon administration
pub mod coupon_ledger;
pub mod coupons;

// Order-facing services
pub mod coupon_application;
pub mod coupon_recommendation;

pub use category_hierarchy::{CatalogLookup, CategoryHierarchyResolver, DbCatalog};
pub use coupon_application::CouponApplicationService;
pub use coupon_ledger::CouponLedger;
pub use coupon_recommendation::{CouponRecommendation, CouponRecommendationService};
pub use coupons::CouponAdminService;
pub use discount::{compute_final_total, CouponRule, PricedItem, PricedOrder};

// Service factory for dependency injection
pub mod factory;

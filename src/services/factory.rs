use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    repositories::order_repository::OrderRepository,
    services::{
        category_hierarchy::CategoryHierarchyResolver,
        coupon_application::CouponApplicationService, coupon_ledger::CouponLedger,
        coupon_recommendation::CouponRecommendationService, coupons::CouponAdminService,
    },
};

/// Factory for creating service instances with shared dependencies
#[derive(Clone)]
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    currency_scale: u32,
    default_currency: Option<String>,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<EventSender>, currency_scale: u32) -> Self {
        Self {
            db_pool,
            event_sender: event_sender.map(Arc::new),
            currency_scale,
            default_currency: None,
        }
    }

    /// Factory using the rounding and currency configured in `config`
    pub fn from_config(db_pool: Arc<DbPool>, event_sender: Option<EventSender>, config: &AppConfig) -> Self {
        let mut factory = Self::new(db_pool, event_sender, config.currency_scale);
        factory.default_currency = Some(config.default_currency.clone());
        factory
    }

    pub fn category_resolver(&self) -> CategoryHierarchyResolver {
        CategoryHierarchyResolver::from_pool(self.db_pool.clone())
    }

    pub fn ledger(&self) -> CouponLedger {
        CouponLedger::new(self.db_pool.clone())
    }

    pub fn application_service(&self) -> CouponApplicationService {
        CouponApplicationService::new(
            self.db_pool.clone(),
            self.category_resolver(),
            self.event_sender.clone(),
        )
        .with_currency_scale(self.currency_scale)
    }

    pub fn recommendation_service(&self) -> CouponRecommendationService {
        CouponRecommendationService::new(self.db_pool.clone(), self.category_resolver())
            .with_currency_scale(self.currency_scale)
    }

    pub fn admin_service(&self) -> CouponAdminService {
        CouponAdminService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn order_repository(&self) -> OrderRepository {
        let repository = OrderRepository::new(self.db_pool.clone());
        match &self.default_currency {
            Some(currency) => repository.with_default_currency(currency.clone()),
            None => repository,
        }
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub orders: Arc<OrderRepository>,
    pub ledger: Arc<CouponLedger>,
    pub application: Arc<CouponApplicationService>,
    pub recommendation: Arc<CouponRecommendationService>,
    pub admin: Arc<CouponAdminService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            orders: Arc::new(factory.order_repository()),
            ledger: Arc::new(factory.ledger()),
            application: Arc::new(factory.application_service()),
            recommendation: Arc::new(factory.recommendation_service()),
            admin: Arc::new(factory.admin_service()),
        }
    }
}

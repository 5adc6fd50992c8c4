#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use storefront_coupons::{
    db::{self, DbConfig, DbPool},
    entities::{category, coupon, order, product, product_category, CouponTarget, DiscountType},
    events::{Event, EventSender},
    repositories::order_repository::{NewOrder, NewOrderItem, OrderWithItems},
    services::{
        coupons::{CreateCouponRequest, CouponDetails},
        factory::{ServiceContainer, ServiceFactory},
    },
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Test harness over a fresh SQLite database with the schema applied.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: ServiceContainer,
    events: mpsc::Receiver<Event>,
    // Keeps the database file alive for file-backed harnesses
    _dir: Option<TempDir>,
}

/// Category tree used across tests:
///
/// ```text
/// clothing
/// ├── bottoms
/// │   └── shorts
/// └── tops
///     └── t-shirts
/// ```
pub struct Catalog {
    pub clothing: Uuid,
    pub bottoms: Uuid,
    pub shorts: Uuid,
    pub tops: Uuid,
    pub t_shirts: Uuid,
    /// Directly in "shorts"
    pub cargo_shorts: Uuid,
    /// Directly in "t-shirts"
    pub plain_tee: Uuid,
    /// In no category
    pub gift_card: Uuid,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_db_config(DbConfig::in_memory_sqlite(), None).await
    }

    /// Harness over a SQLite file in a temporary directory, so the pool can hand out
    /// several connections that really contend for the database lock.
    pub async fn file_backed(max_connections: u32) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("coupons.db");
        let config = DbConfig {
            url: format!("sqlite://{}?mode=rwc", path.display()),
            max_connections,
            min_connections: 1,
            acquire_timeout: StdDuration::from_secs(30),
            ..Default::default()
        };
        Self::with_db_config(config, Some(dir)).await
    }

    async fn with_db_config(config: DbConfig, dir: Option<TempDir>) -> Self {
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let (event_sender, events) = EventSender::channel(1024);
        let factory = ServiceFactory::new(db.clone(), Some(event_sender), 2);
        let services = ServiceContainer::new(&factory);

        Self {
            db,
            services,
            events,
            _dir: dir,
        }
    }

    /// Names of the events published since the last call.
    pub fn drain_events(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            names.push(event.name());
        }
        names
    }

    pub async fn seed_catalog(&self) -> Catalog {
        let clothing = self.category("clothing", None).await;
        let bottoms = self.category("bottoms", Some(clothing)).await;
        let shorts = self.category("shorts", Some(bottoms)).await;
        let tops = self.category("tops", Some(clothing)).await;
        let t_shirts = self.category("t-shirts", Some(tops)).await;

        let cargo_shorts = self.product("Cargo shorts", &[shorts]).await;
        let plain_tee = self.product("Plain tee", &[t_shirts]).await;
        let gift_card = self.product("Gift card", &[]).await;

        Catalog {
            clothing,
            bottoms,
            shorts,
            tops,
            t_shirts,
            cargo_shorts,
            plain_tee,
            gift_card,
        }
    }

    pub async fn category(&self, name: &str, parent_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        category::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            parent_id: Set(parent_id),
        }
        .insert(&*self.db)
        .await
        .expect("insert category");
        id
    }

    pub async fn product(&self, name: &str, categories: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert product");

        for category_id in categories {
            product_category::ActiveModel {
                product_id: Set(id),
                category_id: Set(*category_id),
            }
            .insert(&*self.db)
            .await
            .expect("link product to category");
        }
        id
    }

    /// Creates an order from `(product, unit price, discount price, quantity)` lines.
    pub async fn order(&self, lines: &[(Uuid, Decimal, Option<Decimal>, i32)]) -> OrderWithItems {
        let items = lines
            .iter()
            .map(|(product_id, price, discount_price, quantity)| NewOrderItem {
                product_id: *product_id,
                variant_id: None,
                quantity: *quantity,
                price_at_purchase: *price,
                discount_price_at_purchase: *discount_price,
            })
            .collect();

        self.services
            .orders
            .create_with_items(NewOrder {
                customer_id: Uuid::new_v4(),
                currency: Some("usd".to_string()),
                items,
            })
            .await
            .expect("create order")
    }

    pub async fn create_coupon(&self, request: CreateCouponRequest) -> CouponDetails {
        self.services
            .admin
            .create_coupon(request)
            .await
            .expect("create coupon")
    }

    pub async fn reload_order(&self, order_id: Uuid) -> OrderWithItems {
        self.services
            .orders
            .find_with_items(order_id)
            .await
            .expect("reload order")
    }

    pub async fn coupon(&self, coupon_id: Uuid) -> coupon::Model {
        coupon::Entity::find_by_id(coupon_id)
            .one(&*self.db)
            .await
            .expect("query coupon")
            .expect("coupon exists")
    }

    pub async fn stored_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn coupon_by_code(&self, code: &str) -> coupon::Model {
        coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(&*self.db)
            .await
            .expect("query coupon")
            .expect("coupon exists")
    }

    pub async fn orders_without_coupon(&self) -> Vec<Uuid> {
        order::Entity::find()
            .filter(order::Column::CouponId.is_null())
            .all(&*self.db)
            .await
            .expect("query orders")
            .into_iter()
            .map(|o| o.id)
            .collect()
    }

    /// Forces the usage counter of a coupon, bypassing the ledger.
    pub async fn set_times_used(&self, coupon: &coupon::Model, times_used: i32) -> coupon::Model {
        let mut active: coupon::ActiveModel = coupon.clone().into();
        active.times_used = Set(times_used);
        active.update(&*self.db).await.expect("set times_used")
    }
}

/// Unlimited coupon over the whole order, valid around today.
pub fn coupon_request(code: &str, discount_type: DiscountType, value: Decimal) -> CreateCouponRequest {
    let today = Utc::now().date_naive();
    CreateCouponRequest {
        code: code.to_string(),
        discount_type,
        discount_value: value,
        target: CouponTarget::All,
        minimum_order_amount: None,
        maximum_discount_amount: None,
        max_usage: None,
        start_date: Some(today - Duration::days(7)),
        end_date: Some(today + Duration::days(30)),
        categories: Vec::new(),
        products: Vec::new(),
    }
}

pub fn days_from_today(days: i64) -> NaiveDate {
    Utc::now().date_naive() + Duration::days(days)
}

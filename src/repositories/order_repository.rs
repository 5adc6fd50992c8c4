use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::entities::order_item::{
    self, ActiveModel as OrderItemActiveModel, Entity as OrderItem, Model as OrderItemModel,
};
use crate::errors::ServiceError;

const DEFAULT_CURRENCY: &str = "USD";

/// An order together with its line items in position order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Line of an order being created.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Quantity must be positive"))]
    pub quantity: i32,
    pub price_at_purchase: Decimal,
    pub discount_price_at_purchase: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrder {
    pub customer_id: Uuid,
    /// ISO currency code; the repository default when absent
    #[validate(length(min = 3, max = 3, message = "Currency must be 3 characters"))]
    pub currency: Option<String>,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<NewOrderItem>,
}

/// Repository for order retrieval and creation
#[derive(Debug, Clone)]
pub struct OrderRepository {
    db: Arc<DatabaseConnection>,
    default_currency: String,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            default_currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into();
        self
    }

    /// Find an order by ID
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Loads an order and its items, `NotFound` when the order does not exist
    #[instrument(skip(self))]
    pub async fn find_with_items(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = self
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = self.get_order_items(order_id).await?;
        Ok(OrderWithItems { order, items })
    }

    /// Loads an order only if it belongs to `customer_id`.
    ///
    /// Orders of other customers are reported as missing.
    #[instrument(skip(self))]
    pub async fn find_for_customer(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .filter(Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = self.get_order_items(order_id).await?;
        Ok(OrderWithItems { order, items })
    }

    /// Find orders by customer ID, newest first
    pub async fn find_by_customer(
        &self,
        customer_id: Uuid,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let paginator = Order::find()
            .filter(Column::CustomerId.eq(customer_id))
            .order_by_desc(Column::CreatedAt)
            .paginate(&*self.db, page_size.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;

        let orders = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((orders, total))
    }

    /// Get order items for an order in position order
    pub async fn get_order_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Position)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Creates an order and its items in one transaction.
    ///
    /// `sub_total` is the sum of effective line totals and `final_total` starts equal to it.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_with_items(&self, request: NewOrder) -> Result<OrderWithItems, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
            let negative_discount = item
                .discount_price_at_purchase
                .map(|p| p.is_sign_negative())
                .unwrap_or(false);
            if item.price_at_purchase.is_sign_negative() || negative_discount {
                return Err(ServiceError::ValidationError(
                    "Item prices must not be negative".to_string(),
                ));
            }
        }

        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&self.default_currency)
            .to_uppercase();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let items: Vec<OrderItemModel> = request
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| OrderItemModel {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                price_at_purchase: item.price_at_purchase,
                discount_price_at_purchase: item.discount_price_at_purchase,
                position: position as i32,
            })
            .collect();
        let sub_total: Decimal = items.iter().map(OrderItemModel::line_total).sum();

        let db = &*self.db;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction for order creation");
            ServiceError::db_error(e)
        })?;

        let order = OrderActiveModel {
            id: Set(order_id),
            customer_id: Set(request.customer_id),
            sub_total: Set(sub_total),
            final_total: Set(sub_total),
            coupon_id: Set(None),
            currency: Set(currency),
            created_at: Set(now),
            updated_at: Set(None),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to insert order");
            ServiceError::db_error(e)
        })?;

        for item in &items {
            OrderItemActiveModel {
                id: Set(item.id),
                order_id: Set(item.order_id),
                product_id: Set(item.product_id),
                variant_id: Set(item.variant_id),
                quantity: Set(item.quantity),
                price_at_purchase: Set(item.price_at_purchase),
                discount_price_at_purchase: Set(item.discount_price_at_purchase),
                position: Set(item.position),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        txn.commit().await.map_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to commit order creation");
            ServiceError::db_error(e)
        })?;

        info!(order_id = %order_id, sub_total = %sub_total, items = items.len(), "Order created");
        Ok(OrderWithItems { order, items })
    }
}

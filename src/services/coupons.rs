//! Coupon administration and the coupon queries shared by the application and
//! recommendation services.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, JoinType, ModelTrait,
    Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Select, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::coupon::{self, Entity as Coupon, Model as CouponModel};
use crate::entities::{category, coupon_category, coupon_product, order, product};
use crate::entities::{CouponTarget, DiscountType};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::discount::{validate_discount_values, CouponRule};

const DEFAULT_PAGE: u64 = 1;
const DEFAULT_PAGE_SIZE: u64 = 5;
const MAX_PAGE_SIZE: u64 = 100;

// ---------------------------------------------------------------------------
// Availability and rule loading

/// Coupons whose date window contains `today`.
pub fn date_window_condition(today: NaiveDate) -> Condition {
    Condition::all()
        .add(
            Condition::any()
                .add(coupon::Column::EndDate.is_null())
                .add(coupon::Column::EndDate.gte(today)),
        )
        .add(
            Condition::any()
                .add(coupon::Column::StartDate.is_null())
                .add(coupon::Column::StartDate.lte(today)),
        )
}

/// Coupons usable on `today`: inside their date window and under their usage cap.
pub fn availability_condition(today: NaiveDate) -> Condition {
    date_window_condition(today).add(
        Condition::any()
            .add(coupon::Column::MaxUsage.is_null())
            .add(Expr::col(coupon::Column::TimesUsed).lt(Expr::col(coupon::Column::MaxUsage))),
    )
}

/// Looks a coupon up by its exact code among the coupons dated for `today`,
/// leaving the usage cap to the ledger.
pub async fn find_redeemable_by_code<C: ConnectionTrait>(
    conn: &C,
    code: &str,
    today: NaiveDate,
) -> Result<Option<CouponModel>, ServiceError> {
    Coupon::find()
        .filter(coupon::Column::Code.eq(code))
        .filter(date_window_condition(today))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Resolves a coupon's product and category associations into a [`CouponRule`].
pub async fn load_rule<C: ConnectionTrait>(
    conn: &C,
    coupon: &CouponModel,
) -> Result<CouponRule, ServiceError> {
    let product_ids: HashSet<Uuid> = coupon_product::Entity::find()
        .filter(coupon_product::Column::CouponId.eq(coupon.id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|link| link.product_id)
        .collect();

    let category_names: HashSet<String> = coupon
        .find_related(category::Entity)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|category| category.name)
        .collect();

    CouponRule::from_coupon(coupon, product_ids, category_names)
}

/// Ids of coupons associated with any of the given products.
pub async fn coupon_ids_for_products<C: ConnectionTrait>(
    conn: &C,
    product_ids: &[Uuid],
) -> Result<HashSet<Uuid>, ServiceError> {
    if product_ids.is_empty() {
        return Ok(HashSet::new());
    }
    Ok(coupon_product::Entity::find()
        .filter(coupon_product::Column::ProductId.is_in(product_ids.iter().copied()))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|link| link.coupon_id)
        .collect())
}

/// Ids of coupons associated with a category carrying any of the given names.
pub async fn coupon_ids_for_category_names<C: ConnectionTrait>(
    conn: &C,
    names: &[String],
) -> Result<HashSet<Uuid>, ServiceError> {
    if names.is_empty() {
        return Ok(HashSet::new());
    }
    Ok(coupon_category::Entity::find()
        .join(JoinType::InnerJoin, coupon_category::Relation::Category.def())
        .filter(category::Column::Name.is_in(names.iter().cloned()))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|link| link.coupon_id)
        .collect())
}

// ---------------------------------------------------------------------------
// Sorting

/// Coupon columns a listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponSortField {
    Code,
    DiscountType,
    DiscountValue,
    Target,
    MinimumOrderAmount,
    MaximumDiscountAmount,
    MaxUsage,
    TimesUsed,
    StartDate,
    EndDate,
    CreatedAt,
    UpdatedAt,
}

impl CouponSortField {
    /// Accepts camelCase and snake_case names, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        let field = match normalized.as_str() {
            "code" => Self::Code,
            "discounttype" => Self::DiscountType,
            "discountvalue" => Self::DiscountValue,
            "target" => Self::Target,
            "minimumorderamount" => Self::MinimumOrderAmount,
            "maximumdiscountamount" => Self::MaximumDiscountAmount,
            "maxusage" => Self::MaxUsage,
            "timesused" => Self::TimesUsed,
            "startdate" => Self::StartDate,
            "enddate" => Self::EndDate,
            "createdat" => Self::CreatedAt,
            "updatedat" => Self::UpdatedAt,
            _ => return None,
        };
        Some(field)
    }

    fn column(self) -> coupon::Column {
        match self {
            Self::Code => coupon::Column::Code,
            Self::DiscountType => coupon::Column::DiscountType,
            Self::DiscountValue => coupon::Column::DiscountValue,
            Self::Target => coupon::Column::Target,
            Self::MinimumOrderAmount => coupon::Column::MinimumOrderAmount,
            Self::MaximumDiscountAmount => coupon::Column::MaximumDiscountAmount,
            Self::MaxUsage => coupon::Column::MaxUsage,
            Self::TimesUsed => coupon::Column::TimesUsed,
            Self::StartDate => coupon::Column::StartDate,
            Self::EndDate => coupon::Column::EndDate,
            Self::CreatedAt => coupon::Column::CreatedAt,
            Self::UpdatedAt => coupon::Column::UpdatedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Ordered list of sort keys for coupon listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponSort {
    keys: Vec<(CouponSortField, SortDirection)>,
}

impl CouponSort {
    /// Parses sort fields such as `["-discountValue", "timesUsed"]`.
    ///
    /// A leading `-` sorts descending. Unknown fields are skipped and
    /// `createdAt` ascending is always appended as the last key.
    pub fn parse<S: AsRef<str>>(fields: &[S]) -> Self {
        let mut keys: Vec<(CouponSortField, SortDirection)> = fields
            .iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                let (name, direction) = match raw.strip_prefix('-') {
                    Some(name) => (name, SortDirection::Desc),
                    None => (raw, SortDirection::Asc),
                };
                match CouponSortField::parse(name) {
                    Some(field) => Some((field, direction)),
                    None => {
                        warn!(field = %raw, "Ignoring unknown coupon sort field");
                        None
                    }
                }
            })
            .collect();
        keys.push((CouponSortField::CreatedAt, SortDirection::Asc));
        Self { keys }
    }

    pub fn keys(&self) -> &[(CouponSortField, SortDirection)] {
        &self.keys
    }

    fn apply(&self, mut query: Select<Coupon>) -> Select<Coupon> {
        for (field, direction) in &self.keys {
            let order = match direction {
                SortDirection::Asc => Order::Asc,
                SortDirection::Desc => Order::Desc,
            };
            query = query.order_by(field.column(), order);
        }
        query
    }
}

impl Default for CouponSort {
    fn default() -> Self {
        Self::parse::<&str>(&[])
    }
}

// ---------------------------------------------------------------------------
// Requests and responses

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 64, message = "Coupon code must be 1-64 characters"))]
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub target: CouponTarget,
    pub minimum_order_amount: Option<Decimal>,
    pub maximum_discount_amount: Option<Decimal>,
    #[validate(range(min = 0, message = "Max usage must not be negative"))]
    pub max_usage: Option<i32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Category names the coupon applies to
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub products: Vec<Uuid>,
}

/// Partial update; `None` leaves a field unchanged and `Some(None)` clears a
/// nullable one. Association lists replace the current set when given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateCouponRequest {
    /// Version the caller read; the update fails with `Conflict` if it moved on
    pub expected_version: i32,
    #[validate(length(min = 1, max = 64, message = "Coupon code must be 1-64 characters"))]
    pub code: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub target: Option<CouponTarget>,
    pub minimum_order_amount: Option<Option<Decimal>>,
    pub maximum_discount_amount: Option<Option<Decimal>>,
    pub max_usage: Option<Option<i32>>,
    pub start_date: Option<Option<NaiveDate>>,
    pub end_date: Option<Option<NaiveDate>>,
    pub categories: Option<Vec<String>>,
    pub products: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CouponQuery {
    pub discount_type: Option<DiscountType>,
    pub target: Option<CouponTarget>,
    /// Substring of the coupon code
    pub code: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub products: Vec<Uuid>,
    #[serde(default)]
    pub sort: Vec<String>,
    pub page: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponPage {
    pub coupons: Vec<CouponModel>,
    pub current_page: u64,
    pub total_pages: u64,
    pub total_items: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponDetails {
    #[serde(flatten)]
    pub coupon: CouponModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<product::Model>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<category::Model>>,
}

fn validate_rule(coupon: &CouponModel) -> Result<(), ServiceError> {
    // Codes are matched exactly on redemption
    if coupon.code.trim().is_empty() || coupon.code.trim() != coupon.code {
        return Err(ServiceError::ValidationError(
            "Coupon code must not be blank or carry surrounding whitespace".to_string(),
        ));
    }
    validate_discount_values(
        coupon.discount_type,
        coupon.discount_value,
        coupon.maximum_discount_amount,
    )?;
    if coupon
        .minimum_order_amount
        .map_or(false, |amount| amount.is_sign_negative())
    {
        return Err(ServiceError::ValidationError(
            "Minimum order amount must not be negative".to_string(),
        ));
    }
    if let (Some(start), Some(end)) = (coupon.start_date, coupon.end_date) {
        if end < start {
            return Err(ServiceError::ValidationError(
                "End date must not be before start date".to_string(),
            ));
        }
    }
    if let Some(max_usage) = coupon.max_usage {
        if max_usage < coupon.times_used {
            return Err(ServiceError::ValidationError(format!(
                "Max usage {} is below the {} uses already taken",
                max_usage, coupon.times_used
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Service

/// Coupon administration: creation, lookup, listing, updates and retirement.
#[derive(Clone)]
pub struct CouponAdminService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl CouponAdminService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            event_sender.send_or_log(event).await;
        }
    }

    /// Creates a coupon and its associations in one transaction.
    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create_coupon(&self, request: CreateCouponRequest) -> Result<CouponDetails, ServiceError> {
        request.validate()?;

        let now = Utc::now();
        let candidate = CouponModel {
            id: Uuid::new_v4(),
            code: request.code.clone(),
            discount_type: request.discount_type,
            discount_value: request.discount_value,
            target: request.target,
            minimum_order_amount: request.minimum_order_amount,
            maximum_discount_amount: request.maximum_discount_amount,
            max_usage: request.max_usage,
            times_used: 0,
            start_date: request.start_date,
            end_date: request.end_date,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        validate_rule(&candidate)?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for coupon creation");
            ServiceError::db_error(e)
        })?;

        let duplicate = Coupon::find()
            .filter(coupon::Column::Code.eq(candidate.code.as_str()))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if duplicate > 0 {
            return Err(ServiceError::ValidationError(format!(
                "Coupon code {} already exists",
                candidate.code
            )));
        }

        let coupon_id = candidate.id;
        let created = coupon::ActiveModel {
            id: Set(candidate.id),
            code: Set(candidate.code.clone()),
            discount_type: Set(candidate.discount_type),
            discount_value: Set(candidate.discount_value),
            target: Set(candidate.target),
            minimum_order_amount: Set(candidate.minimum_order_amount),
            maximum_discount_amount: Set(candidate.maximum_discount_amount),
            max_usage: Set(candidate.max_usage),
            times_used: Set(0),
            start_date: Set(candidate.start_date),
            end_date: Set(candidate.end_date),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, coupon_id = %coupon_id, "Failed to insert coupon");
            ServiceError::db_error(e)
        })?;

        let categories = replace_categories(&txn, coupon_id, &request.categories).await?;
        let products = replace_products(&txn, coupon_id, &request.products).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, coupon_id = %coupon_id, "Failed to commit coupon creation");
            ServiceError::db_error(e)
        })?;

        info!(coupon_id = %coupon_id, code = %created.code, "Coupon created");
        self.publish(Event::CouponCreated(coupon_id)).await;

        Ok(CouponDetails {
            coupon: created,
            products: Some(products),
            categories: Some(categories),
        })
    }

    /// Fetches a coupon, optionally with its products and categories.
    #[instrument(skip(self))]
    pub async fn get_coupon(
        &self,
        coupon_id: Uuid,
        include_associated: bool,
    ) -> Result<CouponDetails, ServiceError> {
        let db = &*self.db_pool;
        let coupon = Coupon::find_by_id(coupon_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        if !include_associated {
            return Ok(CouponDetails {
                coupon,
                products: None,
                categories: None,
            });
        }

        let products = coupon
            .find_related(product::Entity)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        let categories = coupon
            .find_related(category::Entity)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(CouponDetails {
            coupon,
            products: Some(products),
            categories: Some(categories),
        })
    }

    /// Lists coupons matching the query, sorted and paginated.
    #[instrument(skip(self, query))]
    pub async fn list_coupons(&self, query: CouponQuery) -> Result<CouponPage, ServiceError> {
        let page = query.page.unwrap_or(DEFAULT_PAGE);
        let size = query.size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(ServiceError::ValidationError(format!(
                "Page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let db = &*self.db_pool;
        let mut select = Coupon::find();

        if let Some(discount_type) = query.discount_type {
            select = select.filter(coupon::Column::DiscountType.eq(discount_type));
        }
        if let Some(target) = query.target {
            select = select.filter(coupon::Column::Target.eq(target));
        }
        if let Some(code) = query.code.as_deref().filter(|c| !c.is_empty()) {
            select = select.filter(coupon::Column::Code.contains(code));
        }
        if !query.categories.is_empty() {
            let ids = coupon_ids_for_category_names(db, &query.categories).await?;
            select = select.filter(coupon::Column::Id.is_in(ids));
        }
        if !query.products.is_empty() {
            let ids = coupon_ids_for_products(db, &query.products).await?;
            select = select.filter(coupon::Column::Id.is_in(ids));
        }

        let select = CouponSort::parse(&query.sort).apply(select);
        let paginator = select.paginate(db, size);
        let counts = paginator.num_items_and_pages().await.map_err(|e| {
            error!(error = %e, "Failed to count coupons");
            ServiceError::db_error(e)
        })?;
        let coupons = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page = page, size = size, "Failed to fetch coupons page");
            ServiceError::db_error(e)
        })?;

        info!(
            total = counts.number_of_items,
            page = page,
            returned_count = coupons.len(),
            "Coupons listed"
        );

        Ok(CouponPage {
            coupons,
            current_page: page,
            total_pages: counts.number_of_pages,
            total_items: counts.number_of_items,
        })
    }

    /// Applies a partial update guarded by `expected_version`.
    ///
    /// `times_used` is never written here.
    #[instrument(skip(self, request), fields(expected_version = request.expected_version))]
    pub async fn update_coupon(
        &self,
        coupon_id: Uuid,
        request: UpdateCouponRequest,
    ) -> Result<CouponDetails, ServiceError> {
        request.validate()?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, coupon_id = %coupon_id, "Failed to start transaction for coupon update");
            ServiceError::db_error(e)
        })?;

        let current = Coupon::find_by_id(coupon_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        if current.version != request.expected_version {
            warn!(
                coupon_id = %coupon_id,
                current_version = current.version,
                "Coupon update based on a stale version"
            );
            return Err(ServiceError::Conflict(format!(
                "Coupon {} was modified concurrently",
                coupon_id
            )));
        }

        let mut next = current.clone();
        if let Some(code) = request.code {
            next.code = code;
        }
        if let Some(discount_type) = request.discount_type {
            next.discount_type = discount_type;
        }
        if let Some(discount_value) = request.discount_value {
            next.discount_value = discount_value;
        }
        if let Some(target) = request.target {
            next.target = target;
        }
        if let Some(minimum) = request.minimum_order_amount {
            next.minimum_order_amount = minimum;
        }
        if let Some(maximum) = request.maximum_discount_amount {
            next.maximum_discount_amount = maximum;
        }
        if let Some(max_usage) = request.max_usage {
            next.max_usage = max_usage;
        }
        if let Some(start_date) = request.start_date {
            next.start_date = start_date;
        }
        if let Some(end_date) = request.end_date {
            next.end_date = end_date;
        }
        validate_rule(&next)?;

        if next.code != current.code {
            let taken = Coupon::find()
                .filter(coupon::Column::Code.eq(next.code.as_str()))
                .filter(coupon::Column::Id.ne(coupon_id))
                .count(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            if taken > 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Coupon code {} already exists",
                    next.code
                )));
            }
        }

        let now = Utc::now();
        let changes = coupon::ActiveModel {
            id: Set(coupon_id),
            code: Set(next.code.clone()),
            discount_type: Set(next.discount_type),
            discount_value: Set(next.discount_value),
            target: Set(next.target),
            minimum_order_amount: Set(next.minimum_order_amount),
            maximum_discount_amount: Set(next.maximum_discount_amount),
            max_usage: Set(next.max_usage),
            start_date: Set(next.start_date),
            end_date: Set(next.end_date),
            updated_at: Set(now),
            version: Set(current.version + 1),
            ..Default::default()
        };

        let updated = Coupon::update(changes)
            .filter(coupon::Column::Version.eq(current.version))
            .exec(&txn)
            .await
            .map_err(|e| match e {
                DbErr::RecordNotUpdated => ServiceError::Conflict(format!(
                    "Coupon {} was modified concurrently",
                    coupon_id
                )),
                other => {
                    error!(error = %other, coupon_id = %coupon_id, "Failed to update coupon");
                    ServiceError::db_error(other)
                }
            })?;

        let categories = match &request.categories {
            Some(names) => Some(replace_categories(&txn, coupon_id, names).await?),
            None => None,
        };
        let products = match &request.products {
            Some(ids) => Some(replace_products(&txn, coupon_id, ids).await?),
            None => None,
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, coupon_id = %coupon_id, "Failed to commit coupon update");
            ServiceError::db_error(e)
        })?;

        info!(coupon_id = %coupon_id, version = updated.version, "Coupon updated");
        self.publish(Event::CouponUpdated(coupon_id)).await;

        Ok(CouponDetails {
            coupon: updated,
            products,
            categories,
        })
    }

    /// Closes the coupon's remaining capacity so it is no longer available.
    #[instrument(skip(self))]
    pub async fn disable_coupon(&self, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
        let db = &*self.db_pool;
        let current = Coupon::find_by_id(coupon_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        let now = Utc::now();
        let result = Coupon::update_many()
            .col_expr(coupon::Column::MaxUsage, Expr::value(Some(current.times_used)))
            .col_expr(coupon::Column::Version, Expr::value(current.version + 1))
            .col_expr(coupon::Column::UpdatedAt, Expr::value(now))
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(coupon::Column::Version.eq(current.version))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Coupon {} was modified concurrently",
                coupon_id
            )));
        }

        info!(coupon_id = %coupon_id, times_used = current.times_used, "Coupon disabled");
        self.publish(Event::CouponDisabled(coupon_id)).await;

        Ok(CouponModel {
            max_usage: Some(current.times_used),
            version: current.version + 1,
            updated_at: now,
            ..current
        })
    }

    /// Deletes a coupon and its associations unless an order still references it.
    #[instrument(skip(self))]
    pub async fn delete_coupon(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;

        let coupon = Coupon::find_by_id(coupon_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        let referencing_orders = order::Entity::find()
            .filter(order::Column::CouponId.eq(coupon_id))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if referencing_orders > 0 {
            return Err(ServiceError::ValidationError(format!(
                "Coupon {} is applied to {} order(s) and cannot be deleted",
                coupon.code, referencing_orders
            )));
        }

        coupon_product::Entity::delete_many()
            .filter(coupon_product::Column::CouponId.eq(coupon_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        coupon_category::Entity::delete_many()
            .filter(coupon_category::Column::CouponId.eq(coupon_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        coupon.delete(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, coupon_id = %coupon_id, "Failed to commit coupon deletion");
            ServiceError::db_error(e)
        })?;

        info!(coupon_id = %coupon_id, "Coupon deleted");
        self.publish(Event::CouponDeleted(coupon_id)).await;
        Ok(())
    }
}

/// Replaces the coupon's categories with the ones named; every name must exist.
async fn replace_categories<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    names: &[String],
) -> Result<Vec<category::Model>, ServiceError> {
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    let categories = if wanted.is_empty() {
        Vec::new()
    } else {
        category::Entity::find()
            .filter(category::Column::Name.is_in(wanted.iter().copied()))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
    };

    let found: HashSet<&str> = categories.iter().map(|c| c.name.as_str()).collect();
    if let Some(missing) = wanted.iter().find(|name| !found.contains(*name)) {
        return Err(ServiceError::NotFound(format!("Category {} not found", missing)));
    }

    coupon_category::Entity::delete_many()
        .filter(coupon_category::Column::CouponId.eq(coupon_id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    for category in &categories {
        coupon_category::ActiveModel {
            coupon_id: Set(coupon_id),
            category_id: Set(category.id),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
    }

    Ok(categories)
}

/// Replaces the coupon's products; every id must exist.
async fn replace_products<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<product::Model>, ServiceError> {
    let wanted: HashSet<Uuid> = ids.iter().copied().collect();
    let products = if wanted.is_empty() {
        Vec::new()
    } else {
        product::Entity::find()
            .filter(product::Column::Id.is_in(wanted.iter().copied()))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
    };

    let found: HashSet<Uuid> = products.iter().map(|p| p.id).collect();
    if let Some(missing) = wanted.iter().find(|id| !found.contains(*id)) {
        return Err(ServiceError::NotFound(format!("Product {} not found", missing)));
    }

    coupon_product::Entity::delete_many()
        .filter(coupon_product::Column::CouponId.eq(coupon_id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    for product in &products {
        coupon_product::ActiveModel {
            coupon_id: Set(coupon_id),
            product_id: Set(product.id),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
    }

    Ok(products)
}

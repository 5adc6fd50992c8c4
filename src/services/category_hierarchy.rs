//! Category Hierarchy Resolver
//!
//! Answers "which categories does this product sit under" by walking every
//! directly assigned category up its parent chain. Nothing is cached; each
//! call reads the catalog afresh.

use async_trait::async_trait;
use futures::future::try_join_all;
use sea_orm::{ColumnTrait, EntityTrait, JoinType, QueryFilter, QuerySelect, RelationTrait};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{category, product, product_category};
use crate::errors::ServiceError;

/// Read access to the product catalog.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn get_product(&self, product_id: Uuid) -> Result<Option<product::Model>, ServiceError>;

    /// Categories the product is directly assigned to
    async fn categories_of_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<category::Model>, ServiceError>;

    async fn category_parent(
        &self,
        category: &category::Model,
    ) -> Result<Option<category::Model>, ServiceError>;
}

/// Catalog lookup backed by the database pool.
#[derive(Debug, Clone)]
pub struct DbCatalog {
    db: Arc<DbPool>,
}

impl DbCatalog {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogLookup for DbCatalog {
    async fn get_product(&self, product_id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn categories_of_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<category::Model>, ServiceError> {
        category::Entity::find()
            .join(
                JoinType::InnerJoin,
                category::Relation::ProductCategories.def(),
            )
            .filter(product_category::Column::ProductId.eq(product_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn category_parent(
        &self,
        category: &category::Model,
    ) -> Result<Option<category::Model>, ServiceError> {
        match category.parent_id {
            Some(parent_id) => category::Entity::find_by_id(parent_id)
                .one(&*self.db)
                .await
                .map_err(ServiceError::db_error),
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct CategoryHierarchyResolver {
    catalog: Arc<dyn CatalogLookup>,
}

impl CategoryHierarchyResolver {
    pub fn new(catalog: Arc<dyn CatalogLookup>) -> Self {
        Self { catalog }
    }

    /// Resolver reading straight from the database.
    pub fn from_pool(db: Arc<DbPool>) -> Self {
        Self::new(Arc::new(DbCatalog::new(db)))
    }

    /// Names of every category the product belongs to, directly or through an
    /// ancestor, in walk order without duplicates.
    ///
    /// Fails with `NotFound` when the product does not exist.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn ancestor_category_names(&self, product_id: Uuid) -> Result<Vec<String>, ServiceError> {
        if self.catalog.get_product(product_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        let mut names = Vec::new();
        let mut seen_names = HashSet::new();
        let mut visited = HashSet::new();

        for direct in self.catalog.categories_of_product(product_id).await? {
            let mut current = Some(direct);
            while let Some(category) = current {
                // Shared ancestors and cycles stop the walk
                if !visited.insert(category.id) {
                    debug!(category_id = %category.id, "Category already visited");
                    break;
                }
                if seen_names.insert(category.name.clone()) {
                    names.push(category.name.clone());
                }
                current = self.catalog.category_parent(&category).await?;
            }
        }

        if names.is_empty() {
            debug!(product_id = %product_id, "Product has no categories");
        }

        Ok(names)
    }

    /// Ancestor category names for each distinct product, keyed by product id.
    pub async fn ancestor_names_by_product(
        &self,
        product_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, HashSet<String>>, ServiceError> {
        let distinct: Vec<Uuid> = {
            let mut seen = HashSet::new();
            product_ids
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect()
        };

        let resolved = try_join_all(distinct.iter().map(|id| async move {
            let names = self.ancestor_category_names(*id).await?;
            Ok::<_, ServiceError>((*id, names.into_iter().collect::<HashSet<_>>()))
        }))
        .await?;

        Ok(resolved.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[derive(Default)]
    struct InMemoryCatalog {
        products: HashSet<Uuid>,
        categories: HashMap<Uuid, category::Model>,
        assignments: HashMap<Uuid, Vec<Uuid>>,
    }

    impl InMemoryCatalog {
        fn category(&mut self, name: &str, parent_id: Option<Uuid>) -> Uuid {
            let id = Uuid::new_v4();
            self.categories.insert(
                id,
                category::Model {
                    id,
                    name: name.to_string(),
                    parent_id,
                },
            );
            id
        }

        fn product(&mut self, categories: Vec<Uuid>) -> Uuid {
            let id = Uuid::new_v4();
            self.products.insert(id);
            self.assignments.insert(id, categories);
            id
        }
    }

    #[async_trait]
    impl CatalogLookup for InMemoryCatalog {
        async fn get_product(&self, product_id: Uuid) -> Result<Option<product::Model>, ServiceError> {
            Ok(self.products.get(&product_id).map(|id| product::Model {
                id: *id,
                name: "product".to_string(),
                created_at: Utc::now(),
            }))
        }

        async fn categories_of_product(
            &self,
            product_id: Uuid,
        ) -> Result<Vec<category::Model>, ServiceError> {
            Ok(self
                .assignments
                .get(&product_id)
                .map(|ids| ids.iter().filter_map(|id| self.categories.get(id).cloned()).collect())
                .unwrap_or_default())
        }

        async fn category_parent(
            &self,
            category: &category::Model,
        ) -> Result<Option<category::Model>, ServiceError> {
            Ok(category
                .parent_id
                .and_then(|parent| self.categories.get(&parent).cloned()))
        }
    }

    #[tokio::test]
    async fn walks_to_the_root() {
        let mut catalog = InMemoryCatalog::default();
        let clothing = catalog.category("clothing", None);
        let bottoms = catalog.category("bottoms", Some(clothing));
        let shorts = catalog.category("shorts", Some(bottoms));
        let product = catalog.product(vec![shorts]);

        let resolver = CategoryHierarchyResolver::new(Arc::new(catalog));
        let names = resolver.ancestor_category_names(product).await.unwrap();
        assert_eq!(names, vec!["shorts", "bottoms", "clothing"]);
    }

    #[tokio::test]
    async fn shared_ancestors_appear_once() {
        let mut catalog = InMemoryCatalog::default();
        let clothing = catalog.category("clothing", None);
        let shorts = catalog.category("shorts", Some(clothing));
        let sale = catalog.category("summer-sale", Some(clothing));
        let product = catalog.product(vec![shorts, sale]);

        let resolver = CategoryHierarchyResolver::new(Arc::new(catalog));
        let names = resolver.ancestor_category_names(product).await.unwrap();
        assert_eq!(names, vec!["shorts", "clothing", "summer-sale"]);
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let mut catalog = InMemoryCatalog::default();
        let a = catalog.category("a", None);
        let b = catalog.category("b", Some(a));
        if let Some(cat) = catalog.categories.get_mut(&a) {
            cat.parent_id = Some(b);
        }
        let product = catalog.product(vec![b]);

        let resolver = CategoryHierarchyResolver::new(Arc::new(catalog));
        let names = resolver.ancestor_category_names(product).await.unwrap();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn uncategorised_product_has_no_names() {
        let mut catalog = InMemoryCatalog::default();
        let product = catalog.product(Vec::new());

        let resolver = CategoryHierarchyResolver::new(Arc::new(catalog));
        assert!(resolver.ancestor_category_names(product).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let resolver = CategoryHierarchyResolver::new(Arc::new(InMemoryCatalog::default()));
        assert_matches!(
            resolver.ancestor_category_names(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn names_are_keyed_by_distinct_product() {
        let mut catalog = InMemoryCatalog::default();
        let tops = catalog.category("tops", None);
        let shirt = catalog.product(vec![tops]);
        let plain = catalog.product(Vec::new());

        let resolver = CategoryHierarchyResolver::new(Arc::new(catalog));
        let by_product = resolver
            .ancestor_names_by_product(&[shirt, plain, shirt])
            .await
            .unwrap();
        assert_eq!(by_product.len(), 2);
        assert!(by_product[&shirt].contains("tops"));
        assert!(by_product[&plain].is_empty());
    }
}

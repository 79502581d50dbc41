//! Category vocabulary store.
//!
//! The categories feed the analyzer's prompt (the model must pick from
//! these) and the dashboard's filter dropdowns. A fresh database is seeded
//! with a default set; after that the vocabulary is user-managed.

use chrono::{DateTime, Utc};
use libsql::params;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::{Db, parse_datetime};

/// Default vocabulary seeded into an empty database: (name, description, color).
const DEFAULT_CATEGORIES: &[(&str, &str, &str)] = &[
    (
        "Feature Request",
        "A request for new functionality",
        "#3B82F6",
    ),
    ("Bug Report", "A defect or malfunction report", "#EF4444"),
    (
        "Improvement",
        "An enhancement to existing behavior",
        "#10B981",
    ),
    ("Inquiry", "A question or information request", "#F59E0B"),
    ("Other", "Anything that fits no other category", "#6B7280"),
];

/// One category in the vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub color: String,
    pub sort_order: i64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a category.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewCategory {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub sort_order: i64,
}

fn default_color() -> String {
    "#6B7280".to_string()
}

/// Partial update for a category; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CategoryUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub sort_order: Option<i64>,
}

const CATEGORY_COLUMNS: &str = "id, name, description, color, sort_order, is_default, created_at";

fn row_to_category(row: &libsql::Row) -> Result<Category, libsql::Error> {
    let is_default: i64 = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        color: row.get(3)?,
        sort_order: row.get(4)?,
        is_default: is_default != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Vocabulary store over the `categories` table.
#[derive(Clone)]
pub struct CategoryStore {
    db: Db,
}

impl CategoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Seed the default vocabulary when the table is empty.
    ///
    /// Deliberately does nothing on a non-empty table so that deleted
    /// defaults stay deleted.
    pub async fn seed_defaults(&self) -> Result<(), DatabaseError> {
        let conn = self.db.conn();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM categories", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("seed count: {e}")))?;
        let count: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            _ => 0,
        };
        if count > 0 {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        for (order, (name, description, color)) in DEFAULT_CATEGORIES.iter().enumerate() {
            conn.execute(
                "INSERT OR IGNORE INTO categories (name, description, color, sort_order, \
                     is_default, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![*name, *description, *color, order as i64, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seed category {name}: {e}")))?;
        }

        info!(count = DEFAULT_CATEGORIES.len(), "Seeded default categories");
        Ok(())
    }

    /// All categories, in display order.
    pub async fn list(&self) -> Result<Vec<Category>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY sort_order, name"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list categories: {e}")))?;

        let mut categories = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_category(&row) {
                Ok(cat) => categories.push(cat),
                Err(e) => tracing::warn!("Skipping category row: {e}"),
            }
        }
        Ok(categories)
    }

    /// Just the names, in display order — the analyzer's prompt vocabulary.
    pub async fn names(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(self.list().await?.into_iter().map(|c| c.name).collect())
    }

    pub async fn create(&self, input: NewCategory) -> Result<Category, DatabaseError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO categories (name, description, color, sort_order, is_default, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                input.name.clone(),
                input.description,
                input.color,
                input.sort_order,
                now
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create category: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(id, name = %input.name, "Category created");

        self.find_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "category".into(),
                id: id.to_string(),
            })
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Category>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find category: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let cat = row_to_category(&row)
                    .map_err(|e| DatabaseError::Query(format!("category row parse: {e}")))?;
                Ok(Some(cat))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find category: {e}"))),
        }
    }

    pub async fn update(&self, id: i64, update: CategoryUpdate) -> Result<Category, DatabaseError> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "category".into(),
                id: id.to_string(),
            })?;

        let name = update.name.unwrap_or(current.name);
        let description = update.description.unwrap_or(current.description);
        let color = update.color.unwrap_or(current.color);
        let sort_order = update.sort_order.unwrap_or(current.sort_order);

        self.db
            .conn()
            .execute(
                "UPDATE categories SET name = ?1, description = ?2, color = ?3, sort_order = ?4 \
                 WHERE id = ?5",
                params![name, description, color, sort_order, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update category: {e}")))?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "category".into(),
                id: id.to_string(),
            })
    }

    /// Delete a category. Returns false when the id does not exist.
    pub async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute("DELETE FROM categories WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete category: {e}")))?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> CategoryStore {
        let db = Db::open_memory().await.unwrap();
        CategoryStore::new(db)
    }

    #[tokio::test]
    async fn seed_populates_empty_table_once() {
        let store = test_store().await;
        store.seed_defaults().await.unwrap();

        let names = store.names().await.unwrap();
        assert_eq!(
            names,
            vec![
                "Feature Request",
                "Bug Report",
                "Improvement",
                "Inquiry",
                "Other"
            ]
        );

        // Seeding again must not duplicate
        store.seed_defaults().await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn seed_respects_deletions() {
        let store = test_store().await;
        store.seed_defaults().await.unwrap();

        let other = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.name == "Other")
            .unwrap();
        assert!(store.delete(other.id).await.unwrap());

        // A non-empty table is left alone
        store.seed_defaults().await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn create_update_delete_roundtrip() {
        let store = test_store().await;
        let cat = store
            .create(NewCategory {
                name: "Security".into(),
                description: "Vulnerability reports".into(),
                color: "#8B5CF6".into(),
                sort_order: 10,
            })
            .await
            .unwrap();
        assert!(!cat.is_default);

        let updated = store
            .update(
                cat.id,
                CategoryUpdate {
                    description: Some("Security and privacy reports".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Security");
        assert_eq!(updated.description, "Security and privacy reports");

        assert!(store.delete(cat.id).await.unwrap());
        assert!(!store.delete(cat.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = test_store().await;
        store.seed_defaults().await.unwrap();

        let err = store
            .create(NewCategory {
                name: "Other".into(),
                description: String::new(),
                color: default_color(),
                sort_order: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
    }
}

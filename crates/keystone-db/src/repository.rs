//! Generic repository with optimistic concurrency.
//!
//! [`Repository`] holds the scan, insert, versioned update, versioned delete
//! and search logic once. An aggregate plugs in by implementing
//! [`Aggregate`], which names its table, lists its columns, produces the
//! values to write and decodes a row.
//!
//! Every aggregate table carries `id UUID`, `version BIGINT`, `created_at`
//! and `updated_at` in addition to its own columns. An update only succeeds
//! against the version the caller loaded:
//!
//! ```text
//! UPDATE contracts SET holder_name = $1, ..., version = $9, updated_at = now()
//!  WHERE id = $10 AND version = $11
//! ```
//!
//! Zero matching rows means someone else moved the row on (or removed it),
//! and the caller gets [`DbError::Conflict`]. Conflicts are never retried
//! here.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use keystone_types::Version;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::context::Context;
use crate::error::DbError;
use crate::pool::Database;
use crate::query::{FilterSet, Page, PageRequest, SearchQuery, SortKey, SqlValue};

/// An aggregate root stored in its own table.
pub trait Aggregate: Sized + Send + Sync {
    /// Human-readable entity name used in errors and logs.
    const ENTITY: &'static str;
    /// Table holding the root rows.
    const TABLE: &'static str;
    /// Aggregate-specific columns read back by [`Aggregate::from_row`],
    /// excluding `id`, `version`, `created_at` and `updated_at`.
    const COLUMNS: &'static [&'static str];
    /// Sort options callers may request.
    const SORTABLE: &'static [SortKey];
    /// Sort used when the request names none or an unknown one.
    const DEFAULT_SORT: SortKey;

    /// Search criteria accepted by [`Repository::search`].
    type Criteria: Send + Sync;

    /// Row identifier.
    fn id(&self) -> Uuid;

    /// Version as loaded (or as last written through a repository).
    fn version(&self) -> Version;

    /// Record the version the store now holds.
    fn set_version(&mut self, version: Version);

    /// Record the timestamps the store now holds.
    fn stamp(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>);

    /// Column/value pairs written on insert and update.
    fn write_values(&self) -> Vec<(&'static str, SqlValue)>;

    /// Decode a row selected with [`select_list`].
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;

    /// Translate criteria into filter clauses.
    fn filters(criteria: &Self::Criteria) -> Result<FilterSet, DbError>;
}

/// `id, version, <columns>, created_at, updated_at` for `A`.
pub fn select_list<A: Aggregate>() -> String {
    let mut list = String::from("id, version");
    for column in A::COLUMNS {
        list.push_str(", ");
        list.push_str(column);
    }
    list.push_str(", created_at, updated_at");
    list
}

/// Versioned CRUD and search over one aggregate table.
pub struct Repository<A> {
    db: Database,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A> core::fmt::Debug for Repository<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repository")
            .field("aggregate", &core::any::type_name::<A>())
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> Repository<A> {
    /// Create a repository over `db`.
    pub const fn new(db: Database) -> Self {
        Self {
            db,
            _aggregate: PhantomData,
        }
    }

    /// The database this repository writes to.
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Insert `entity` at [`Version::INITIAL`].
    ///
    /// On success the entity's version and timestamps reflect the stored row.
    pub async fn insert(&self, cx: &Context, entity: &mut A) -> Result<(), DbError> {
        let mut qb = insert_statement(entity);
        let row = self.db.fetch_one(cx, "insert", qb.build()).await?;
        let (created_at, updated_at) = timestamps(&row, "insert")?;
        entity.set_version(Version::INITIAL);
        entity.stamp(created_at, updated_at);
        tracing::debug!(entity = A::ENTITY, id = %entity.id(), "Inserted");
        Ok(())
    }

    /// Load by id, returning `None` if absent.
    pub async fn find(&self, cx: &Context, id: Uuid) -> Result<Option<A>, DbError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            select_list::<A>(),
            A::TABLE
        );
        let row = self
            .db
            .fetch_optional(cx, "find", sqlx::query(&sql).bind(id))
            .await?;
        row.as_ref()
            .map(A::from_row)
            .transpose()
            .map_err(|e| DbError::query("decode", e))
    }

    /// Load by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no row has this id.
    pub async fn get(&self, cx: &Context, id: Uuid) -> Result<A, DbError> {
        self.find(cx, id).await?.ok_or_else(|| DbError::NotFound {
            entity: A::ENTITY,
            id: id.to_string(),
        })
    }

    /// Write `entity` back if the stored version still equals its version.
    ///
    /// On success the in-memory version is advanced by one and `updated_at`
    /// reflects the store. On conflict the entity is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if zero rows matched `(id, version)`,
    /// whether the row was modified or deleted concurrently.
    pub async fn update(&self, cx: &Context, entity: &mut A) -> Result<(), DbError> {
        let expected = entity.version();
        let next = expected.next().ok_or_else(|| {
            DbError::Validation(format!("{} version {expected} cannot advance", A::ENTITY))
        })?;
        let mut qb = update_statement(entity, next);
        let row = self.db.fetch_optional(cx, "update", qb.build()).await?;
        let Some(row) = row else {
            tracing::debug!(
                entity = A::ENTITY,
                id = %entity.id(),
                expected = expected.get(),
                "Stale update rejected"
            );
            return Err(DbError::stale(A::ENTITY, entity.id(), expected.get()));
        };
        let (created_at, updated_at) = timestamps(&row, "update")?;
        entity.set_version(next);
        entity.stamp(created_at, updated_at);
        Ok(())
    }

    /// Delete the row if the stored version equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the row does not exist and
    /// [`DbError::Conflict`] if it exists at another version.
    pub async fn delete(&self, cx: &Context, id: Uuid, expected: Version) -> Result<(), DbError> {
        let sql = format!("DELETE FROM {} WHERE id = $1 AND version = $2", A::TABLE);
        let result = self
            .db
            .execute(cx, "delete", sqlx::query(&sql).bind(id).bind(expected.get()))
            .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(entity = A::ENTITY, %id, "Deleted");
            return Ok(());
        }
        let probe = format!("SELECT 1 FROM {} WHERE id = $1", A::TABLE);
        let exists = self
            .db
            .fetch_optional(cx, "delete", sqlx::query(&probe).bind(id))
            .await?
            .is_some();
        if exists {
            Err(DbError::stale(A::ENTITY, id, expected.get()))
        } else {
            Err(DbError::NotFound {
                entity: A::ENTITY,
                id: id.to_string(),
            })
        }
    }

    /// Count rows matching `criteria`.
    pub async fn count(&self, cx: &Context, criteria: &A::Criteria) -> Result<u64, DbError> {
        let filters = A::filters(criteria)?;
        let select = select_list::<A>();
        let search = SearchQuery::new(
            A::TABLE,
            &select,
            &filters,
            &PageRequest::default(),
            A::SORTABLE,
            A::DEFAULT_SORT,
        );
        self.count_matching(cx, &search).await
    }

    /// One page of rows matching `criteria`, plus the total match count.
    ///
    /// The count runs first; if it fails the page query is never issued.
    pub async fn search(
        &self,
        cx: &Context,
        criteria: &A::Criteria,
        page: &PageRequest,
    ) -> Result<Page<A>, DbError> {
        let filters = A::filters(criteria)?;
        let select = select_list::<A>();
        let search = SearchQuery::new(
            A::TABLE,
            &select,
            &filters,
            page,
            A::SORTABLE,
            A::DEFAULT_SORT,
        );

        let total = self.count_matching(cx, &search).await?;

        let mut data = search.data_statement();
        let rows = self.db.fetch_all(cx, "search page", data.build()).await?;
        let items = rows
            .iter()
            .map(A::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DbError::query("decode", e))?;

        tracing::debug!(
            entity = A::ENTITY,
            filters = filters.len(),
            sort = search.order_column(),
            total,
            returned = items.len(),
            "Search completed"
        );

        Ok(Page {
            items,
            total,
            page: page.page(),
            page_size: page.page_size(),
        })
    }

    async fn count_matching(&self, cx: &Context, search: &SearchQuery<'_>) -> Result<u64, DbError> {
        let mut count = search.count_statement();
        let row = self.db.fetch_one(cx, "search count", count.build()).await?;
        let total: i64 = row
            .try_get(0)
            .map_err(|e| DbError::query("search count", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

fn insert_statement<A: Aggregate>(entity: &A) -> QueryBuilder<'static, Postgres> {
    let values = entity.write_values();
    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(A::TABLE).push(" (id, version");
    for (column, _) in &values {
        qb.push(", ").push(*column);
    }
    qb.push(") VALUES (")
        .push_bind(entity.id())
        .push(", ")
        .push_bind(Version::INITIAL.get());
    for (_, value) in values {
        qb.push(", ");
        value.push_to(&mut qb);
    }
    qb.push(") RETURNING created_at, updated_at");
    qb
}

fn update_statement<A: Aggregate>(entity: &A, next: Version) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(A::TABLE).push(" SET ");
    for (column, value) in entity.write_values() {
        qb.push(column).push(" = ");
        value.push_to(&mut qb);
        qb.push(", ");
    }
    qb.push("version = ")
        .push_bind(next.get())
        .push(", updated_at = now() WHERE id = ")
        .push_bind(entity.id())
        .push(" AND version = ")
        .push_bind(entity.version().get())
        .push(" RETURNING created_at, updated_at");
    qb
}

fn timestamps(
    row: &PgRow,
    operation: &'static str,
) -> Result<(DateTime<Utc>, DateTime<Utc>), DbError> {
    let created_at = row
        .try_get("created_at")
        .map_err(|e| DbError::query(operation, e))?;
    let updated_at = row
        .try_get("updated_at")
        .map_err(|e| DbError::query(operation, e))?;
    Ok((created_at, updated_at))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Widget {
        id: Uuid,
        version: Version,
        name: String,
        weight: i64,
    }

    impl Aggregate for Widget {
        const ENTITY: &'static str = "widget";
        const TABLE: &'static str = "widgets";
        const COLUMNS: &'static [&'static str] = &["name", "weight"];
        const SORTABLE: &'static [SortKey] = &[SortKey::new("name", "name")];
        const DEFAULT_SORT: SortKey = SortKey::new("created", "created_at");

        type Criteria = Option<String>;

        fn id(&self) -> Uuid {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn stamp(&mut self, _: DateTime<Utc>, _: DateTime<Utc>) {}

        fn write_values(&self) -> Vec<(&'static str, SqlValue)> {
            vec![
                ("name", self.name.clone().into()),
                ("weight", self.weight.into()),
            ]
        }

        fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
            Ok(Self {
                id: row.try_get("id")?,
                version: Version::new(row.try_get("version")?),
                name: row.try_get("name")?,
                weight: row.try_get("weight")?,
            })
        }

        fn filters(criteria: &Self::Criteria) -> Result<FilterSet, DbError> {
            let mut filters = FilterSet::new();
            filters.equals("name", criteria.clone());
            Ok(filters)
        }
    }

    fn widget() -> Widget {
        Widget {
            id: Uuid::nil(),
            version: Version::new(4),
            name: String::from("sprocket"),
            weight: 12,
        }
    }

    #[test]
    fn select_list_wraps_aggregate_columns() {
        assert_eq!(
            select_list::<Widget>(),
            "id, version, name, weight, created_at, updated_at"
        );
    }

    #[test]
    fn insert_binds_every_column() {
        let qb = insert_statement(&widget());
        assert_eq!(
            qb.sql(),
            "INSERT INTO widgets (id, version, name, weight) \
             VALUES ($1, $2, $3, $4) RETURNING created_at, updated_at"
        );
    }

    #[test]
    fn update_is_guarded_by_expected_version() {
        let w = widget();
        let next = w.version.next().unwrap();
        let qb = update_statement(&w, next);
        assert_eq!(
            qb.sql(),
            "UPDATE widgets SET name = $1, weight = $2, version = $3, \
             updated_at = now() WHERE id = $4 AND version = $5 \
             RETURNING created_at, updated_at"
        );
    }

    #[test]
    fn criteria_become_filters() {
        let filters = Widget::filters(&Some(String::from("sprocket"))).unwrap();
        assert_eq!(filters.len(), 1);
        assert!(Widget::filters(&None).unwrap().is_empty());
    }
}

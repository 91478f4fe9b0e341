//! Holder persistence.

use chrono::{DateTime, Utc};
use keystone_types::{Holder, HolderId, Version};
use serde::Deserialize;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::context::Context;
use crate::error::DbError;
use crate::pool::Database;
use crate::query::{FilterSet, Page, PageRequest, SortKey, SqlValue};
use crate::repository::{Aggregate, Repository, select_list};

/// Filters accepted by [`HolderRepository::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HolderCriteria {
    /// Case-insensitive substring of name or e-mail.
    pub keyword: Option<String>,
    /// ISO 3166-1 alpha-2 country, any case.
    pub country_code: Option<String>,
}

impl Aggregate for Holder {
    const ENTITY: &'static str = "holder";
    const TABLE: &'static str = "holders";
    const COLUMNS: &'static [&'static str] = &["full_name", "email", "country_code"];
    const SORTABLE: &'static [SortKey] = &[
        SortKey::new("created_at", "created_at"),
        SortKey::new("full_name", "full_name"),
        SortKey::new("email", "email"),
        SortKey::new("country_code", "country_code"),
    ];
    const DEFAULT_SORT: SortKey = SortKey::new("created_at", "created_at");

    type Criteria = HolderCriteria;

    fn id(&self) -> Uuid {
        self.id.into_inner()
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn stamp(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) {
        self.created_at = created_at;
        self.updated_at = updated_at;
    }

    fn write_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("full_name", self.full_name.clone().into()),
            ("email", self.email.clone().into()),
            ("country_code", self.country_code.clone().into()),
        ]
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: HolderId::from(row.try_get::<Uuid, _>("id")?),
            version: Version::new(row.try_get("version")?),
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
            country_code: row.try_get("country_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn filters(criteria: &HolderCriteria) -> Result<FilterSet, DbError> {
        let mut filters = FilterSet::new();
        filters.keyword(&["full_name", "email"], criteria.keyword.as_deref())?;
        filters.equals(
            "country_code",
            criteria
                .country_code
                .as_deref()
                .map(|c| c.trim().to_ascii_uppercase()),
        );
        Ok(filters)
    }
}

fn validate_holder(holder: &Holder) -> Result<(), DbError> {
    if holder.full_name.trim().is_empty() {
        return Err(DbError::Validation(String::from("holder name is empty")));
    }
    let well_formed = holder
        .email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed {
        return Err(DbError::Validation(format!(
            "malformed e-mail address {:?}",
            holder.email
        )));
    }
    let country_ok = holder.country_code.len() == 2
        && holder.country_code.chars().all(|c| c.is_ascii_uppercase());
    if !country_ok {
        return Err(DbError::Validation(format!(
            "country code {:?} is not ISO 3166-1 alpha-2",
            holder.country_code
        )));
    }
    Ok(())
}

/// Persistence for [`Holder`] aggregates.
///
/// E-mail addresses are unique; writing a duplicate yields
/// [`DbError::Conflict`].
#[derive(Debug, Clone)]
pub struct HolderRepository {
    holders: Repository<Holder>,
}

impl HolderRepository {
    /// Create a repository over `db`.
    pub const fn new(db: Database) -> Self {
        Self {
            holders: Repository::new(db),
        }
    }

    /// Insert a new holder.
    pub async fn create(&self, cx: &Context, holder: &mut Holder) -> Result<(), DbError> {
        validate_holder(holder)?;
        self.holders.insert(cx, holder).await?;
        tracing::info!(holder_id = %holder.id, "Holder created");
        Ok(())
    }

    /// Load by id, or `None` if absent.
    pub async fn find(&self, cx: &Context, id: HolderId) -> Result<Option<Holder>, DbError> {
        self.holders.find(cx, id.into_inner()).await
    }

    /// Load by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no holder has this id.
    pub async fn get(&self, cx: &Context, id: HolderId) -> Result<Holder, DbError> {
        self.holders.get(cx, id.into_inner()).await
    }

    /// Look a holder up by e-mail (case-insensitive).
    pub async fn find_by_email(&self, cx: &Context, email: &str) -> Result<Option<Holder>, DbError> {
        let sql = format!(
            "SELECT {} FROM holders WHERE email = $1",
            select_list::<Holder>()
        );
        let row = self
            .holders
            .database()
            .fetch_optional(
                cx,
                "find holder by email",
                sqlx::query(&sql).bind(email.trim().to_ascii_lowercase()),
            )
            .await?;
        row.as_ref()
            .map(Holder::from_row)
            .transpose()
            .map_err(|e| DbError::query("find holder by email", e))
    }

    /// Version-checked write of the holder's fields.
    pub async fn update(&self, cx: &Context, holder: &mut Holder) -> Result<(), DbError> {
        validate_holder(holder)?;
        self.holders.update(cx, holder).await
    }

    /// Delete a holder at `expected`.
    ///
    /// Fails with a database error while contracts still reference it.
    pub async fn delete(&self, cx: &Context, id: HolderId, expected: Version) -> Result<(), DbError> {
        self.holders.delete(cx, id.into_inner(), expected).await
    }

    /// Search holders.
    pub async fn search(
        &self,
        cx: &Context,
        criteria: &HolderCriteria,
        page: &PageRequest,
    ) -> Result<Page<Holder>, DbError> {
        self.holders.search(cx, criteria, page).await
    }

    /// Count holders matching `criteria`.
    pub async fn count(&self, cx: &Context, criteria: &HolderCriteria) -> Result<u64, DbError> {
        self.holders.count(cx, criteria).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalized_holder_passes_validation() {
        let holder = Holder::new("Grace Hopper", "Grace@Navy.mil", "us");
        assert!(validate_holder(&holder).is_ok());
    }

    #[test]
    fn malformed_email_is_rejected() {
        for email in ["grace", "@navy.mil", "grace@localhost"] {
            let holder = Holder::new("Grace Hopper", email, "US");
            assert!(
                matches!(validate_holder(&holder), Err(DbError::Validation(_))),
                "{email} should be rejected"
            );
        }
    }

    #[test]
    fn country_code_must_be_two_letters() {
        let holder = Holder::new("Grace Hopper", "grace@navy.mil", "USA");
        assert!(validate_holder(&holder).is_err());
    }

    #[test]
    fn country_filter_is_case_insensitive() {
        let lower = Holder::filters(&HolderCriteria {
            country_code: Some(String::from(" gb ")),
            ..HolderCriteria::default()
        })
        .unwrap();
        let upper = Holder::filters(&HolderCriteria {
            country_code: Some(String::from("GB")),
            ..HolderCriteria::default()
        })
        .unwrap();
        assert_eq!(lower, upper);
    }
}

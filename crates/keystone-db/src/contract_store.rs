//! Contract persistence: the root row, its payout schedule and its terms.
//!
//! The `contracts` row is the only version-protected row. The payout
//! schedule in `contract_payouts` is rewritten (delete, then one batched
//! `UNNEST` insert) in the same unit of work as the root update, so a
//! conflicting root update also discards the schedule rewrite.

use chrono::{DateTime, NaiveDate, Utc};
use keystone_types::{Contract, ContractId, ContractStatus, HolderId, Payout, Version};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::context::Context;
use crate::error::DbError;
use crate::pool::Database;
use crate::query::{FilterSet, Page, PageRequest, SortKey, SqlValue};
use crate::repository::{Aggregate, Repository};

/// Columns matched by the free-text keyword filter.
const KEYWORD_COLUMNS: &[&str] = &["holder_name", "product_code"];

/// Filters accepted by [`ContractRepository::search`].
///
/// Every field is optional; unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContractCriteria {
    /// Case-insensitive substring of holder name or product code.
    pub keyword: Option<String>,
    /// Owning holder.
    pub holder_id: Option<HolderId>,
    /// Lifecycle state.
    pub status: Option<ContractStatus>,
    /// Product code, exact.
    pub product_code: Option<String>,
    /// Tag the contract must carry.
    pub tag: Option<String>,
    /// Earliest issue date, inclusive.
    pub issued_from: Option<NaiveDate>,
    /// Latest issue date, inclusive.
    pub issued_to: Option<NaiveDate>,
}

impl Aggregate for Contract {
    const ENTITY: &'static str = "contract";
    const TABLE: &'static str = "contracts";
    const COLUMNS: &'static [&'static str] = &[
        "holder_id",
        "holder_name",
        "product_code",
        "status",
        "premium",
        "tags",
        "issued_on",
        "terms",
    ];
    const SORTABLE: &'static [SortKey] = &[
        SortKey::new("created_at", "created_at"),
        SortKey::new("updated_at", "updated_at"),
        SortKey::new("issued_on", "issued_on"),
        SortKey::new("premium", "premium"),
        SortKey::new("holder_name", "holder_name"),
        SortKey::new("product_code", "product_code"),
        SortKey::new("status", "status"),
    ];
    const DEFAULT_SORT: SortKey = SortKey::new("created_at", "created_at");

    type Criteria = ContractCriteria;

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
            ("holder_id", self.holder_id.into_inner().into()),
            ("holder_name", self.holder_name.clone().into()),
            ("product_code", self.product_code.clone().into()),
            ("status", self.status.as_str().into()),
            ("premium", self.premium.into()),
            ("tags", self.tags.clone().into()),
            ("issued_on", self.issued_on.into()),
            ("terms", self.terms.clone().into()),
        ]
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<ContractStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            id: ContractId::from(row.try_get::<Uuid, _>("id")?),
            version: Version::new(row.try_get("version")?),
            holder_id: HolderId::from(row.try_get::<Uuid, _>("holder_id")?),
            holder_name: row.try_get("holder_name")?,
            product_code: row.try_get("product_code")?,
            status,
            premium: row.try_get("premium")?,
            tags: row.try_get("tags")?,
            issued_on: row.try_get("issued_on")?,
            terms: row.try_get("terms")?,
            schedule: Vec::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn filters(criteria: &ContractCriteria) -> Result<FilterSet, DbError> {
        let mut filters = FilterSet::new();
        filters.keyword(KEYWORD_COLUMNS, criteria.keyword.as_deref())?;
        filters
            .equals("holder_id", criteria.holder_id.map(HolderId::into_inner))
            .equals("status", criteria.status.map(ContractStatus::as_str))
            .equals("product_code", criteria.product_code.as_deref())
            .contains("tags", criteria.tag.as_deref());
        filters.date_range("issued_on", criteria.issued_from, criteria.issued_to)?;
        Ok(filters)
    }
}

/// Reject schedules the store would refuse or that make no sense.
fn validate_schedule(schedule: &[Payout]) -> Result<(), DbError> {
    let mut previous = 0;
    for payout in schedule {
        if payout.sequence <= previous {
            return Err(DbError::Validation(format!(
                "payout sequence {} is not strictly increasing",
                payout.sequence
            )));
        }
        if payout.amount.is_sign_negative() {
            return Err(DbError::Validation(format!(
                "payout {} has negative amount {}",
                payout.sequence, payout.amount
            )));
        }
        previous = payout.sequence;
    }
    Ok(())
}

fn validate_contract(contract: &Contract) -> Result<(), DbError> {
    if contract.product_code.trim().is_empty() {
        return Err(DbError::Validation(String::from("product code is empty")));
    }
    if contract.premium.is_sign_negative() {
        return Err(DbError::Validation(format!(
            "premium {} is negative",
            contract.premium
        )));
    }
    validate_schedule(&contract.schedule)
}

/// Persistence for [`Contract`] aggregates.
#[derive(Debug, Clone)]
pub struct ContractRepository {
    contracts: Repository<Contract>,
}

impl ContractRepository {
    /// Create a repository over `db`.
    pub const fn new(db: Database) -> Self {
        Self {
            contracts: Repository::new(db),
        }
    }

    const fn db(&self) -> &Database {
        self.contracts.database()
    }

    /// Insert the contract and its payout schedule as one unit of work.
    pub async fn create(&self, cx: &Context, contract: &mut Contract) -> Result<(), DbError> {
        validate_contract(contract)?;
        let target = &mut *contract;
        self.db()
            .run_in_transaction(cx, |tx| async move {
                self.contracts.insert(&tx, target).await?;
                self.write_schedule(&tx, target.id, &target.schedule).await
            })
            .await?;
        tracing::info!(
            contract_id = %contract.id,
            holder_id = %contract.holder_id,
            payouts = contract.schedule.len(),
            "Contract created"
        );
        Ok(())
    }

    /// Load a contract with its schedule, or `None` if absent.
    pub async fn find(&self, cx: &Context, id: ContractId) -> Result<Option<Contract>, DbError> {
        let Some(mut contract) = self.contracts.find(cx, id.into_inner()).await? else {
            return Ok(None);
        };
        contract.schedule = self.load_schedule(cx, id).await?;
        Ok(Some(contract))
    }

    /// Load a contract with its schedule.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no contract has this id.
    pub async fn load(&self, cx: &Context, id: ContractId) -> Result<Contract, DbError> {
        self.find(cx, id).await?.ok_or_else(|| DbError::NotFound {
            entity: Contract::ENTITY,
            id: id.to_string(),
        })
    }

    /// Write the root row (version-checked) and replace the schedule.
    ///
    /// On any failure the in-memory version and timestamps are restored to
    /// what they were before the call.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the contract changed since it was
    /// loaded; the stored row and schedule are left as they were.
    pub async fn update(&self, cx: &Context, contract: &mut Contract) -> Result<(), DbError> {
        validate_contract(contract)?;
        let loaded_version = contract.version;
        let loaded_at = (contract.created_at, contract.updated_at);
        let target = &mut *contract;
        let result = self
            .db()
            .run_in_transaction(cx, |tx| async move {
                self.contracts.update(&tx, target).await?;
                self.write_schedule(&tx, target.id, &target.schedule).await
            })
            .await;
        if let Err(e) = result {
            contract.version = loaded_version;
            (contract.created_at, contract.updated_at) = loaded_at;
            return Err(e);
        }
        tracing::debug!(
            contract_id = %contract.id,
            version = contract.version.get(),
            "Contract updated"
        );
        Ok(())
    }

    /// Shallow-merge `patch` into the stored terms (`terms || patch`),
    /// version-checked like any other root update.
    ///
    /// Top-level keys in `patch` replace those in the stored document; other
    /// keys are kept. On success `contract.terms` holds the merged document.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if `patch` is not a JSON object and
    /// [`DbError::Conflict`] if the contract changed since it was loaded.
    pub async fn merge_terms(
        &self,
        cx: &Context,
        contract: &mut Contract,
        patch: serde_json::Value,
    ) -> Result<(), DbError> {
        if !patch.is_object() {
            return Err(DbError::Validation(String::from(
                "terms patch must be a JSON object",
            )));
        }
        let expected = contract.version;
        let next = expected.next().ok_or_else(|| {
            DbError::Validation(format!("contract version {expected} cannot advance"))
        })?;
        let row = self
            .db()
            .fetch_optional(
                cx,
                "merge contract terms",
                sqlx::query(
                    r"UPDATE contracts
                      SET terms = terms || $1, version = $2, updated_at = now()
                      WHERE id = $3 AND version = $4
                      RETURNING terms, updated_at",
                )
                .bind(patch)
                .bind(next.get())
                .bind(contract.id.into_inner())
                .bind(expected.get()),
            )
            .await?;
        let Some(row) = row else {
            return Err(DbError::stale(Contract::ENTITY, contract.id, expected.get()));
        };
        contract.terms = row
            .try_get("terms")
            .map_err(|e| DbError::query("merge contract terms", e))?;
        contract.updated_at = row
            .try_get("updated_at")
            .map_err(|e| DbError::query("merge contract terms", e))?;
        contract.version = next;
        Ok(())
    }

    /// Delete a contract (and, by cascade, its schedule) at `expected`.
    pub async fn delete(
        &self,
        cx: &Context,
        id: ContractId,
        expected: Version,
    ) -> Result<(), DbError> {
        self.contracts.delete(cx, id.into_inner(), expected).await
    }

    /// Search contracts. Results carry root fields only; their schedules
    /// are empty (use [`ContractRepository::load`] for the full aggregate).
    pub async fn search(
        &self,
        cx: &Context,
        criteria: &ContractCriteria,
        page: &PageRequest,
    ) -> Result<Page<Contract>, DbError> {
        self.contracts.search(cx, criteria, page).await
    }

    /// Count contracts matching `criteria`.
    pub async fn count(&self, cx: &Context, criteria: &ContractCriteria) -> Result<u64, DbError> {
        self.contracts.count(cx, criteria).await
    }

    async fn load_schedule(&self, cx: &Context, id: ContractId) -> Result<Vec<Payout>, DbError> {
        let rows = self
            .db()
            .fetch_all(
                cx,
                "load payout schedule",
                sqlx::query(
                    r"SELECT sequence, due_on, amount
                      FROM contract_payouts
                      WHERE contract_id = $1
                      ORDER BY sequence",
                )
                .bind(id.into_inner()),
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Payout {
                    sequence: row.try_get("sequence")?,
                    due_on: row.try_get("due_on")?,
                    amount: row.try_get("amount")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| DbError::query("load payout schedule", e))
    }

    /// Replace the stored schedule with `schedule`. Must run inside the
    /// same unit of work as the root write.
    async fn write_schedule(
        &self,
        cx: &Context,
        id: ContractId,
        schedule: &[Payout],
    ) -> Result<(), DbError> {
        self.db()
            .execute(
                cx,
                "clear payout schedule",
                sqlx::query("DELETE FROM contract_payouts WHERE contract_id = $1")
                    .bind(id.into_inner()),
            )
            .await?;
        if schedule.is_empty() {
            return Ok(());
        }

        let len = schedule.len();
        let mut sequences: Vec<i32> = Vec::with_capacity(len);
        let mut due_dates: Vec<NaiveDate> = Vec::with_capacity(len);
        let mut amounts: Vec<Decimal> = Vec::with_capacity(len);
        for payout in schedule {
            sequences.push(payout.sequence);
            due_dates.push(payout.due_on);
            amounts.push(payout.amount);
        }

        self.db()
            .execute(
                cx,
                "insert payout schedule",
                sqlx::query(
                    r"INSERT INTO contract_payouts (contract_id, sequence, due_on, amount)
                      SELECT $1, s.sequence, s.due_on, s.amount
                      FROM UNNEST($2::INT4[], $3::DATE[], $4::NUMERIC[]) AS s(sequence, due_on, amount)",
                )
                .bind(id.into_inner())
                .bind(&sequences)
                .bind(&due_dates)
                .bind(&amounts),
            )
            .await?;

        tracing::debug!(contract_id = %id, count = len, "Wrote payout schedule (batch UNNEST)");
        Ok(())
    }
}

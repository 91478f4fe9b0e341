//! Annuity contract aggregate and its payout schedule.
//!
//! A [`Contract`] is an aggregate root: it carries its own [`Version`] and
//! owns the [`Payout`] rows of its schedule. The schedule has no version of
//! its own; it is always rewritten inside the same unit of work as the root.

use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::IdError;
use crate::ids::{ContractId, HolderId};
use crate::version::Version;

/// Lifecycle state of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    /// Quoted but not yet in force.
    Draft,
    /// In force and paying out on schedule.
    Active,
    /// Terminated early by the holder.
    Surrendered,
    /// Ran to the end of its schedule.
    Matured,
}

impl ContractStatus {
    /// Database/text representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Surrendered => "surrendered",
            Self::Matured => "matured",
        }
    }
}

impl FromStr for ContractStatus {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "surrendered" => Ok(Self::Surrendered),
            "matured" => Ok(Self::Matured),
            _ => Err(IdError::UnknownStatus(s.to_owned())),
        }
    }
}

impl core::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled payment in a contract's payout schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Position within the schedule, starting at 1.
    pub sequence: i32,
    /// Date the payment falls due.
    pub due_on: NaiveDate,
    /// Amount paid out.
    pub amount: Decimal,
}

/// An annuity contract (aggregate root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Unique contract identifier.
    pub id: ContractId,
    /// Optimistic-concurrency version.
    pub version: Version,
    /// Holder that owns the contract.
    pub holder_id: HolderId,
    /// Holder display name, denormalized for keyword search.
    pub holder_name: String,
    /// Product the contract was written under.
    pub product_code: String,
    /// Lifecycle state.
    pub status: ContractStatus,
    /// Single premium paid at issue.
    pub premium: Decimal,
    /// Free-form classification tags.
    pub tags: Vec<String>,
    /// Issue date.
    pub issued_on: NaiveDate,
    /// Product terms as structured JSON.
    ///
    /// Keys and nesting round-trip losslessly; numbers may come back as
    /// floating point.
    pub terms: serde_json::Value,
    /// Payout schedule, ordered by `sequence`.
    pub schedule: Vec<Payout>,
    /// When the row was first written.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    /// Create a draft contract at [`Version::INITIAL`] with an empty schedule.
    pub fn new(
        holder_id: HolderId,
        holder_name: &str,
        product_code: &str,
        premium: Decimal,
        issued_on: NaiveDate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ContractId::new(),
            version: Version::INITIAL,
            holder_id,
            holder_name: holder_name.to_owned(),
            product_code: product_code.to_owned(),
            status: ContractStatus::Draft,
            premium,
            tags: Vec::new(),
            issued_on,
            terms: serde_json::Value::Object(serde_json::Map::new()),
            schedule: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Total amount scheduled for payout.
    pub fn scheduled_total(&self) -> Decimal {
        self.schedule
            .iter()
            .fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.amount))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Contract {
        Contract::new(
            HolderId::new(),
            "Ada Lovelace",
            "FIXED-10",
            Decimal::new(100_000, 0),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        )
    }

    #[test]
    fn new_contract_is_draft_at_initial_version() {
        let c = sample();
        assert_eq!(c.status, ContractStatus::Draft);
        assert_eq!(c.version, Version::INITIAL);
        assert!(c.schedule.is_empty());
        assert!(c.terms.as_object().unwrap().is_empty());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ContractStatus::Draft,
            ContractStatus::Active,
            ContractStatus::Surrendered,
            ContractStatus::Matured,
        ] {
            assert_eq!(status.as_str().parse::<ContractStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<ContractStatus>().is_err());
    }

    #[test]
    fn scheduled_total_sums_payouts() {
        let mut c = sample();
        c.schedule = vec![
            Payout {
                sequence: 1,
                due_on: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                amount: Decimal::new(1050, 2),
            },
            Payout {
                sequence: 2,
                due_on: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                amount: Decimal::new(2000, 2),
            },
        ];
        assert_eq!(c.scheduled_total(), Decimal::new(3050, 2));
    }
}

//! Domain aggregates persisted by the Keystone data layer.
//!
//! Each aggregate root carries a typed identifier and a [`Version`] used for
//! optimistic concurrency. The types here are storage-agnostic; row mapping
//! lives in `keystone-db`.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for aggregate identifiers
//! - [`version`] -- The optimistic-concurrency version counter
//! - [`contract`] -- Annuity contracts and their payout schedules
//! - [`holder`] -- Contract holders
//! - [`error`] -- Parse errors for ids and enumerations

pub mod contract;
pub mod error;
pub mod holder;
pub mod ids;
pub mod version;

pub use contract::{Contract, ContractStatus, Payout};
pub use error::IdError;
pub use holder::Holder;
pub use ids::{ContractId, HolderId};
pub use version::Version;

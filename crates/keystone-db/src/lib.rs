//! Transactional `PostgreSQL` data-access layer for Keystone.
//!
//! Every operation takes a [`Context`] (cancellation token, optional
//! deadline, optional unit of work). A context produced by
//! [`Database::run_in_transaction`] carries the unit of work, and every
//! repository call made with it joins that transaction; nested
//! `run_in_transaction` calls become savepoints.
//!
//! # Architecture
//!
//! ```text
//! Caller (Context)
//!     |
//!     +-- Database::run_in_transaction ---> BEGIN / SAVEPOINT
//!     |       |
//!     |       +-- ContractRepository    (root + payout schedule + terms)
//!     |       +-- HolderRepository      (root, unique e-mail)
//!     |               |
//!     |               +-- Repository<A> (versioned CRUD, search)
//!     |                       |
//!     |                       +-- SearchQuery / FilterSet (count + page)
//!     |
//!     +-- Database (pool) <--- PoolConfig (YAML + KEYSTONE_DB_* env)
//! ```
//!
//! # Modules
//!
//! - [`config`] -- Pool configuration, defaults, YAML and environment loading
//! - [`pool`] -- Pool establishment with retry, health checks, migrations
//! - [`retry`] -- Exponential backoff
//! - [`context`] -- Cancellation, deadline and unit-of-work carrier
//! - [`unit_of_work`] -- The transaction handle shared along a call chain
//! - [`transaction`] -- Top-level transactions and savepoint nesting
//! - [`query`] -- Filter, sort and pagination rendering
//! - [`repository`] -- Generic optimistic-concurrency repository
//! - [`contract_store`] -- Contract aggregate persistence
//! - [`holder_store`] -- Holder aggregate persistence
//! - [`error`] -- Shared error types

pub mod config;
pub mod context;
pub mod contract_store;
pub mod error;
mod executor;
pub mod holder_store;
pub mod pool;
pub mod query;
pub mod repository;
pub mod retry;
pub mod transaction;
pub mod unit_of_work;

// Re-export primary types for convenience.
pub use config::{PoolConfig, SslMode};
pub use context::Context;
pub use contract_store::{ContractCriteria, ContractRepository};
pub use error::{DbError, ErrorKind};
pub use holder_store::{HolderCriteria, HolderRepository};
pub use pool::{Database, PoolStatus};
pub use query::{FilterSet, Page, PageRequest, SortDirection, SortKey, SqlValue};
pub use repository::{Aggregate, Repository};
pub use retry::{Backoff, RetryError};
pub use unit_of_work::UnitOfWork;

//! # strata-store
//!
//! Versioned schema migrations for SQLite databases.
//!
//! Migration scripts live on disk as `<version>.<name>.<up|down>.sql` files.
//! The crate discovers them ([`Catalog`]), tracks which versions have been
//! applied inside the target database ([`AppliedStore`]) and runs the pending
//! or reversible ones one transaction per version ([`Migrator`]).
//!
//! Everything is synchronous and re-derived on every invocation: the catalog
//! is read from disk and the applied set from the tracking table each time a
//! [`Migrator`] operation starts.

pub mod applied;
pub mod catalog;
pub mod database;
pub mod engine;
pub mod lock;
pub mod models;

mod error;

pub use applied::AppliedStore;
pub use catalog::Catalog;
pub use database::Database;
pub use engine::{CancelToken, Migrator, MigratorSettings};
pub use error::{CatalogError, MigrateError, StoreError};
pub use models::*;

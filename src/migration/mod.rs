//! Schema migration subsystem.
//!
//! # Data Flow
//! ```text
//! registered MigrationTargets (in order)
//!     → runner.rs: fresh ServiceScope per target
//!         → DataStore::migrate (pending schema changes)
//!         → Seeder::seed (awaited inline, if present)
//!     → first failure stops the run; later targets are never touched
//!
//! postgres.rs: sqlx-backed DataStore + SQL script seeder
//! ```
//!
//! # Design Decisions
//! - Strictly sequential: migrations never race each other or the listener
//! - No retries; a failed target is fatal for startup

pub mod postgres;
pub mod runner;

pub use postgres::{PostgresStore, SqlScriptSeeder};
pub use runner::{apply_migrations, BoxError, DataStore, MigrationError, MigrationTarget, Seeder, ServiceScope};

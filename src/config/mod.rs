//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! appsettings.json (required)
//!     → appsettings.{Environment}.json (optional)
//!     → environment variables (`__` becomes `:`)
//!     → command-line overrides
//!     → provisional ResolvedConfiguration
//!
//! UseVault = true?
//!     → secrets.rs builds a SecretStore from Vault:Name/ClientId/ClientSecret
//!     → secrets layered on top of everything else
//!     → final ResolvedConfiguration (immutable, shared via Arc)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once resolved; every consumer reads, none write
//! - Keys are case-insensitive and `:`-separated
//! - Only the base file is mandatory; every other layer may be empty

pub mod loader;
pub mod schema;
pub mod secrets;

pub use loader::{ConfigError, ConfigurationResolver, EnvironmentSource, ResolverOptions};
pub use schema::ResolvedConfiguration;
pub use secrets::{KeyVaultClient, SecretStore, SecretStoreError, SecretStoreFactory, VaultSettings};

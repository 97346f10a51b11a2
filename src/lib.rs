//! Startup host for the catalog service.
//!
//! Resolves layered configuration, builds the logger, applies schema
//! migrations and serves a router on two ports (HTTP/1.1 + HTTP/2 and
//! HTTP/2-only RPC). [`Bootstrap`] runs the phases in order and maps the
//! result to a process exit code.

pub mod config;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod migration;
pub mod net;
pub mod observability;

pub use config::{ConfigurationResolver, ResolvedConfiguration, ResolverOptions};
pub use http::{Host, HostBuilder};
pub use identity::ApplicationIdentity;
pub use lifecycle::{Bootstrap, BootstrapError, BootstrapOutcome, BootstrapState, Shutdown};
pub use migration::MigrationTarget;
pub use observability::{Logger, LoggerBuilder};

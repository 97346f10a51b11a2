//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Init → ConfigLoaded → LoggerReady → HostBuilt → Migrated → Listening
//!     any phase error → Failed (fatal log once a logger exists)
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Flush logs
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Resolve the shutdown future
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then logger, then host, migrations and listeners
//! - No retries and no phase timeouts; supervision is external

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
pub use startup::{Bootstrap, BootstrapError, BootstrapOutcome, BootstrapState};

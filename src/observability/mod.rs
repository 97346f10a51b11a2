//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! ResolvedConfiguration
//!     → settings.rs (sink URLs, Serilog levels and WriteTo entries)
//!     → logging.rs (registry + Targets filter + console + SinkLayer)
//!
//! tracing event
//!     → sink.rs (LogEvent, span fields, ApplicationContext)
//!     → shipping.rs (batched HTTP: Seq, HTTP collector, telemetry)
//! ```
//!
//! # Design Decisions
//! - Nothing logs before the logger exists; startup errors before that
//!   point are reported through the exit code only
//! - Sinks never block the caller; remote delivery is asynchronous
//! - Close-and-flush drains every sink before the process exits

pub mod logging;
pub mod settings;
pub mod shipping;
pub mod sink;

pub use logging::{init_logger, Logger, LoggerBuilder, LoggerInitError};
pub use shipping::ShippingLimits;
pub use sink::{LogEvent, LogLevel, LogSink, MemorySink, APPLICATION_CONTEXT};

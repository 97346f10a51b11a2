//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ResolvedConfiguration
//!     → ports.rs (PORT / GRPC_PORT → PortPair)
//!     → listener.rs (bind 0.0.0.0:primary as Http1AndHttp2,
//!                    bind 0.0.0.0:rpc as Http2)
//!     → connection.rs (lifecycle tracking for graceful shutdown)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Port collisions are not checked up front; the second bind fails

pub mod connection;
pub mod listener;
pub mod ports;

pub use listener::{Listener, ListenerError, ListenerOptions, ListenerProtocols};
pub use ports::{select_ports, PortPair};

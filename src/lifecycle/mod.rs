//! Lifecycle management for the proxy binary.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → logging → metrics → ProxyServer → listen
//!
//! Shutdown (shutdown.rs):
//!     close() → stop accepting → drain connections → done
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: observability first, listener last
//! - Ordered shutdown: stop accept, drain, close
//! - Draining has a deadline; stragglers are left behind

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;

//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy flows produce:
//!     → events.rs (listener callbacks: start, proxyReq, proxyRes, end, ...)
//!     → logging.rs (structured log events, one span per flow)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → Embedders registering listeners on the proxy server
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod events;
pub mod logging;
pub mod metrics;

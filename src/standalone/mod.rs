//! Proxy helpers that work without a [`ProxyServer`](crate::ProxyServer).
//!
//! # Data Flow
//! ```text
//! proxy_fetch:   addr + request → upstream → response (no redirects followed)
//! proxy_upgrade: addr + upgrade request + client socket → 101 → Tunnel
//! ```

pub mod fetch;
pub mod upgrade;

pub use fetch::{proxy_fetch, FetchInit, FetchInput};
pub use upgrade::{proxy_upgrade, UpgradeOptions};

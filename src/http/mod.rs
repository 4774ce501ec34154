//! HTTP proxying subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request (ProxyRequest) + ServerResponse
//!     → server.rs (merge options, pick pipeline, flow span)
//!     → middleware/ (web or ws passes)
//!     → outgoing.rs (outbound request descriptor)
//!     → net::transport (connect, send)
//!     → middleware/web_outgoing.rs (status, headers, cookies) | tunnel.rs (pipe)
//!     → ServerResponse / client socket
//! ```

pub mod body;
pub mod cookies;
pub mod middleware;
pub mod outgoing;
pub mod request;
pub mod response;
pub mod server;
pub mod tunnel;

pub use request::{ProxyRequest, RequestHead};
pub use response::ServerResponse;
pub use server::ProxyServer;

//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound (listen):
//!     listener.rs (accept loop) → tls.rs (optional handshake)
//!     → connection.rs (tracking) → hyper connection → ProxyServer
//!
//! Outbound:
//!     address.rs (addr forms) → transport.rs (TCP | unix | TLS, hyper client)
//!     socket.rs (client side of upgrades, tunnel streams)
//! ```
//!
//! # Design Decisions
//! - Each accepted connection is tracked so close can drain it
//! - TLS is optional on both legs and handled transparently

pub mod address;
pub mod connection;
pub mod listener;
pub mod socket;
pub mod tls;
pub mod transport;

//! A lightweight SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT with IPv4 and domain-name destinations
//!     - No-authentication method only; everything else is refused
//!     - Built-in DNS resolver over raw UDP with resend-based retry
//!     - Single-threaded cooperative runtime, readiness-driven relay
//!       with fixed-capacity fill/drain buffers
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [DNS (RFC 1035)](https://datatracker.ietf.org/doc/html/rfc1035)
//!
//! BIND, UDP ASSOCIATE, and IPv6 destinations are rejected by the
//! protocol state machine rather than implemented.
//!
//! # Example
//! ```no_run
//! use minisocks::ProxyServer;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ProxyServer::new("127.0.0.1:1080");
//!     server.run().await
//! }
//! ```

pub mod dns;
pub mod resolver;
pub mod server;
pub mod session;
pub mod socks5;
pub mod upstream;

// Re-export main types at crate root for convenience
pub use resolver::Resolver;
pub use server::ProxyServer;
pub use session::Session;
pub use socks5::{AuthMethod, Command, ReplyCode, Version};

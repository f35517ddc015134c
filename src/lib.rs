//! A SOCKS5 and HTTP tunneling proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT (BIND and UDP ASSOCIATE are answered with COMMAND NOT SUPPORTED)
//!     - No Authentication
//!     - Username/Password Authentication
//!     - IPv4, IPv6 and domain name targets, domain names resolved at dial time
//!     - Bidirectional relay with half-close, idle timeout and bounded linger
//!     - Registry of live sessions, deregistered on every exit path
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! ## HTTP Proxy
//!
//! - `CONNECT host:port` tunnels through the same dialer and relay
//! - Absolute `http://` requests are forwarded to the origin
//! - One access record per request on the `access` tracing target
//!
//! # Example
//! ```no_run
//! use multiproxy::{HttpProxy, ProxyConfig, ProxyContext, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ProxyContext::new(ProxyConfig::new());
//!     let mut socks = Socks5Server::with_context(ctx.clone());
//!     let mut http = HttpProxy::with_context("127.0.0.1:8080", ctx);
//!     tokio::try_join!(socks.run(), http.run())?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod address;
pub mod auth;
pub mod codec;
pub mod commands;
pub mod config;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

// Re-export main types at crate root for convenience
pub use access::{AccessLog, AccessRecord};
pub use address::{Address, DialTarget};
pub use auth::Credentials;
pub use config::ProxyConfig;
pub use http::HttpProxy;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use registry::{ConnectionRegistry, SessionId, SessionState};
pub use relay::{RelayConfig, RelayResult};
pub use server::{ProxyContext, Socks5Server};
pub use session::{Session, SessionOutcome};

//! Intercepting HTTP proxy core.
//!
//! `sidecar-proxy` accepts plain HTTP proxy requests and CONNECT tunnels and
//! runs each request through a pipeline:
//!
//! 1. **Destination overrides** (`targets`) - Per-domain, per-path rules that
//!    redirect a request to another endpoint or chain it through a local
//!    backend (`tunnel://host:port`).
//!
//! 2. **Interceptor chain** (`interceptor`, `matcher`) - Prioritised hooks
//!    selected by domain rules. The built-in `requestReplace` interceptor
//!    rewrites headers with `${...}` variables taken from the request as the
//!    client sent it.
//!
//! 3. **Tunnel establisher** (`tunnel`) - Applies DNS and certificate
//!    overrides, connects through the connection pool, and relays the
//!    response or splices a protocol upgrade into a raw tunnel.
//!
//! Self-signed certificate failures are remembered per destination by the
//! compatibility store (`compat`) so the next attempt skips verification.

pub mod audit;
pub mod compat;
pub mod config;
pub mod connect;
pub mod context;
pub mod dns;
pub mod error;
pub mod inbound;
pub mod interceptor;
pub mod matcher;
pub mod pool;
pub mod request;
pub mod server;
pub mod sink;
pub mod stream;
pub mod targets;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use config::ProxyConfig;
pub use error::{ConnectError, ProxyError, Result};
pub use request::OutboundRequest;
pub use server::{start, ProxyHandle};
pub use targets::{DestinationOverrides, ProxyTarget};
pub use tunnel::{TunnelEstablisher, TunnelOutcome};

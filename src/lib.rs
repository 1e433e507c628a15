//! # Rewrite Proxy Library
//!
//! A rewriting reverse HTTP proxy. It accepts client requests at an
//! *exposed* origin, forwards them to an *upstream* origin, and rewrites
//! request and response payloads so that the upstream's internal identity
//! (the *target* origin) never reaches the client and the client's exposed
//! identity never reaches the upstream: body text, redirect `Location`
//! headers, and cookie `Domain`/`Secure` attributes are all substituted
//! between the two identities on every cycle.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, validation, and hot-reload support
//! - [`error`]: Error types and handling
//! - [`host`]: Origins, host utilities, and the `HostConfig` contract
//! - [`logging`]: Logging setup and configuration
//! - [`mapper`]: The `HostMapper` trait and the config-backed mapper
//! - [`proxy`]: The proxy façade, pipeline, and transport abstraction
//! - [`rewrite`]: Body and header rewriters
//!
//! ## Example
//!
//! ```ignore
//! use rewrite_proxy::config::ConfigManager;
//! use rewrite_proxy::mapper::ConfigHostMapper;
//! use rewrite_proxy::proxy::Proxy;
//!
//! // Load configuration
//! let manager = ConfigManager::new("config.yaml")?;
//!
//! // Route requests by the configured host table
//! let mapper = ConfigHostMapper::new(manager.shared());
//! let proxy = Proxy::new(mapper);
//! ```
//!
//! ## Request flow
//!
//! 1. The host mapper resolves the exposed host to a `HostConfig`
//! 2. The outbound rewrite strips the path prefix, addresses the upstream,
//!    announces the target host, and substitutes origins in the body
//! 3. The transport executes the upstream exchange
//! 4. The inbound rewrite substitutes origins in `Location`, `Set-Cookie`,
//!    and the body before the response is delivered

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod mapper;
pub mod proxy;
pub mod rewrite;

pub use config::{AppConfig, ConfigManager, RouteConfig};
pub use error::{BoxError, ProxyError, Result};
pub use host::{HostConfig, Origin};
pub use mapper::{ConfigHostMapper, HostMapper};
pub use proxy::{HttpTransport, Proxy, ProxyBody, Transport};

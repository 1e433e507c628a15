//! Origins, host utilities, and the host mapper contract type.
//!
//! Every proxied request is described by three origins: the *exposed* origin
//! the client addressed, the *upstream* origin the next hop is reached at,
//! and the *target* origin the terminal service believes it is serving. The
//! [`HostConfig`] returned by a host mapper carries the upstream and target
//! halves of that triple plus the cookie-domain and path-prefix policy.

use http::request;
use url::Url;

use crate::error::{ProxyError, Result};

/// Returns `host` with a trailing `":port"` removed.
///
/// Cookie `Domain` attributes and host comparisons ignore the port while
/// request routing preserves it. Bracketed IPv6 authorities keep their
/// brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[..=end];
        }
        return host;
    }
    // A bare IPv6 address has multiple colons and no port to strip.
    if host.matches(':').count() > 1 {
        return host;
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Returns the explicit port of a `host[:port]` string, if any.
pub fn port_of(host: &str) -> Option<u16> {
    let stripped = strip_port(host);
    if stripped.len() == host.len() {
        return None;
    }
    host[stripped.len() + 1..].parse().ok()
}

/// Case-insensitive host equality on the port-stripped hosts.
pub fn compare_host(a: &str, b: &str) -> bool {
    strip_port(a).eq_ignore_ascii_case(strip_port(b))
}

/// A `(scheme, host)` pair. The host may carry an explicit port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// URL scheme, `http` or `https`.
    pub scheme: String,

    /// Host with optional `:port` suffix.
    pub host: String,
}

impl Origin {
    /// Creates an origin from its parts.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// Parses an absolute `http`/`https` URL into its origin.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::config_validation(format!("Invalid URL {raw}: {e}")))?;
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::config_validation(format!(
                "Unsupported scheme in {raw}: {scheme}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::config_validation(format!("URL {raw} has no host")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self::new(scheme, host))
    }

    /// The host with any port removed.
    pub fn host_without_port(&self) -> &str {
        strip_port(&self.host)
    }

    /// The explicit port, or the scheme default.
    pub fn effective_port(&self) -> u16 {
        port_of(&self.host).unwrap_or(if self.scheme == "https" { 443 } else { 80 })
    }

    /// Origin equality: scheme match plus case-insensitive host match with
    /// default ports normalized away.
    pub fn same_origin(&self, other: &Origin) -> bool {
        self.scheme.eq_ignore_ascii_case(&other.scheme)
            && compare_host(&self.host, &other.host)
            && self.effective_port() == other.effective_port()
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

/// Per-request routing contract returned by a host mapper.
///
/// `upstream_*` is where bytes are physically sent; `target_*` is the
/// identity the terminal service believes itself to have and therefore the
/// identity that must be rewritten out of its responses. The lifetime of a
/// `HostConfig` is exactly one request/response cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Host (with optional port) the next-hop connection is opened to.
    pub upstream_host: String,

    /// Scheme used for the next-hop connection.
    pub upstream_scheme: String,

    /// Host the terminal service believes it is serving.
    pub target_host: String,

    /// Scheme the terminal service believes it is served under.
    pub target_scheme: String,

    /// Path segment the client sees but the upstream does not. Must begin
    /// with `/` and not end with `/`.
    pub path_prefix: Option<String>,

    /// Replacement for cookie `Domain` attributes that match the target
    /// host. When unset, matching `Domain` attributes are removed.
    pub cookie_domain: Option<String>,
}

impl HostConfig {
    /// The upstream origin.
    pub fn upstream_origin(&self) -> Origin {
        Origin::new(self.upstream_scheme.clone(), self.upstream_host.clone())
    }

    /// The target origin.
    pub fn target_origin(&self) -> Origin {
        Origin::new(self.target_scheme.clone(), self.target_host.clone())
    }

    /// Checks the origin-triple invariants before any rewrite is attempted.
    pub fn validate(&self) -> Result<()> {
        for (what, scheme, host) in [
            ("upstream", &self.upstream_scheme, &self.upstream_host),
            ("target", &self.target_scheme, &self.target_host),
        ] {
            if scheme != "http" && scheme != "https" {
                return Err(ProxyError::config_validation(format!(
                    "{what} scheme must be http or https, got {scheme:?}"
                )));
            }
            if host.is_empty() {
                return Err(ProxyError::config_validation(format!(
                    "{what} host cannot be empty"
                )));
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !prefix.starts_with('/') || prefix.ends_with('/') {
                return Err(ProxyError::config_validation(format!(
                    "Path prefix must begin with '/' and not end with '/', got {prefix:?}"
                )));
            }
        }
        Ok(())
    }
}

/// The host the client addressed: `X-Forwarded-Host` when an upstream proxy
/// set it, otherwise the request's own `Host`.
pub fn effective_host(parts: &request::Parts) -> Option<&str> {
    parts
        .headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|h| !h.is_empty())
        })
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
}

/// Derives the exposed origin of an inbound request.
///
/// The scheme defaults to `http` on the plain listener and is overridden by
/// a valid `X-Forwarded-Proto` header set by a fronting proxy.
pub fn exposed_origin(parts: &request::Parts) -> Result<Origin> {
    let host = effective_host(parts)
        .ok_or_else(|| ProxyError::config_validation("Request carries no host"))?;

    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| s == "http" || s == "https")
        .unwrap_or_else(|| "http".to_string());

    Ok(Origin::new(scheme, host.to_string()))
}

//! Host mapping: resolving an inbound request to a [`HostConfig`].
//!
//! A [`HostMapper`] is consulted exactly once per request, before the
//! outbound rewrite. The config-backed [`ConfigHostMapper`] resolves the
//! exposed host against a cached route table; plain closures implement the
//! trait too, which keeps programmatic setups and tests light.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use http::request;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::BoxError;
use crate::host::{self, strip_port, HostConfig};

/// Resolves an inbound request to the routing contract for its cycle.
///
/// Mappers are shared across concurrent requests and must not retain the
/// request or the returned config beyond the call.
pub trait HostMapper: Send + Sync {
    /// Maps a request to its `HostConfig`, or an error that is surfaced
    /// through the request error hook.
    fn map(&self, request: &request::Parts) -> Result<HostConfig, BoxError>;
}

impl<F> HostMapper for F
where
    F: Fn(&request::Parts) -> Result<HostConfig, BoxError> + Send + Sync,
{
    fn map(&self, request: &request::Parts) -> Result<HostConfig, BoxError> {
        self(request)
    }
}

/// Host mapper backed by the configuration's route table.
///
/// Lookups go through a cached map keyed by the lowercased, port-stripped
/// exposed host. The cache is rebuilt on demand after a config reload.
#[derive(Clone)]
pub struct ConfigHostMapper {
    /// Thread-safe reference to the configuration.
    config: Arc<RwLock<AppConfig>>,

    /// Cached route lookup map.
    routes: Arc<RwLock<HashMap<String, HostConfig>>>,
}

impl ConfigHostMapper {
    /// Creates a new ConfigHostMapper.
    pub fn new(config: Arc<RwLock<AppConfig>>) -> Self {
        let routes = {
            let cfg = config.read().expect("config lock poisoned");
            cfg.build_route_map()
        };

        Self {
            config,
            routes: Arc::new(RwLock::new(routes)),
        }
    }

    /// Rebuilds the route cache from config (called on config reload).
    pub fn refresh_cache(&self) {
        let new_map = {
            let cfg = self.config.read().expect("config lock poisoned");
            cfg.build_route_map()
        };

        let mut routes = self.routes.write().expect("route cache lock poisoned");
        *routes = new_map;
        debug!("Route cache refreshed");
    }
}

impl HostMapper for ConfigHostMapper {
    fn map(&self, request: &request::Parts) -> Result<HostConfig, BoxError> {
        let host = host::effective_host(request)
            .ok_or_else(|| BoxError::from("request carries no host"))?;
        let key = strip_port(host).to_lowercase();

        let routes = self.routes.read().expect("route cache lock poisoned");
        match routes.get(&key) {
            Some(config) => {
                debug!(host = %host, upstream = %config.upstream_host, "Resolved route");
                Ok(config.clone())
            }
            None => Err(format!("no route configured for host {host}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use http::Request;

    fn parts_for_host(host: &str) -> request::Parts {
        let (parts, _) = Request::builder()
            .uri("/")
            .header("host", host)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn mapper_with_routes(routes: Vec<RouteConfig>) -> ConfigHostMapper {
        let config = AppConfig {
            routes,
            ..Default::default()
        };
        ConfigHostMapper::new(Arc::new(RwLock::new(config)))
    }

    fn route(host: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            host: host.to_string(),
            upstream: upstream.to_string(),
            target: None,
            path_prefix: None,
            cookie_domain: None,
        }
    }

    #[test]
    fn test_lookup_case_and_port_insensitive() {
        let mapper = mapper_with_routes(vec![route("Example.Com", "http://127.0.0.1:3000")]);

        for host in ["example.com", "EXAMPLE.COM", "example.com:8080"] {
            let config = mapper.map(&parts_for_host(host)).unwrap();
            assert_eq!(config.upstream_host, "127.0.0.1:3000");
            assert_eq!(config.upstream_scheme, "http");
            // Target defaults to the upstream.
            assert_eq!(config.target_host, "127.0.0.1:3000");
        }
    }

    #[test]
    fn test_forwarded_host_takes_precedence() {
        let mapper = mapper_with_routes(vec![route("example.com", "http://127.0.0.1:3000")]);

        let (parts, _) = Request::builder()
            .uri("/")
            .header("host", "ingress.internal")
            .header("x-forwarded-host", "example.com")
            .body(())
            .unwrap()
            .into_parts();
        assert!(mapper.map(&parts).is_ok());
    }

    #[test]
    fn test_unknown_host_errors() {
        let mapper = mapper_with_routes(vec![route("example.com", "http://127.0.0.1:3000")]);

        let err = mapper.map(&parts_for_host("unknown.io")).unwrap_err();
        assert!(err.to_string().contains("unknown.io"));
    }

    #[test]
    fn test_refresh_cache_picks_up_new_routes() {
        let config = Arc::new(RwLock::new(AppConfig {
            routes: vec![route("a.example.com", "http://127.0.0.1:3000")],
            ..Default::default()
        }));
        let mapper = ConfigHostMapper::new(config.clone());
        assert!(mapper.map(&parts_for_host("b.example.com")).is_err());

        {
            let mut cfg = config.write().unwrap();
            cfg.routes.push(route("b.example.com", "http://127.0.0.1:4000"));
        }
        mapper.refresh_cache();

        let resolved = mapper.map(&parts_for_host("b.example.com")).unwrap();
        assert_eq!(resolved.upstream_host, "127.0.0.1:4000");
    }

    #[test]
    fn test_closure_mapper() {
        let mapper = |_: &request::Parts| -> Result<HostConfig, BoxError> {
            Err("some host mapper error occurred".into())
        };
        let err = mapper.map(&parts_for_host("example.com")).unwrap_err();
        assert_eq!(err.to_string(), "some host mapper error occurred");
    }
}

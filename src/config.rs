//! Configuration: the YAML file format, its validation rules, and live
//! reload.
//!
//! An [`AppConfig`] is deserialized with serde and held behind an
//! `Arc<RwLock>` so the running proxy and the reload path share one copy.
//! [`ConfigManager::watch`] installs a `notify` file watcher that folds
//! file edits into the shared state without a restart and tells the caller
//! about each successful reload.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::host::{strip_port, HostConfig, Origin};

/// How long to let a burst of file events settle before reloading.
const RELOAD_SETTLE: Duration = Duration::from_millis(200);

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Upstream connection timeout in seconds.
    pub connect_timeout: u64,

    /// Upstream response timeout in seconds.
    pub read_timeout: u64,

    /// Maximum buffered body size in bytes. Unset means unlimited.
    pub max_body_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4000".to_string(),
            connect_timeout: 10,
            read_timeout: 30,
            max_body_bytes: None,
        }
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colorized output for interactive use.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Structured JSON, one object per line.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// A single route: one exposed host published over one upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// The exposed hostname to match (exact match, port ignored).
    pub host: String,

    /// Absolute URL of the next hop, e.g. `http://127.0.0.1:3000`.
    pub upstream: String,

    /// Absolute URL of the identity the terminal service believes it has.
    /// Defaults to the upstream URL.
    pub target: Option<String>,

    /// Path segment the client sees but the upstream does not.
    pub path_prefix: Option<String>,

    /// Replacement domain for cookies the target scoped to itself.
    pub cookie_domain: Option<String>,
}

impl RouteConfig {
    /// Validates the route configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ProxyError::config_validation("Route host cannot be empty"));
        }
        self.host_config()?.validate()
    }

    /// Builds the per-request contract this route resolves to.
    pub fn host_config(&self) -> Result<HostConfig> {
        let upstream = Origin::from_url(&self.upstream)?;
        let target = match &self.target {
            Some(raw) => Origin::from_url(raw)?,
            None => upstream.clone(),
        };

        Ok(HostConfig {
            upstream_host: upstream.host,
            upstream_scheme: upstream.scheme,
            target_host: target.host,
            target_scheme: target.scheme,
            path_prefix: self.path_prefix.clone(),
            cookie_domain: self.cookie_domain.clone(),
        })
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Route table mapping exposed hosts to upstreams.
    pub routes: Vec<RouteConfig>,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen address cannot be empty",
            ));
        }

        for route in &self.routes {
            route.validate()?;
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Builds the exposed-host lookup map for O(1) route resolution.
    pub fn build_route_map(&self) -> HashMap<String, HostConfig> {
        self.routes
            .iter()
            .filter_map(|route| {
                let key = strip_port(&route.host).to_lowercase();
                match route.host_config() {
                    Ok(config) => Some((key, config)),
                    Err(e) => {
                        // Validation rejects these at load time; a reload
                        // that slipped past it must not poison the map.
                        warn!(host = %route.host, error = %e, "Skipping invalid route");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Shared handle on the live configuration, with reload support.
#[derive(Clone)]
pub struct ConfigManager {
    /// The configuration the rest of the process reads.
    current: Arc<RwLock<AppConfig>>,

    /// Where the configuration was loaded from.
    path: PathBuf,
}

/// Keeps the config-file watcher registered; dropping it stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigManager {
    /// Loads the file at `path` and wraps it for shared access.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let current = Arc::new(RwLock::new(AppConfig::load(&path)?));
        Ok(Self { current, path })
    }

    /// A snapshot of the current configuration.
    pub fn current(&self) -> AppConfig {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// The shared handle itself, for components that follow reloads.
    pub fn shared(&self) -> Arc<RwLock<AppConfig>> {
        self.current.clone()
    }

    /// Re-reads the file and swaps in the result if it is valid.
    pub fn reload(&self) -> Result<()> {
        let fresh = AppConfig::load(&self.path).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Configuration reload failed");
            e
        })?;

        *self.current.write().expect("config lock poisoned") = fresh;
        info!(path = %self.path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Reloads the configuration whenever the file changes on disk.
    ///
    /// `on_reload` runs after every successful reload, so callers can
    /// refresh anything derived from the config (route caches, for one).
    /// The returned [`ConfigWatcher`] must be kept alive for as long as
    /// reloads should happen.
    pub fn watch(&self, on_reload: impl Fn() + Send + 'static) -> Result<ConfigWatcher> {
        let (events_tx, events_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |event: std::result::Result<Event, notify::Error>| {
                let Ok(event) = event else { return };
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = events_tx.send(());
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| ProxyError::config_validation(format!("Cannot create file watcher: {e}")))?;

        // Editors replace the file rather than writing in place, so the
        // watch has to sit on the containing directory.
        let watch_target = self.path.parent().unwrap_or(&self.path);
        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ProxyError::config_validation(format!(
                    "Cannot watch {}: {e}",
                    watch_target.display()
                ))
            })?;
        info!(path = %self.path.display(), "Watching configuration file");

        let manager = self.clone();
        std::thread::spawn(move || {
            // A single save often arrives as a burst of events; wait for
            // the burst to settle and fold it into one reload.
            while events_rx.recv().is_ok() {
                std::thread::sleep(RELOAD_SETTLE);
                while events_rx.try_recv().is_ok() {}

                if manager.reload().is_ok() {
                    on_reload();
                }
            }
            debug!("Config watcher thread finished");
        });

        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Path of the configuration file, from `CONFIG_PATH` or `config.yaml`.
pub fn get_config_path() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"))
}

/// Log level override from the `LOG_LEVEL` environment variable.
pub fn get_log_level_override() -> Option<String> {
    std::env::var("LOG_LEVEL").ok().filter(|v| !v.is_empty())
}

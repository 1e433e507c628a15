//! # Rewrite Proxy
//!
//! A rewriting reverse HTTP proxy that publishes internal services under
//! exposed hostnames.
//!
//! ## Features
//!
//! - **Identity rewriting**: bodies, redirects, and cookies are rewritten
//!   between the exposed and target origins on every request
//! - **Route table**: exposed hosts map to upstream/target URLs in config
//! - **Hot Reload**: configuration changes take effect without restart
//! - **Flexible Logging**: configurable log levels and output destinations
//!
//! ## Usage
//!
//! ```bash
//! # Set config path via environment
//! export CONFIG_PATH=./config.yaml
//!
//! # Run the proxy
//! rewrite-proxy
//! ```
//!
//! ## Configuration
//!
//! See `config.yaml` for all available options.

use std::time::Duration;

use rewrite_proxy::config::{get_config_path, get_log_level_override, ConfigManager};
use rewrite_proxy::logging;
use rewrite_proxy::mapper::ConfigHostMapper;
use rewrite_proxy::proxy::{HttpTransport, Proxy};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Application entry point.
#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Load configuration
    let config_path = get_config_path();
    let config_manager = match ConfigManager::new(&config_path) {
        Ok(cm) => cm,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    let config = config_manager.current();

    // Initialize logging
    let _log_guard = match logging::init_logging(&config.logging, get_log_level_override()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %config_path.display(),
        "Starting rewrite-proxy"
    );

    let mapper = ConfigHostMapper::new(config_manager.shared());

    // Rebuild the route cache after every config reload. The mapper shares
    // the config Arc, so the refresh is all a new route table needs
    let _config_watcher = match config_manager.watch({
        let mapper = mapper.clone();
        move || mapper.refresh_cache()
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            error!("Failed to watch configuration: {}", e);
            // Continue without hot reload
            None
        }
    };

    let transport = HttpTransport::new(
        Duration::from_secs(config.server.connect_timeout),
        Duration::from_secs(config.server.read_timeout),
    );
    let mut proxy = Proxy::new(mapper).with_transport(transport);
    if let Some(limit) = config.server.max_body_bytes {
        proxy = proxy.with_max_body_bytes(limit);
    }

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %config.server.listen, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy.run(listener).await {
        error!(error = %e, "Proxy server terminated");
        std::process::exit(1);
    }
}

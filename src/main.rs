// src/main.rs

use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod gateway;
mod server;
mod sys;

use crate::config::{GatewayConfig, LogFormat};
use crate::gateway::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Logging (SLA Layer)
    // ==============================================================================

    let config = GatewayConfig::load();
    init_tracing(config.as_ref().map(|c| c.log_format).unwrap_or(LogFormat::Text));

    let config = config.map_err(|e| {
        tracing::error!(error = %e, "Invalid gateway configuration");
        e
    })?;

    // ==============================================================================
    // 2. Dependency Injection
    // ==============================================================================

    // Registry, executor, domain sources and settings store are wired once;
    // both transports share the same gateway.
    let gateway = Gateway::from_config(&config);

    // ==============================================================================
    // 3. Transport Selection
    // ==============================================================================

    // 🛡️ CGI mode: stdout is the HTTP response, so nothing but the response may go there.
    if env::var_os("GATEWAY_INTERFACE").is_some() {
        server::serve_cgi(&gateway, &config).await?;
        return Ok(());
    }

    tracing::info!("⚙️ Varnish gateway starting ({:?} panel)", config.panel);
    server::serve_http(Arc::new(gateway), &config).await?;

    Ok(())
}

/// Logs always go to stderr; `RUST_LOG` overrides the default `info` filter.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if let Err(e) = installed {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}

//! mqtt_bridge - HTTP-to-MQTT bridge daemon
//!
//! This daemon:
//! 1. Loads configuration (file + environment)
//! 2. Checks the broker certificates and optionally connects
//! 3. Serves the HTTP control surface until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use mqtt_bridge::{
    api::{ApiConfig, ApiServer},
    certs, BridgeConfig, ConnectionManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay JSON from HTTP to an MQTT broker over mutual TLS")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "MQTT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config).
    #[arg(long, env = "BRIDGE_HTTP_ADDR")]
    http_addr: Option<String>,

    /// Do not connect to the broker at startup.
    #[arg(long)]
    no_autoconnect: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = BridgeConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if args.no_autoconnect {
        config.autoconnect = false;
    }

    log::info!("mqtt_bridge {}", env!("CARGO_PKG_VERSION"));
    log::info!("MQTT Host: {}", config.broker.host);
    log::info!("MQTT Port: {}", config.broker.port);
    log::info!("MQTT Client ID: {}", config.broker.client_id);
    log::info!("Certificates directory: {}", config.cert_dir.display());
    for (kind, path) in config.certificates.entries() {
        log::info!("  {}: {}", kind, path.display());
    }

    let missing = certs::check(&config.certificates);
    if !missing.is_empty() {
        log::warn!("missing or unreadable certificates:");
        for cert in &missing {
            log::warn!("  - {}", cert);
        }
        log::warn!(
            "place ca-cert.pem, client-cert.pem and client-key.pem in {}",
            config.cert_dir.display()
        );
    }

    let manager = ConnectionManager::from_config(&config);
    if config.autoconnect {
        match manager.connect() {
            Ok(status) => log::info!("initial connect started ({})", status.state()),
            Err(err) => log::warn!("initial connect failed: {}", err),
        }
    } else {
        log::info!("autoconnect disabled; waiting for POST /connect");
    }

    let api_config = ApiConfig {
        addr: config.http_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, manager.clone()).spawn()?;
    log::info!("mqtt_bridge running. control surface on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("mqtt_bridge waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping control surface...");
    api_handle.stop()?;
    let status = manager.disconnect();
    log::info!("broker session closed ({})", status.state());

    Ok(())
}

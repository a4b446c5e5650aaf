//! fleetplane - Entry Point
//!
//! Declarative fleet deployment orchestrator. Reconciles NodeSets and
//! Deployments and dispatches service jobs to the execution backend.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::Context as _;
use fleetplane::app::options::AppOptions;
use fleetplane::app::run::run;
use fleetplane::logs::{init_logging, LogLevel, LogOptions};
use fleetplane::storage::settings::{Settings, DEFAULT_SETTINGS_PATH};
use fleetplane::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version)?);
        return Ok(());
    }

    // Retrieve the settings file
    let settings_path = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let mut settings = Settings::load(&settings_path)
        .await
        .with_context(|| format!("unable to read settings from {}", settings_path.display()))?;

    if let Some(level) = cli_args.get("log-level") {
        settings.log_level = level
            .parse::<LogLevel>()
            .map_err(anyhow::Error::msg)?;
    }

    // Validate and print the effective settings
    if cli_args.contains_key("check-config") {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings.log_dir.as_ref().map(PathBuf::from),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from(&settings);
    info!(version = %version.version, "Running fleetplane with options: {:?}", options);

    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run fleetplane: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}

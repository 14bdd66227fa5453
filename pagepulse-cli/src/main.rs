mod cli;
mod error;
mod output;
mod replay;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pagepulse::MonitorConfig;
use pagepulse::logging::{LoggingOptions, init_logging};
use pagepulse::vitals::{Vital, thresholds};
use tracing::{info, warn};

use crate::cli::{Args, Commands};
use crate::error::CliError;
use crate::replay::Replay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = if args.quiet {
        Some("error".to_string())
    } else if args.verbose {
        Some("pagepulse=debug,pagepulse_cli=debug".to_string())
    } else {
        None
    };
    let (_logging, _guard) = init_logging(&LoggingOptions {
        filter,
        log_dir: args.log_dir.clone(),
        stderr: true,
        ..Default::default()
    })
    .context("Failed to initialize logging")?;

    match args.command {
        Commands::Replay {
            file,
            config,
            format,
            send,
            drain_secs,
        } => {
            let config = load_config(config.as_deref())?;
            let replay = Replay::new(config).context("Failed to build monitor")?;

            let stats = replay
                .run_file(&file)
                .with_context(|| format!("Failed to replay {}", file.display()))?;
            info!(records = stats.records, file = %file.display(), "Replay complete");

            let telemetry = replay.telemetry();
            println!("{}", output::render_snapshot(&telemetry.snapshot(), format)?);

            if send {
                if !telemetry.config().transport.has_endpoints() {
                    warn!("--send given but no endpoints are configured");
                }
                if !telemetry.shutdown(Duration::from_secs(drain_secs)).await {
                    warn!("Some reports were still in flight at exit");
                }
            }
        }

        Commands::Rate { vital, value } => {
            let vital = Vital::from_str(&vital)
                .map_err(|_| CliError::InvalidInput(format!("unknown vital '{}'", vital)))?;
            println!("{} {} {}: {}", vital, value, vital.unit(), vital.rate(value));
        }

        Commands::Thresholds { format } => {
            print!("{}", output::render_thresholds(&thresholds(), format)?);
        }
    }

    Ok(())
}

/// Defaults, then the TOML file, then `PAGEPULSE_*` variables.
fn load_config(path: Option<&Path>) -> anyhow::Result<MonitorConfig> {
    let mut config = match path {
        Some(path) => MonitorConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "PAGEPULSE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed a JSON-lines instrumentation file through the monitor and print the result
    Replay {
        /// Instrumentation records, one JSON object per line
        file: PathBuf,

        /// TOML monitor configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,

        /// Post the reports to the configured endpoints
        #[arg(long)]
        send: bool,

        /// Seconds to wait for deliveries when sending
        #[arg(long, default_value_t = 5)]
        drain_secs: u64,
    },

    /// Rate a single vital value
    Rate {
        /// LCP, FID, CLS, TTFB or FCP
        vital: String,

        value: f64,
    },

    /// Print the rating thresholds
    Thresholds {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

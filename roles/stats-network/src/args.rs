//! CLI argument parsing for the stats-network binary.

use clap::Parser;
use ext_config::ConfigError;
use std::path::PathBuf;

use crate::config::StatsNetworkConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Network hashrate stats service", long_about = None)]
pub struct Args {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to the TOML configuration file",
        default_value = "stats-network-config.toml"
    )]
    pub config_path: PathBuf,
    #[arg(
        short = 'f',
        long = "log-file",
        help = "Path to the log file. If not set, logs will only be written to stdout."
    )]
    pub log_file: Option<PathBuf>,
}

/// Parses CLI arguments and loads the configuration they point to.
pub fn process_cli_args() -> Result<StatsNetworkConfig, ConfigError> {
    let args = Args::parse();
    let mut config = StatsNetworkConfig::load(&args.config_path.to_string_lossy())?;
    config.set_log_file(args.log_file);
    Ok(config)
}

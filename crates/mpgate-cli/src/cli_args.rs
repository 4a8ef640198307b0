use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "mpgate",
    about = "Webhook gateway for public-platform messaging accounts",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "MPGATE_CONFIG",
        default_value = "mpgate.toml",
        help = "Path to the TOML gateway configuration"
    )]
    pub(crate) config: PathBuf,

    #[arg(
        long,
        env = "MPGATE_BIND",
        help = "Listen address override, e.g. 0.0.0.0:8787"
    )]
    pub(crate) bind: Option<String>,

    #[arg(
        long = "state-dir",
        env = "MPGATE_STATE_DIR",
        help = "Directory for persisted access state and downloaded media"
    )]
    pub(crate) state_dir: Option<PathBuf>,

    #[arg(
        long = "log-level",
        env = "MPGATE_LOG",
        default_value = "info",
        help = "Default log level when RUST_LOG is unset (error, warn, info, debug, trace)"
    )]
    pub(crate) log_level: String,

    #[arg(
        long = "check-config",
        default_value_t = false,
        help = "Validate the configuration, print a summary, and exit"
    )]
    pub(crate) check_config: bool,
}

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "spritessh",
    version,
    about = "Local SSH server that proxies sessions onto sprites"
)]
pub struct Cli {
    /// Path to configuration file (also settable via SPRITESSH_CONFIG env var)
    #[arg(short, long, default_value = "spritessh.toml", env = "SPRITESSH_CONFIG")]
    pub config: PathBuf,

    /// Listen address override (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Host key path override (generated on first start if absent)
    #[arg(long)]
    pub host_key: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use spritessh::cli::Cli;
use spritessh::config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config: file → env-only mode → error
    let mut app_config = if cli.config.exists() {
        let mut cfg = config::load_config(&cli.config)?;
        config::env::apply_env_overrides(&mut cfg);
        cfg
    } else if config::env::can_build_from_env() {
        eprintln!("No config file found — using environment variables");
        config::env::build_config_from_env()
    } else {
        // will produce a clear "file not found" error
        config::load_config(&cli.config)?
    };

    // CLI overrides win over both file and environment
    if let Some(listen) = &cli.listen {
        app_config.server.listen = listen.clone();
    }
    if let Some(host_key) = &cli.host_key {
        app_config.server.host_key_path = host_key.clone();
    }
    if let Some(level) = &cli.log_level {
        app_config.logging.level = level.clone();
    }
    config::validate_config(&app_config)?;

    spritessh::logging::setup_logging(&app_config.logging.level, app_config.logging.format);

    info!(
        version = spritessh::VERSION,
        listen = %app_config.server.listen,
        "Starting spritessh server"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        if let Err(err) = spritessh::server::run(app_config).await {
            error!(error = %err, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}

pub mod env;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// On Unix, warn if the config file is readable by group or others,
/// since it may contain the provider API token.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{:04o}", mode & 0o7777),
                "Config file is readable by group/others; consider 0600 since it may contain the API token"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {}

/// Parse configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.server.listen.is_empty() {
        anyhow::bail!("server.listen must not be empty");
    }
    if !config.server.listen.contains(':') {
        anyhow::bail!(
            "server.listen must be a host:port address, got '{}'",
            config.server.listen
        );
    }
    if config.server.max_retries == 0 {
        anyhow::bail!("server.max_retries must be at least 1");
    }
    if config.server.socket_timeout_secs == 0 {
        anyhow::bail!("server.socket_timeout_secs must be at least 1");
    }
    if !config.sprites.api_url.starts_with("http://") && !config.sprites.api_url.starts_with("https://")
    {
        anyhow::bail!(
            "sprites.api_url must be an http(s) URL, got '{}'",
            config.sprites.api_url
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let config = parse_config(
            r#"
[server]
listen = "127.0.0.1:2222"

[sprites]
api_url = "https://api.sprites.dev"
token = "tok"
"#,
        )
        .unwrap();
        assert_eq!(config.sprites.token, "tok");
    }

    #[test]
    fn test_reject_bad_listen() {
        assert!(parse_config("[server]\nlisten = \"nocolon\"\n").is_err());
    }

    #[test]
    fn test_reject_bad_api_url() {
        assert!(parse_config("[sprites]\napi_url = \"ftp://x\"\n").is_err());
    }

    #[test]
    fn test_reject_zero_retries() {
        assert!(parse_config("[server]\nmax_retries = 0\n").is_err());
    }
}

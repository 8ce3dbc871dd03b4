use crate::config::types::{AppConfig, LogFormat};

/// Apply environment-variable overrides on top of a loaded config.
///
/// Hybrid mode: the file provides the base, the environment wins per key.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("SPRITESSH_LISTEN") {
        config.server.listen = v;
    }
    if let Ok(v) = std::env::var("SPRITESSH_HOST_KEY") {
        config.server.host_key_path = v.into();
    }
    if let Ok(v) = std::env::var("SPRITESSH_MAX_RETRIES") {
        if let Ok(n) = v.parse() {
            config.server.max_retries = n;
        }
    }
    if let Ok(v) = std::env::var("SPRITES_API_URL") {
        config.sprites.api_url = v;
    }
    if let Ok(v) = std::env::var("SPRITES_TOKEN") {
        config.sprites.token = v;
    }
    if let Ok(v) = std::env::var("SPRITES_ORG") {
        config.sprites.org = v;
    }
    if let Ok(v) = std::env::var("SPRITESSH_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Ok(v) = std::env::var("SPRITESSH_LOG_FORMAT") {
        config.logging.format = match v.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }
}

/// Whether enough environment is present to start without a config file.
/// The token itself may still come from the sprites config file, so the
/// API URL or token being set is enough to try.
pub fn can_build_from_env() -> bool {
    std::env::var("SPRITES_TOKEN").is_ok() || std::env::var("SPRITES_API_URL").is_ok()
}

/// Build a configuration purely from environment variables.
pub fn build_config_from_env() -> AppConfig {
    let mut config = AppConfig::default();
    apply_env_overrides(&mut config);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test threads.
    #[test]
    fn test_env_overrides() {
        std::env::set_var("SPRITESSH_LISTEN", "127.0.0.1:9022");
        std::env::set_var("SPRITES_TOKEN", "envtok");
        std::env::set_var("SPRITESSH_LOG_FORMAT", "json");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.server.listen, "127.0.0.1:9022");
        assert_eq!(config.sprites.token, "envtok");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(can_build_from_env());

        std::env::remove_var("SPRITESSH_LISTEN");
        std::env::remove_var("SPRITES_TOKEN");
        std::env::remove_var("SPRITESSH_LOG_FORMAT");
    }
}

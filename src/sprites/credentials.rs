use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::types::SpritesConfig;

/// Resolved provider credentials. Produced once at startup; shared read-only
/// by every connection afterwards.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_url: String,
    pub token: String,
    pub org: String,
}

/// The user's sprites CLI configuration file (`~/.sprites/sprites.json`).
#[derive(Debug, Deserialize)]
struct SpritesFile {
    version: String,
    #[serde(default)]
    current_selection: Option<CurrentSelection>,
    #[serde(default)]
    urls: HashMap<String, UrlConfig>,
}

#[derive(Debug, Deserialize)]
struct CurrentSelection {
    url: String,
    org: String,
}

#[derive(Debug, Deserialize)]
struct UrlConfig {
    #[serde(default)]
    orgs: HashMap<String, OrgConfig>,
}

#[derive(Debug, Deserialize)]
struct OrgConfig {
    #[serde(default)]
    keyring_key: String,
    #[serde(default)]
    token: String,
}

impl ApiCredentials {
    /// Resolve credentials from the server config (which already reflects
    /// environment overrides), falling back to the sprites CLI config file.
    ///
    /// Missing credentials are a startup failure; the server must not bind
    /// its listener without them.
    pub fn resolve(config: &SpritesConfig) -> Result<Self> {
        let mut creds = ApiCredentials {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            org: config.org.clone(),
        };

        if creds.token.is_empty() {
            if let Some(path) = sprites_file_path() {
                if path.exists() {
                    creds.resolve_from_file(&path)?;
                }
            }
        }

        if creds.token.is_empty() {
            anyhow::bail!(
                "no provider credentials found: set sprites.token in the config, \
                 export SPRITES_TOKEN, or log in with the sprites CLI"
            );
        }

        Ok(creds)
    }

    fn resolve_from_file(&mut self, path: &std::path::Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading sprites config: {}", path.display()))?;
        let file: SpritesFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing sprites config: {}", path.display()))?;

        if file.version != "1" {
            anyhow::bail!("unsupported sprites config version: {}", file.version);
        }

        let selection = file
            .current_selection
            .as_ref()
            .context("sprites config has no current selection; run the sprites CLI login first")?;

        if self.org.is_empty() {
            self.org = selection.org.clone();
        }

        let url_config = file
            .urls
            .get(&selection.url)
            .with_context(|| format!("sprites config has no entry for {}", selection.url))?;
        let org_config = url_config
            .orgs
            .get(&self.org)
            .with_context(|| format!("organization not found in sprites config: {}", self.org))?;

        if !org_config.token.is_empty() {
            self.api_url = selection.url.trim_end_matches('/').to_string();
            self.token = org_config.token.clone();
            return Ok(());
        }

        if !org_config.keyring_key.is_empty() {
            // Keyring access is the CLI's concern, not ours.
            anyhow::bail!(
                "the token for {} is stored in the system keyring; export SPRITES_TOKEN instead",
                self.org
            );
        }

        anyhow::bail!("no access token recorded for organization {}", self.org)
    }
}

fn sprites_file_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".sprites").join("sprites.json"))
}

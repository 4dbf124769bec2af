//! Client configuration.
//!
//! Resolved as defaults < config file < environment. The file is found via
//! explicit path > `COLLOQUY_CONFIG` env > `<config_dir>/colloquy/config.toml`;
//! only the last one may be missing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{CharacterProfile, StaticCharacterCatalog};
use crate::error::ConfigError;

pub const ENV_CONFIG: &str = "COLLOQUY_CONFIG";
pub const ENV_SERVER_URL: &str = "COLLOQUY_SERVER_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "COLLOQUY_REQUEST_TIMEOUT_MS";
pub const ENV_DEFAULT_CHARACTER: &str = "COLLOQUY_DEFAULT_CHARACTER";

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub default_character_id: String,
    pub characters: Vec<CharacterProfile>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4000/ws".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 500,
            default_character_id: "assistant".to_string(),
            characters: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load from disk and the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an injectable environment lookup.
    pub fn load_with_env(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match resolve_path(explicit, &env) {
            Some((path, required)) => Self::from_file(&path, required)?,
            None => Self::default(),
        };
        config.apply_env(&env)?;
        Ok(config)
    }

    /// Parse a TOML file. A missing optional file yields the defaults.
    pub fn from_file(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = env(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            self.server_url = url;
        }
        if let Some(raw) = env(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_REQUEST_TIMEOUT_MS,
                value: raw.clone(),
            })?;
        }
        if let Some(character) = env(ENV_DEFAULT_CHARACTER).filter(|v| !v.trim().is_empty()) {
            self.default_character_id = character;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Exponential backoff for the `attempt`-th reconnect (0-based), capped
    /// at 30s.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
            .min(MAX_RECONNECT_DELAY)
    }

    /// Catalog from the `[[characters]]` table. Falls back to a single entry
    /// for the default character.
    pub fn catalog(&self) -> StaticCharacterCatalog {
        if self.characters.is_empty() {
            StaticCharacterCatalog::new(vec![CharacterProfile::new(
                self.default_character_id.clone(),
                "Assistant",
            )])
        } else {
            StaticCharacterCatalog::new(self.characters.clone())
        }
    }
}

/// Returns the config path and whether it must exist.
fn resolve_path(
    explicit: Option<&Path>,
    env: &impl Fn(&str) -> Option<String>,
) -> Option<(PathBuf, bool)> {
    if let Some(path) = explicit {
        return Some((path.to_path_buf(), true));
    }
    if let Some(path) = env(ENV_CONFIG).filter(|v| !v.trim().is_empty()) {
        return Some((PathBuf::from(path), true));
    }
    default_config_path().map(|path| (path, false))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("colloquy").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CharacterCatalog;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
server_url = "wss://ai.example.com/ws"
request_timeout_ms = 5000

[[characters]]
id = "analyst"
name = "Ana the Analyst"
model = "large"
tools = ["analyze_headline", "analyze_content"]

[[characters]]
id = "writer"
name = "Wes the Writer"
"#,
        );

        let config = ClientConfig::load_with_env(Some(file.path()), env_of(&[])).unwrap();

        assert_eq!(config.server_url, "wss://ai.example.com/ws");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.characters.len(), 2);
        assert_eq!(config.characters[0].model.as_deref(), Some("large"));
        assert!(!config.characters[0].allows_tool("generate_viral_post"));
        assert_eq!(config.catalog().list()[1].id, "writer");
    }

    #[test]
    fn env_overrides_file() {
        let file = write_config("server_url = \"ws://file/ws\"\n");
        let env = env_of(&[
            (ENV_CONFIG, file.path().to_str().unwrap()),
            (ENV_SERVER_URL, "ws://env/ws"),
            (ENV_REQUEST_TIMEOUT_MS, "1500"),
            (ENV_DEFAULT_CHARACTER, "writer"),
        ]);

        let config = ClientConfig::load_with_env(None, env).unwrap();

        assert_eq!(config.server_url, "ws://env/ws");
        assert_eq!(config.request_timeout_ms, 1500);
        assert_eq!(config.default_character_id, "writer");
    }

    #[test]
    fn invalid_env_number_is_rejected() {
        let file = write_config("");
        let err = ClientConfig::load_with_env(
            Some(file.path()),
            env_of(&[(ENV_REQUEST_TIMEOUT_MS, "soon")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_REQUEST_TIMEOUT_MS,
                ..
            }
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ClientConfig::load_with_env(Some(&missing), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn optional_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::from_file(&dir.path().join("config.toml"), false).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn malformed_toml_reports_path() {
        let file = write_config("request_timeout_ms = \"fast\"");
        let err = ClientConfig::from_file(file.path(), true).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => {
                assert_eq!(path, file.path().display().to_string())
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(4000));
        assert_eq!(config.reconnect_delay(20), Duration::from_secs(30));
    }

    #[test]
    fn empty_character_table_falls_back_to_default_character() {
        let config = ClientConfig::default();
        let catalog = config.catalog();
        assert_eq!(catalog.list().len(), 1);
        assert!(catalog.get("assistant").is_some());
    }
}

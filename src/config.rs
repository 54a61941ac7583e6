//! where the chatbot service lives and how patiently we talk to it.

use std::path::Path;
use std::time::Duration;

use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const API_BASE_ENV: &str = "RAG_CHAT_API_BASE";
pub const CONNECT_TIMEOUT_ENV: &str = "RAG_CHAT_CONNECT_TIMEOUT_SECS";
pub const STREAM_TIMEOUT_ENV: &str = "RAG_CHAT_STREAM_TIMEOUT_SECS";

/// every endpoint lives under this path segment of the api base.
pub const API_SUFFIX: &str = "/chatbot-api";

#[cfg(target_arch = "wasm32")]
const DEFAULT_API_BASE: &str = "/nomad-oasis";
#[cfg(not(target_arch = "wasm32"))]
const DEFAULT_API_BASE: &str = "http://localhost:8000/nomad-oasis";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;

#[derive(Resource, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// service root; `/chatbot-api` is appended unless already present.
    pub api_base: String,
    pub connect_timeout_secs: u64,
    /// upper bound on reading one response body, answer streams included.
    /// a silent server cannot hold a reader longer than this.
    pub stream_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT_SECS,
        }
    }
}

impl ChatConfig {
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self { api_base: api_base.into(), ..Self::default() }
    }

    /// defaults overridden by `RAG_CHAT_API_BASE`, `RAG_CHAT_CONNECT_TIMEOUT_SECS`
    /// and `RAG_CHAT_STREAM_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(base) = lookup(API_BASE_ENV)
            && !base.trim().is_empty()
        {
            config.api_base = base.trim().to_string();
        }
        if let Some(secs) = secs_from(&lookup, CONNECT_TIMEOUT_ENV)? {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = secs_from(&lookup, STREAM_TIMEOUT_ENV)? {
            config.stream_timeout_secs = secs;
        }
        Ok(config)
    }

    /// json file; missing keys fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: display, source })
    }

    /// normalised endpoint root: no trailing slash, always ends in `/chatbot-api`.
    pub fn base_url(&self) -> String {
        let trimmed = self.api_base.trim().trim_end_matches('/');
        if trimmed.ends_with(API_SUFFIX) {
            trimmed.to_string()
        } else {
            format!("{trimmed}{API_SUFFIX}")
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

fn secs_from(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else { return Ok(None) };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { key, value: raw.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn base_url_appends_suffix_once() {
        assert_eq!(ChatConfig::with_api_base("/nomad-oasis").base_url(), "/nomad-oasis/chatbot-api");
        assert_eq!(ChatConfig::with_api_base("/nomad-oasis/").base_url(), "/nomad-oasis/chatbot-api");
        assert_eq!(
            ChatConfig::with_api_base("http://h/x/chatbot-api/").base_url(),
            "http://h/x/chatbot-api"
        );
        assert_eq!(ChatConfig::with_api_base("").base_url(), "/chatbot-api");
    }

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (API_BASE_ENV, " http://svc:9000 "),
            (CONNECT_TIMEOUT_ENV, "3"),
            (STREAM_TIMEOUT_ENV, "45"),
        ]);
        let config = ChatConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.api_base, "http://svc:9000");
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.stream_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn empty_env_keeps_defaults() {
        let config = ChatConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn bad_timeout_is_rejected() {
        let err = ChatConfig::from_lookup(|k| (k == CONNECT_TIMEOUT_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: CONNECT_TIMEOUT_ENV, .. }));

        let err = ChatConfig::from_lookup(|k| (k == STREAM_TIMEOUT_ENV).then(|| "-1".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: STREAM_TIMEOUT_ENV, .. }));
    }

    #[test]
    fn json_file_with_partial_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "api_base": "https://example.org/app" }}"#).unwrap();
        let config = ChatConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.base_url(), "https://example.org/app/chatbot-api");
        assert_eq!(config.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(config.stream_timeout_secs, DEFAULT_STREAM_TIMEOUT_SECS);
    }

    #[test]
    fn json_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(ChatConfig::from_json_file(&missing), Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(ChatConfig::from_json_file(&bad), Err(ConfigError::Parse { .. })));
    }
}

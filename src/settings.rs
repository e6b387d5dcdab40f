//! User settings persistence.
//!
//! Stores user preferences in ~/.agentnet/settings.json.
//! Settings are loaded with env var > settings.json > default priority.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::dedup::{
    DEFAULT_CAPACITY, DEFAULT_EVICT_FRACTION, DEFAULT_STREAM_WINDOW, DEFAULT_SYSTEM_WINDOW,
};
use crate::graph::UNKNOWN_LABEL;
use crate::history::{DEFAULT_API_URL, DEFAULT_LIMIT};
use crate::transport::{DEFAULT_WS_URL, Endpoint, TokenPlacement};

/// Stream endpoint override.
pub const ENV_WS_URL: &str = "AGENTNET_WS_URL";
/// Bearer token for both the stream and the REST API.
pub const ENV_TOKEN: &str = "AGENTNET_TOKEN";
/// REST base URL override.
pub const ENV_API_URL: &str = "AGENTNET_API_URL";

const REDACTED: &str = "********";

/// User settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Audit stream connection.
    #[serde(default)]
    pub transport: TransportSettings,

    /// Replay suppression.
    #[serde(default)]
    pub dedup: DedupSettings,

    /// Graph presentation defaults.
    #[serde(default)]
    pub graph: GraphSettings,

    /// History backfill on startup.
    #[serde(default)]
    pub backfill: BackfillSettings,

    /// Raw event log.
    #[serde(default)]
    pub log: LogSettings,
}

/// Audit stream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// WebSocket endpoint (ws:// or wss://).
    #[serde(default = "default_ws_url")]
    pub url: String,

    /// Bearer token. Shown redacted by `list`.
    #[serde(default)]
    pub token: Option<String>,

    /// Where the token travels: "query" or "header".
    #[serde(default)]
    pub token_placement: TokenPlacement,

    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect after an involuntary drop.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            token: None,
            token_placement: TokenPlacement::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Exponential backoff after a lost connection. Off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this many consecutive failures (0 = never).
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: 0,
        }
    }
}

/// Replay suppression windows and cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Window for inbound stream frames, in milliseconds.
    #[serde(default = "default_stream_window_ms")]
    pub stream_window_ms: u64,

    /// Window for system log lines, in milliseconds.
    #[serde(default = "default_system_window_ms")]
    pub system_window_ms: u64,

    /// Fingerprints kept before eviction.
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    /// Share of the oldest entries dropped per eviction pass.
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
}

fn default_stream_window_ms() -> u64 {
    DEFAULT_STREAM_WINDOW.as_millis() as u64
}

fn default_system_window_ms() -> u64 {
    DEFAULT_SYSTEM_WINDOW.as_millis() as u64
}

fn default_dedup_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_evict_fraction() -> f64 {
    DEFAULT_EVICT_FRACTION
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            stream_window_ms: default_stream_window_ms(),
            system_window_ms: default_system_window_ms(),
            capacity: default_dedup_capacity(),
            evict_fraction: default_evict_fraction(),
        }
    }
}

impl DedupSettings {
    pub fn stream_window(&self) -> Duration {
        Duration::from_millis(self.stream_window_ms)
    }

    pub fn system_window(&self) -> Duration {
        Duration::from_millis(self.system_window_ms)
    }
}

/// Graph presentation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSettings {
    /// Name shown for agents that arrive without a username.
    #[serde(default = "default_unknown_label")]
    pub unknown_label: String,
}

fn default_unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            unknown_label: default_unknown_label(),
        }
    }
}

/// History backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Audit REST base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Events to request (the server caps this at 100).
    #[serde(default = "default_backfill_limit")]
    pub limit: u32,

    /// Request timeout in milliseconds.
    #[serde(default = "default_backfill_timeout_ms")]
    pub timeout_ms: u64,

    /// Cache file. Defaults to ~/.agentnet/history.json.
    #[serde(default)]
    pub cache_path: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_backfill_limit() -> u32 {
    DEFAULT_LIMIT
}

fn default_backfill_timeout_ms() -> u64 {
    10_000
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_api_url(),
            limit: default_backfill_limit(),
            timeout_ms: default_backfill_timeout_ms(),
            cache_path: None,
        }
    }
}

/// Raw event log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Entries kept before the oldest are dropped.
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_log_capacity() -> usize {
    500
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
        }
    }
}

impl Settings {
    /// Get the default settings file path (~/.agentnet/settings.json).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentnet")
            .join("settings.json")
    }

    /// Load settings from disk and apply environment overrides.
    pub fn load() -> Self {
        let mut settings = Self::load_from(&Self::default_path());
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Load settings from a specific path, returning default if not found.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist to the default path.
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::default_path())
    }

    /// Persist to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("mkdir error: {}", e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        std::fs::write(path, json).map_err(|e| format!("write error: {}", e))
    }

    /// Overlay environment variables. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_WS_URL) {
            self.transport.url = url;
        }
        if let Some(token) = var(ENV_TOKEN) {
            self.transport.token = Some(token);
        }
        if let Some(url) = var(ENV_API_URL) {
            self.backfill.api_url = url;
        }
    }

    /// The configured token, if any.
    pub fn token(&self) -> Option<SecretString> {
        self.transport
            .token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.clone()))
    }

    /// The stream endpoint described by these settings.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            url: self.transport.url.clone(),
            token: self.token(),
            token_placement: self.transport.token_placement,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
        }
    }

    /// Where backfilled history is cached.
    pub fn history_cache_path(&self) -> PathBuf {
        match &self.backfill.cache_path {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => crate::history::Backfill::default_cache_path(),
        }
    }

    /// Get a setting value by dotted path (e.g., "dedup.stream_window_ms").
    pub fn get(&self, path: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;

        match lookup(&json, path)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Null => Some("null".to_string()),
            serde_json::Value::Array(arr) => Some(serde_json::to_string(arr).unwrap_or_default()),
            serde_json::Value::Object(obj) => Some(serde_json::to_string(obj).unwrap_or_default()),
        }
    }

    /// Set a setting value by dotted path.
    ///
    /// Returns error if path is invalid or value cannot be parsed. On an
    /// optional field, `"null"` clears it.
    pub fn set(&mut self, path: &str, value: &str) -> Result<(), String> {
        let current = serde_json::to_value(&*self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        let defaults = serde_json::to_value(Self::default())
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        let existing =
            lookup(&current, path).ok_or_else(|| format!("Path not found: {}", path))?;
        let optional = matches!(lookup(&defaults, path), Some(serde_json::Value::Null));

        // Infer the type from the existing value
        let new_value = match existing {
            _ if optional && value == "null" => serde_json::Value::Null,
            serde_json::Value::Bool(_) => {
                let b = value
                    .parse::<bool>()
                    .map_err(|_| format!("Expected boolean for {}, got '{}'", path, value))?;
                serde_json::Value::Bool(b)
            }
            serde_json::Value::Number(n) => {
                if n.is_u64() {
                    let n = value
                        .parse::<u64>()
                        .map_err(|_| format!("Expected integer for {}, got '{}'", path, value))?;
                    serde_json::Value::Number(n.into())
                } else if n.is_i64() {
                    let n = value
                        .parse::<i64>()
                        .map_err(|_| format!("Expected integer for {}, got '{}'", path, value))?;
                    serde_json::Value::Number(n.into())
                } else {
                    let n = value
                        .parse::<f64>()
                        .map_err(|_| format!("Expected number for {}, got '{}'", path, value))?;
                    serde_json::Number::from_f64(n)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| format!("Expected finite number for {}", path))?
                }
            }
            serde_json::Value::Array(_) => serde_json::from_str(value)
                .map_err(|e| format!("Invalid JSON array for {}: {}", path, e))?,
            serde_json::Value::Object(_) => serde_json::from_str(value)
                .map_err(|e| format!("Invalid JSON object for {}: {}", path, e))?,
            serde_json::Value::Null | serde_json::Value::String(_) => {
                serde_json::Value::String(value.to_string())
            }
        };

        self.set_value(current, path, new_value)
    }

    /// Reset a setting to its default value.
    pub fn reset(&mut self, path: &str) -> Result<(), String> {
        let defaults = serde_json::to_value(Self::default())
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        let default_value = lookup(&defaults, path)
            .cloned()
            .ok_or_else(|| format!("Unknown setting: {}", path))?;

        let current = serde_json::to_value(&*self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        self.set_value(current, path, default_value)
    }

    /// Replace the value at `path` inside `json` and deserialize the result
    /// back into `self`.
    fn set_value(
        &mut self,
        mut json: serde_json::Value,
        path: &str,
        value: serde_json::Value,
    ) -> Result<(), String> {
        let parts: Vec<&str> = path.split('.').collect();
        let Some((final_key, parents)) = parts.split_last() else {
            return Err("Empty path".to_string());
        };

        // Navigate to parent and set the final key
        let mut current = &mut json;
        for part in parents {
            current = current
                .get_mut(*part)
                .ok_or_else(|| format!("Path not found: {}", path))?;
        }

        let obj = current
            .as_object_mut()
            .ok_or_else(|| format!("Parent is not an object: {}", path))?;
        if !obj.contains_key(*final_key) {
            return Err(format!("Path not found: {}", path));
        }
        obj.insert((*final_key).to_string(), value);

        // Deserialize back to Settings
        *self =
            serde_json::from_value(json).map_err(|e| format!("Failed to apply setting: {}", e))?;

        Ok(())
    }

    /// List all settings as (path, value) pairs. Secrets are redacted.
    pub fn list(&self) -> Vec<(String, String)> {
        let json = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        collect_settings(&json, String::new(), &mut results);
        for (path, value) in results.iter_mut() {
            if path.ends_with("token") && value != "null" {
                *value = REDACTED.to_string();
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

/// Follow a dotted path through a JSON tree.
fn lookup<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(json, |current, part| current.get(part))
}

/// Recursively collect settings paths and values.
fn collect_settings(
    value: &serde_json::Value,
    prefix: String,
    results: &mut Vec<(String, String)>,
) {
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                collect_settings(val, path, results);
            }
        }
        serde_json::Value::Array(arr) => {
            let display = serde_json::to_string(arr).unwrap_or_default();
            results.push((prefix, display));
        }
        serde_json::Value::String(s) => {
            results.push((prefix, s.clone()));
        }
        serde_json::Value::Number(n) => {
            results.push((prefix, n.to_string()));
        }
        serde_json::Value::Bool(b) => {
            results.push((prefix, b.to_string()));
        }
        serde_json::Value::Null => {
            results.push((prefix, "null".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    #[test]
    fn test_get_setting() {
        let settings = Settings::default();

        assert_eq!(settings.get("transport.url"), Some(DEFAULT_WS_URL.to_string()));
        assert_eq!(settings.get("dedup.stream_window_ms"), Some("5000".to_string()));
        assert_eq!(settings.get("dedup.evict_fraction"), Some("0.4".to_string()));
        assert_eq!(settings.get("transport.reconnect.enabled"), Some("false".to_string()));
        assert_eq!(settings.get("transport.token_placement"), Some("query".to_string()));
        assert_eq!(settings.get("nonexistent"), None);
    }

    #[test]
    fn test_set_setting() {
        let mut settings = Settings::default();

        settings.set("transport.url", "ws://audit:9000/ws").unwrap();
        assert_eq!(settings.transport.url, "ws://audit:9000/ws");

        settings.set("dedup.capacity", "1000").unwrap();
        assert_eq!(settings.dedup.capacity, 1000);

        settings.set("dedup.evict_fraction", "0.25").unwrap();
        assert_eq!(settings.dedup.evict_fraction, 0.25);

        settings.set("transport.reconnect.enabled", "true").unwrap();
        assert!(settings.transport.reconnect.enabled);

        settings.set("transport.token_placement", "header").unwrap();
        assert_eq!(settings.transport.token_placement, TokenPlacement::Header);

        settings.set("transport.token", "abc").unwrap();
        assert_eq!(settings.transport.token.as_deref(), Some("abc"));
        settings.set("transport.token", "null").unwrap();
        assert_eq!(settings.transport.token, None);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut settings = Settings::default();

        assert!(settings.set("dedup.capacity", "lots").is_err());
        assert!(settings.set("transport.reconnect.enabled", "maybe").is_err());
        assert!(settings.set("transport.token_placement", "cookie").is_err());
        assert!(settings.set("transport.nope", "1").unwrap_err().starts_with("Path not found"));
        assert!(settings.set("nope.url", "1").unwrap_err().starts_with("Path not found"));

        // A failed set leaves the settings untouched.
        assert_eq!(settings.dedup.capacity, DEFAULT_CAPACITY);
        assert_eq!(settings.transport.token_placement, TokenPlacement::Query);
    }

    #[test]
    fn test_reset_setting() {
        let mut settings = Settings::default();

        settings.graph.unknown_label = "???".to_string();
        settings.reset("graph.unknown_label").unwrap();
        assert_eq!(settings.graph.unknown_label, "Unknown");

        settings.backfill.limit = 7;
        settings.reset("backfill.limit").unwrap();
        assert_eq!(settings.backfill.limit, DEFAULT_LIMIT);

        assert!(settings.reset("bogus.path").is_err());
    }

    #[test]
    fn test_reset_clears_optional_fields() {
        let mut settings = Settings::default();

        settings.set("transport.token", "abc").unwrap();
        settings.reset("transport.token").unwrap();
        assert_eq!(settings.transport.token, None);
        assert!(settings.endpoint().client_request().unwrap().uri().query().is_none());

        settings.set("backfill.cache_path", "/tmp/agentnet/history.json").unwrap();
        settings.reset("backfill.cache_path").unwrap();
        assert_eq!(settings.backfill.cache_path, None);
        assert_eq!(
            settings.history_cache_path(),
            crate::history::Backfill::default_cache_path()
        );
    }

    #[test]
    fn test_set_null_clears_populated_cache_path() {
        let mut settings = Settings::default();
        settings.backfill.cache_path = Some("/tmp/history.json".to_string());

        settings.set("backfill.cache_path", "null").unwrap();
        assert_eq!(settings.backfill.cache_path, None);

        // Required strings keep "null" as text.
        settings.set("graph.unknown_label", "null").unwrap();
        assert_eq!(settings.graph.unknown_label, "null");
    }

    #[test]
    fn test_list_settings() {
        let mut settings = Settings::default();
        settings.transport.token = Some("secret-value".to_string());
        let list = settings.list();

        assert!(list.iter().any(|(k, _)| k == "transport.url"));
        assert!(list.iter().any(|(k, _)| k == "dedup.system_window_ms"));
        assert!(list.iter().any(|(k, _)| k == "log.capacity"));
        assert!(list.iter().any(|(k, v)| k == "transport.token" && v == REDACTED));
        assert!(!list.iter().any(|(_, v)| v.contains("secret-value")));

        let mut keys: Vec<_> = list.iter().map(|(k, _)| k.clone()).collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_WS_URL, "ws://other:1/ws"),
            (ENV_TOKEN, "tok"),
            (ENV_API_URL, "  "),
        ]);

        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.transport.url, "ws://other:1/ws");
        assert_eq!(settings.token().unwrap().expose_secret(), "tok");
        // Blank values do not override.
        assert_eq!(settings.backfill.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_endpoint_from_settings() {
        let mut settings = Settings::default();
        settings.transport.token = Some(String::new());
        settings.transport.connect_timeout_ms = 2500;

        let endpoint = settings.endpoint();
        assert_eq!(endpoint.url, DEFAULT_WS_URL);
        assert!(endpoint.token.is_none());
        assert_eq!(endpoint.connect_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentnet").join("settings.json");

        let mut settings = Settings::default();
        settings.set("backfill.api_url", "http://audit:8083").unwrap();
        settings.set("backfill.cache_path", "/tmp/history.json").unwrap();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.backfill.api_url, "http://audit:8083");
        assert_eq!(loaded.history_cache_path(), PathBuf::from("/tmp/history.json"));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"dedup": {"capacity": 42}}"#).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.dedup.capacity, 42);
        assert_eq!(loaded.dedup.stream_window_ms, 5000);
        assert_eq!(loaded.transport.url, DEFAULT_WS_URL);
        assert!(loaded.backfill.enabled);
    }

    #[test]
    fn test_missing_or_malformed_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_from(&dir.path().join("missing.json"));
        assert_eq!(loaded.log.capacity, 500);

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        assert_eq!(Settings::load_from(&path).log.capacity, 500);
    }
}

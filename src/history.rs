//! History backfill from the audit REST API.
//!
//! Seeds the graph with recent events before the live stream takes over. A
//! successful fetch is cached on disk so the next start can still show
//! something while the server is unreachable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::BackfillError;

/// Default audit REST base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8083";

/// Events requested when nothing is configured.
pub const DEFAULT_LIMIT: u32 = 50;

/// The server clamps `limit` to this.
pub const MAX_LIMIT: u32 = 100;

/// Something that can hand back recent raw events.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` recent events, undecoded.
    async fn recent(&self, limit: u32) -> Result<Vec<Value>, BackfillError>;
}

/// `GET {base}/api/v1/audit/feed?limit=N`.
pub struct HttpHistory {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpHistory {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, BackfillError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            token,
            client,
        })
    }

    /// Feed URL with `limit` clamped to what the server accepts.
    pub fn feed_url(&self, limit: u32) -> String {
        format!(
            "{}/api/v1/audit/feed?limit={}",
            self.base_url.trim_end_matches('/'),
            limit.clamp(1, MAX_LIMIT)
        )
    }
}

#[async_trait]
impl HistorySource for HttpHistory {
    async fn recent(&self, limit: u32) -> Result<Vec<Value>, BackfillError> {
        let url = self.feed_url(limit);
        debug!(url = %url, "Fetching history");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackfillError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body: Value = response.json().await?;
        extract_events(body)
    }
}

/// Accept `{"events": [...]}` (the server's envelope) or a bare array.
pub fn extract_events(body: Value) -> Result<Vec<Value>, BackfillError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("events") {
            Some(Value::Array(items)) => Ok(items),
            // An empty store serializes its list as null.
            Some(Value::Null) => Ok(Vec::new()),
            Some(_) => Err(BackfillError::Decode("'events' is not an array".to_string())),
            None => Err(BackfillError::Decode("missing 'events' array".to_string())),
        },
        other => Err(BackfillError::Decode(format!(
            "expected an object or array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where a backfill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOrigin {
    Remote,
    Cache,
    Empty,
}

impl std::fmt::Display for BackfillOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackfillOrigin::Remote => write!(f, "remote"),
            BackfillOrigin::Cache => write!(f, "cache"),
            BackfillOrigin::Empty => write!(f, "empty"),
        }
    }
}

/// Raw events plus where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Backfilled {
    pub origin: BackfillOrigin,
    pub events: Vec<Value>,
}

/// Fetch-or-fallback loader.
#[derive(Clone)]
pub struct Backfill {
    source: Arc<dyn HistorySource>,
    cache_path: Option<PathBuf>,
    limit: u32,
}

impl Backfill {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            source,
            cache_path: None,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Default cache location (~/.agentnet/history.json).
    pub fn default_cache_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentnet")
            .join("history.json")
    }

    /// Fetch recent history. Never fails: a fetch error falls back to the
    /// cache, and a missing or unreadable cache yields nothing.
    pub async fn load(&self) -> Backfilled {
        match self.source.recent(self.limit).await {
            Ok(events) => {
                info!(count = events.len(), "History fetched");
                if let Some(path) = &self.cache_path
                    && let Err(e) = write_cache(path, &events)
                {
                    warn!(path = %path.display(), error = %e, "Failed to write history cache");
                }
                Backfilled {
                    origin: BackfillOrigin::Remote,
                    events,
                }
            }
            Err(e) => {
                warn!(error = %e, "History fetch failed, trying cache");
                self.load_cached()
            }
        }
    }

    fn load_cached(&self) -> Backfilled {
        let empty = Backfilled {
            origin: BackfillOrigin::Empty,
            events: Vec::new(),
        };
        let Some(path) = &self.cache_path else {
            return empty;
        };

        match read_cache(path) {
            Ok(Some(events)) => {
                info!(count = events.len(), path = %path.display(), "History loaded from cache");
                Backfilled {
                    origin: BackfillOrigin::Cache,
                    events,
                }
            }
            Ok(None) => empty,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable history cache");
                empty
            }
        }
    }
}

fn write_cache(path: &Path, events: &[Value]) -> Result<(), BackfillError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(events).map_err(|e| BackfillError::Decode(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn read_cache(path: &Path) -> Result<Option<Vec<Value>>, BackfillError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let events = serde_json::from_str(&data).map_err(|e| BackfillError::Decode(e.to_string()))?;
    Ok(Some(events))
}

//! Server settings with file and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `MURMUR_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a socket handshake is turned into a user identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Trust the `authenticated_user_id` query parameter.
    #[default]
    QueryParam,
    /// Resolve the `deviceId` in the `Authorization` header to its owner.
    DeviceOwner,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Prefix for attachment upload URLs; ids are appended as `/<id>`.
    pub blob_base_url: String,
    /// Socket URL handed out by `POST /ws_urls`.
    pub socket_base_url: String,
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_attachments: usize,
    pub auth_mode: AuthMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            data_dir: PathBuf::from("data"),
            blob_base_url: "http://localhost:8000/blob".into(),
            socket_base_url: "ws://localhost:8000/chat_socket".into(),
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            max_attachments: 100,
            auth_mode: AuthMode::QueryParam,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Logging knobs, kept as plain strings so the binary owns the mapping
/// onto its subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            persist_warnings: false,
            log_db_path: PathBuf::from("data/logs.db"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingSettings,
}

/// An env override that was set but could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// Load settings from an optional file, then apply process env overrides.
///
/// Runs before logging is initialised, so rejected overrides are returned
/// for the caller to report.
pub fn load_settings(
    path: Option<&Path>,
) -> Result<(Settings, Vec<IgnoredOverride>), ConfigError> {
    let mut settings = match path {
        Some(path) => load_settings_file(path)?,
        None => Settings::default(),
    };
    let ignored = apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok((settings, ignored))
}

/// Defaults deep-merged with the file at `path`. A missing file yields defaults.
pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key, everything else is replaced; nulls in `source`
/// leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `MURMUR_*` overrides read through `lookup`. Unparseable values are
/// skipped and returned.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Vec<IgnoredOverride>
where
    F: Fn(&str) -> Option<String>,
{
    let mut ignored = Vec::new();
    let mut ignore = |key, value, reason| {
        ignored.push(IgnoredOverride { key, value, reason });
    };
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());
    let server = &mut settings.server;

    if let Some(v) = read("MURMUR_HOST") {
        server.host = v;
    }
    if let Some(v) = read("MURMUR_PORT") {
        match v.parse() {
            Ok(port) => server.port = port,
            Err(_) => ignore("MURMUR_PORT", v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = read("MURMUR_DATA_DIR") {
        server.data_dir = PathBuf::from(v);
    }
    if let Some(v) = read("MURMUR_BLOB_BASE_URL") {
        server.blob_base_url = v;
    }
    if let Some(v) = read("MURMUR_SOCKET_BASE_URL") {
        server.socket_base_url = v;
    }
    if let Some(v) = read("MURMUR_MAX_SEND_QUEUE") {
        match v.parse::<usize>() {
            Ok(n) if n > 0 => server.max_send_queue = n,
            _ => ignore("MURMUR_MAX_SEND_QUEUE", v, "invalid queue size, ignoring"),
        }
    }
    if let Some(v) = read("MURMUR_AUTH_MODE") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(mode) => server.auth_mode = mode,
            Err(_) => ignore("MURMUR_AUTH_MODE", v, "unknown auth mode, ignoring"),
        }
    }
    if let Some(v) = read("MURMUR_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("MURMUR_LOG_FORMAT") {
        settings.logging.format = v;
    }
    ignored
}

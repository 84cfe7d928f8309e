/// Config schema types (server, logs, backend, push, timing).
use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Semantically invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CqlinkConfig {
    pub server: ServerConfig,
    pub logs: LogsConfig,
    pub backend: BackendConfig,
    /// Auxiliary push channel. Disabled when absent.
    pub push: Option<PushConfig>,
    pub timing: TimingConfig,
}

impl CqlinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("backend.ws_url", &self.backend.ws_url, &["ws://", "wss://"])?;
        check_scheme("backend.http_url", &self.backend.http_url, &[
            "http://", "https://",
        ])?;
        if let Some(push) = &self.push {
            check_scheme("push.url", &push.url, &["ws://", "wss://"])?;
        }
        for (field, secs) in [
            ("timing.keepalive_secs", self.timing.keepalive_secs),
            ("timing.reconnect_secs", self.timing.reconnect_secs),
            ("timing.command_timeout_secs", self.timing.command_timeout_secs),
            ("timing.sweep_interval_secs", self.timing.sweep_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.logs.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "logs.capacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn check_scheme(field: &'static str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    if schemes.iter().any(|s| url.starts_with(s)) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{url:?} must start with one of {schemes:?}"),
        })
    }
}

/// HTTP status/log server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
    /// Directory served as static files under `/`.
    pub webroot: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            webroot: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Directory for daily `YYYY-MM-DD.log` files. No files are written when
    /// unset.
    pub dir: Option<PathBuf>,
    /// In-memory ring buffer size.
    pub capacity: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            capacity: 10_000,
        }
    }
}

/// Bot backend endpoints.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base WebSocket URL; `/api` and `/event` are appended.
    pub ws_url: String,
    /// Base HTTP URL used for the status call.
    pub http_url: String,
    /// Sent as `Authorization: Token <token>` on every request.
    #[serde(serialize_with = "serialize_option_secret")]
    pub token: Option<Secret<String>>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("ws_url", &self.ws_url)
            .field("http_url", &self.http_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:6700".into(),
            http_url: "http://127.0.0.1:5700".into(),
            token: None,
        }
    }
}

impl BackendConfig {
    /// Value of the `Authorization` header, when a token is configured.
    pub fn authorization(&self) -> Option<Secret<String>> {
        self.token
            .as_ref()
            .filter(|t| !t.expose_secret().is_empty())
            .map(|t| Secret::new(format!("Token {}", t.expose_secret())))
    }
}

/// Push channel endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub url: String,
    /// Sent as `x-access-token`.
    #[serde(default, serialize_with = "serialize_option_secret")]
    pub token: Option<Secret<String>>,
}

impl std::fmt::Debug for PushConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Intervals, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub keepalive_secs: u64,
    pub reconnect_secs: u64,
    pub command_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 5,
            reconnect_secs: 5,
            command_timeout_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

impl TimingConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

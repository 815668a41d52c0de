use std::path::{Path, PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    tracing::debug,
};

use crate::{env_subst::substitute_with, schema::WapiConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["wapi.toml", "wapi.yaml", "wapi.yml", "wapi.json"];

/// Environment variables read on top of the config file.
pub mod env {
    pub const WEBHOOK: &str = "GETTING_MESSAGES_WEBHOOK";
    pub const REDIS_HOST: &str = "REDIS_HOST";
    pub const BIND: &str = "WAPI_BIND";
    pub const PORT: &str = "WAPI_PORT";
    pub const CERT_FILE: &str = "CERT_FILE_PATH";
    pub const CERT_KEY: &str = "CERT_KEY_PATH";
    pub const PUBLIC_URL: &str = "WAPI_URL";
    pub const SIDECAR_URL: &str = "WAPI_SIDECAR_URL";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config `{key}` (set `{env}`)")]
    Missing {
        key: &'static str,
        env: &'static str,
    },
    #[error("invalid config `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Load config: explicit path or discovered file, then environment, then validate.
pub fn load(explicit: Option<&Path>) -> Result<WapiConfig, ConfigError> {
    load_with(explicit, |name| std::env::var(name).ok())
}

fn load_with(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<WapiConfig, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => find_config_file(),
    };

    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let raw = substitute_with(&raw, &lookup);
            parse_config(&raw, &path)?
        },
        None => {
            debug!("no config file found, using environment only");
            WapiConfig::default()
        },
    };

    config.apply_env(&lookup)?;
    config.validate()?;
    Ok(config)
}

/// Find the first config file in standard locations.
///
/// Search order:
/// 1. `./wapi.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/wapi/wapi.{toml,yaml,yml,json}` (user-global)
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = home_dir().map(|h| h.join(".config").join("wapi"))?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the data directory: `~/.wapi/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".wapi"))
        .unwrap_or_else(|| PathBuf::from(".wapi"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<WapiConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
        _ => Err(parse_err(format!("unsupported config format: .{ext}"))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl WapiConfig {
    /// Overlay environment variables; set variables win over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = non_empty(lookup(env::WEBHOOK)) {
            self.webhook.base_url = v;
        }
        if let Some(v) = non_empty(lookup(env::REDIS_HOST)) {
            self.dedup.redis_url = Some(Secret::new(v));
        }
        if let Some(v) = non_empty(lookup(env::BIND)) {
            self.server.bind = v;
        }
        if let Some(v) = non_empty(lookup(env::PORT)) {
            self.server.port = v.parse().map_err(|_| ConfigError::Invalid {
                key: "server.port",
                reason: format!("`{v}` is not a port number"),
            })?;
        }
        if let Some(v) = non_empty(lookup(env::CERT_FILE)) {
            self.server.tls_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty(lookup(env::CERT_KEY)) {
            self.server.tls_key = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty(lookup(env::PUBLIC_URL)) {
            self.server.public_url = Some(v);
        }
        if let Some(v) = non_empty(lookup(env::SIDECAR_URL)) {
            self.whatsapp.sidecar_url = v;
        }
        Ok(())
    }

    /// Check that every required value is present and well-formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook.base_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "webhook.base_url",
                env: env::WEBHOOK,
            });
        }
        let base = self.webhook.base_url.as_str();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "webhook.base_url",
                reason: "must be an http:// or https:// URL".into(),
            });
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "server.bind",
                env: env::BIND,
            });
        }
        self.redis_url()?;
        self.tls_paths()?;
        if self.sessions.login_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "sessions.login_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Redis connection URL, with `redis://` prepended to bare `host:port` values.
    pub fn redis_url(&self) -> Result<Secret<String>, ConfigError> {
        let raw = self
            .dedup
            .redis_url
            .as_ref()
            .map(|s| s.expose_secret().trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing {
                key: "dedup.redis_url",
                env: env::REDIS_HOST,
            })?;
        if raw.contains("://") {
            Ok(Secret::new(raw))
        } else {
            Ok(Secret::new(format!("redis://{raw}")))
        }
    }

    /// Certificate and key paths; either both or neither must be configured.
    pub fn tls_paths(&self) -> Result<Option<(PathBuf, PathBuf)>, ConfigError> {
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.clone(), key.clone()))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(ConfigError::Missing {
                key: "server.tls_key",
                env: env::CERT_KEY,
            }),
            (None, Some(_)) => Err(ConfigError::Missing {
                key: "server.tls_cert",
                env: env::CERT_FILE,
            }),
        }
    }
}

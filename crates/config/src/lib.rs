//! Configuration: file discovery, `${ENV}` substitution, environment
//! overrides and validation.
//!
//! Every required value may come from the environment alone, so a bare
//! deployment needs no config file at all. Missing required values are a
//! fatal [`ConfigError`] at startup.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{ConfigError, data_dir, load},
    schema::{DedupConfig, ServerConfig, SessionsConfig, WapiConfig, WebhookConfig, WhatsAppConfig},
};

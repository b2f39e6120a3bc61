//! Worker configuration, loaded from an INI-style key/value file.
//!
//! ```ini
//! [store]
//! base_url = https://qvarn.example.com
//! client_id = worker
//! client_secret = hunter2
//! verify_requests = true
//! scope = scope1,scope2
//! threads = 4
//!
//! [engine]
//! instance = production
//! keep_alive_update_interval = 10
//! keep_alive_timeout = 60
//! ```
//!
//! Parsed into a value that is passed through constructors; there is no
//! process-wide configuration state.

use std::path::Path;

use serde::Deserialize;

use qvarn_client::QvarnClientConfig;

use crate::error::{Error, Result};
use crate::worker::{LISTENER_TIMEOUT, LISTENER_UPDATE_INTERVAL};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_verify_requests")]
    pub verify_requests: bool,
    /// Comma- or whitespace-separated OAuth2 scopes.
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Deployment identifier scoping lease and handler version records, so
    /// several engines can coexist on one store.
    pub instance: String,
    #[serde(default = "default_keep_alive_update_interval")]
    pub keep_alive_update_interval: f64,
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: f64,
}

fn default_verify_requests() -> bool {
    true
}

fn default_threads() -> usize {
    1
}

fn default_keep_alive_update_interval() -> f64 {
    LISTENER_UPDATE_INTERVAL
}

fn default_keep_alive_timeout() -> f64 {
    LISTENER_TIMEOUT
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Ini,
            ))
            .build()
            .map_err(|err| {
                Error::Config(format!("cannot read config file {}: {err}", path.display()))
            })?;
        loaded.try_deserialize().map_err(|err| {
            Error::Config(format!("invalid config file {}: {err}", path.display()))
        })
    }
}

impl StoreSettings {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .replace(',', " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn client_config(&self) -> QvarnClientConfig {
        QvarnClientConfig {
            base_url: self.base_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            verify_requests: self.verify_requests,
            scopes: self.scopes(),
            threads: self.threads,
        }
    }
}

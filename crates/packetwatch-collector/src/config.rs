// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector configuration.
//!
//! Process-level settings (file locations, API port, log level) come from the
//! environment once at startup. Operator-tunable settings (ingest bind,
//! blacklist, agent display names) live in a JSON file and are re-read
//! whenever the file's modification time advances, so edits take effect
//! without a restart.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{info, warn};

/// Environment variable naming the JSON configuration file.
const ENV_CONFIG_PATH: &str = "PW_CONFIG_PATH";
/// Environment variable naming the SQLite database file.
const ENV_DATABASE_PATH: &str = "PW_DATABASE_PATH";
/// Environment variable overriding the HTTP API port.
const ENV_API_PORT: &str = "PW_API_PORT";
/// Environment variable setting the log level filter.
const ENV_LOG_LEVEL: &str = "PW_LOG_LEVEL";

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_DATABASE_PATH: &str = "packetwatch.db";
const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_INGEST_HOST: &str = "127.0.0.1";
const DEFAULT_INGEST_PORT: u16 = 2053;

/// Captures environment-derived options used to bootstrap the collector.
#[derive(Debug, Clone)]
pub struct CollectorEnv {
    /// Path to the hot-reloadable JSON configuration file.
    pub config_path: PathBuf,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Port the HTTP API and websocket endpoint listen on.
    pub api_port: u16,
    /// Log level filter handed to the tracing subscriber.
    pub log_level: String,
}

impl CollectorEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let config_path = map
            .get(ENV_CONFIG_PATH)
            .and_then(|value| sanitize_non_empty(value))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let database_path = map
            .get(ENV_DATABASE_PATH)
            .and_then(|value| sanitize_non_empty(value))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
        let api_port = map
            .get(ENV_API_PORT)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(DEFAULT_API_PORT);
        let log_level = map
            .get(ENV_LOG_LEVEL)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            config_path,
            database_path,
            api_port,
            log_level,
        }
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// On-disk configuration document. Every section is optional so a partial
/// file still loads.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    security: SecuritySection,
    #[serde(default)]
    agent_names: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    #[serde(default = "default_ingest_host")]
    host: String,
    #[serde(default = "default_ingest_port")]
    port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_ingest_host(),
            port: default_ingest_port(),
        }
    }
}

fn default_ingest_host() -> String {
    DEFAULT_INGEST_HOST.to_string()
}

fn default_ingest_port() -> u16 {
    DEFAULT_INGEST_PORT
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SecuritySection {
    #[serde(default)]
    blacklist_ips: Vec<String>,
}

/// Hot-reloadable view of the JSON configuration file.
///
/// Each accessor checks the file's modification time and re-reads only when
/// it has advanced. A missing file yields the documented defaults; a file
/// that fails to parse leaves the previously loaded settings in place.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    state: Mutex<WatcherState>,
}

#[derive(Debug)]
struct WatcherState {
    config: ConfigFile,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Creates a watcher over `path` and performs the initial load.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = WatcherState {
            config: ConfigFile::default(),
            last_modified: None,
        };
        if path.exists() {
            refresh(&path, &mut state);
        } else {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
        }
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Host and port the UDP ingest listener binds to. Read once at startup;
    /// the listener does not rebind on reload.
    pub fn ingest_addr(&self) -> (String, u16) {
        let state = self.refreshed_state();
        (state.config.server.host.clone(), state.config.server.port)
    }

    /// Current set of blacklisted destination addresses. Entries that do not
    /// parse as addresses are skipped; they could never match a decoded
    /// record anyway.
    pub fn blacklist(&self) -> Vec<IpAddr> {
        let state = self.refreshed_state();
        state
            .config
            .security
            .blacklist_ips
            .iter()
            .filter_map(|entry| entry.trim().parse().ok())
            .collect()
    }

    /// Display name for an agent address, falling back to `Agent_<address>`
    /// when no override is configured.
    pub fn agent_name(&self, ip: IpAddr) -> String {
        let state = self.refreshed_state();
        state
            .config
            .agent_names
            .get(&ip.to_string())
            .cloned()
            .unwrap_or_else(|| format!("Agent_{ip}"))
    }

    /// Forgets the recorded modification time so the next access re-reads the
    /// file even when the filesystem clock has not advanced.
    pub fn force_stale(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_modified = None;
    }

    fn refreshed_state(&self) -> std::sync::MutexGuard<'_, WatcherState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        refresh(&self.path, &mut state);
        state
    }
}

/// Re-reads the file when its modification time has advanced past the one
/// recorded at the previous load. Stat or parse failures keep the current
/// settings.
fn refresh(path: &Path, state: &mut WatcherState) {
    let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(_) => return,
    };
    if state.last_modified.is_some_and(|seen| modified <= seen) {
        return;
    }
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<ConfigFile>(&raw) {
            Ok(config) => {
                state.config = config;
                state.last_modified = Some(modified);
                info!("Configuration reloaded from {}", path.display());
            }
            Err(e) => {
                warn!("Failed to parse {}, keeping last good: {e}", path.display());
            }
        },
        Err(e) => {
            warn!("Failed to read {}, keeping last good: {e}", path.display());
        }
    }
}

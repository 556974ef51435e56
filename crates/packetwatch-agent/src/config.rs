// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;

/// Environment variable naming the collector host.
const ENV_COLLECTOR_HOST: &str = "PW_COLLECTOR_HOST";
/// Environment variable naming the collector ingest port.
const ENV_COLLECTOR_PORT: &str = "PW_COLLECTOR_PORT";
/// Environment variable pinning the capture interface. Defaults to the first
/// device pcap can find.
const ENV_CAPTURE_INTERFACE: &str = "PW_CAPTURE_INTERFACE";
/// Environment variable overriding the geolocation lookup endpoint.
const ENV_GEO_API_BASE: &str = "PW_GEO_API_BASE";
/// Environment variable setting the log level filter.
const ENV_LOG_LEVEL: &str = "PW_LOG_LEVEL";

const DEFAULT_COLLECTOR_HOST: &str = "127.0.0.1";
const DEFAULT_COLLECTOR_PORT: u16 = 2053;
const DEFAULT_GEO_API_BASE: &str = "http://ip-api.com/json";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Captures environment-derived options used to bootstrap the agent.
#[derive(Debug, Clone)]
pub struct AgentEnv {
    /// Host the collector's UDP ingest listens on.
    pub collector_host: String,
    /// Port the collector's UDP ingest listens on.
    pub collector_port: u16,
    /// Capture interface name, or `None` to let pcap pick one.
    pub capture_interface: Option<String>,
    /// Base URL for country lookups, without a trailing slash.
    pub geo_api_base: String,
    /// Log level filter handed to the tracing subscriber.
    pub log_level: String,
}

impl AgentEnv {
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

        let collector_host = map
            .get(ENV_COLLECTOR_HOST)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_COLLECTOR_HOST.to_string());
        let collector_port = map
            .get(ENV_COLLECTOR_PORT)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(DEFAULT_COLLECTOR_PORT);
        let capture_interface = map
            .get(ENV_CAPTURE_INTERFACE)
            .and_then(|value| sanitize_non_empty(value));
        let geo_api_base = map
            .get(ENV_GEO_API_BASE)
            .and_then(|value| sanitize_non_empty(value))
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GEO_API_BASE.to_string());
        let log_level = map
            .get(ENV_LOG_LEVEL)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            collector_host,
            collector_port,
            capture_interface,
            geo_api_base,
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

//! TOML configuration for the `eventbridge` binary.
//!
//! The file is read once at startup and converted into the typed settings
//! each component takes. Every value has a default, so an empty or missing
//! file yields a runnable (if unroutable) bridge.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use bridge::backoff::{DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use bridge::{BackoffPolicy, ConfigError, RouteTable, TargetEndpoint};
use dispatcher::config::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_STATUS_POLL_INTERVAL, DEFAULT_WORKERS,
};
use dispatcher::DispatchConfig;

pub const DEFAULT_CONFIG_PATH: &str = "eventbridge.toml";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Log line encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    /// OTLP/gRPC collector; span export is off when unset.
    pub otlp_endpoint: Option<String>,
}

/// Validated settings for the whole process.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    pub dispatch: DispatchConfig,
    pub routes: RouteTable,
    pub telemetry: TelemetryConfig,
}

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerSection,
    dispatch: DispatchSection,
    retry: RetrySection,
    routes: RoutesSection,
    telemetry: TelemetrySection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DispatchSection {
    workers: usize,
    poll_interval_ms: u64,
    attempt_timeout_ms: u64,
    status_poll_interval_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            attempt_timeout_ms: millis(DEFAULT_ATTEMPT_TIMEOUT),
            status_poll_interval_ms: millis(DEFAULT_STATUS_POLL_INTERVAL),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrySection {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: millis(DEFAULT_BASE_DELAY),
            max_delay_ms: millis(DEFAULT_MAX_DELAY),
            jitter: DEFAULT_JITTER,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RoutesSection {
    default: Option<String>,
    types: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TelemetrySection {
    log_format: LogFormat,
    otlp_endpoint: Option<String>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Reads and validates the file at `path`. A missing file yields defaults.
pub fn load(path: &Path) -> Result<BridgeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => parse(""),
        Err(e) => Err(ConfigError::new(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

/// Parses and validates TOML configuration text.
pub fn parse(text: &str) -> Result<BridgeConfig, ConfigError> {
    let file: FileConfig = toml::from_str(text).map_err(|e| ConfigError::new(e.to_string()))?;
    file.into_config()
}

impl FileConfig {
    fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let bind = self.server.bind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::new(format!(
                "server.bind '{}' is not a socket address: {e}",
                self.server.bind
            ))
        })?;

        let dispatch = DispatchConfig {
            workers: self.dispatch.workers,
            poll_interval: Duration::from_millis(self.dispatch.poll_interval_ms),
            attempt_timeout: Duration::from_millis(self.dispatch.attempt_timeout_ms),
            status_poll_interval: Duration::from_millis(self.dispatch.status_poll_interval_ms),
            backoff: BackoffPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
        };
        dispatch.validate()?;

        let mut routes = RouteTable {
            default: self
                .routes
                .default
                .map(|url| endpoint("routes.default", url))
                .transpose()?,
            ..Default::default()
        };
        for (event_type, url) in self.routes.types {
            let target = endpoint(&format!("routes.types.{event_type}"), url)?;
            routes = routes.with_route(event_type, target);
        }

        let otlp_endpoint = self
            .telemetry
            .otlp_endpoint
            .filter(|e| !e.trim().is_empty());

        Ok(BridgeConfig {
            bind,
            dispatch,
            routes,
            telemetry: TelemetryConfig {
                log_format: self.telemetry.log_format,
                otlp_endpoint,
            },
        })
    }
}

fn endpoint(key: &str, url: String) -> Result<TargetEndpoint, ConfigError> {
    TargetEndpoint::new(url.clone())
        .ok_or_else(|| ConfigError::new(format!("{key} '{url}' is not an absolute http(s) URL")))
}

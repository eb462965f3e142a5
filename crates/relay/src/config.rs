// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Malformed numbers fall back to their defaults; a malformed
// tenant list or URL is a startup error because silently dropping tenants
// would leave streamers unserved.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tapcast_common::tenant::TenantKey;
use url::Url;

use crate::aggregate::AggregatorConfig;
use crate::supervisor::{ReconnectPolicy, SupervisorSettings};
use crate::upstream::webcast::DEFAULT_BASE_URL;

const DEV_WS_SECRET: &str = "tapcast_local_development_ws_secret";
const DEV_ADMIN_SECRET: &str = "tapcast_local_development_admin_secret";
/// Shared secrets shorter than this trigger a startup warning.
pub const MIN_SECRET_LEN: usize = 16;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// One registered streamer.
///
/// Accepts both the relay's own field names and the legacy
/// `token`/`tiktokUser` spelling used by older tenant lists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantConfig {
    #[serde(alias = "token")]
    pub key: TenantKey,
    /// Upstream username; defaults to the key when omitted.
    #[serde(default, alias = "tiktokUser")]
    pub identity: String,
    /// Connect at startup instead of waiting for the first subscriber.
    #[serde(default)]
    pub active: bool,
    /// Per-tenant subscriber secret; falls back to the global one.
    #[serde(default)]
    pub secret: Option<String>,
}

impl TenantConfig {
    pub fn new(key: impl AsRef<str>, identity: impl Into<String>) -> Self {
        Self { key: TenantKey::new(key), identity: identity.into(), active: false, secret: None }
    }

    /// Trim fields and fill the identity from the key when missing.
    pub fn normalized(mut self) -> Self {
        self.identity = self.identity.trim().to_string();
        if self.identity.is_empty() {
            self.identity = self.key.as_str().to_string();
        }
        self.secret = self.secret.filter(|secret| !secret.is_empty());
        self
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Global subscriber secret.
    pub ws_secret: String,
    /// Secret expected in `x-admin-secret` on operator routes.
    pub admin_secret: String,
    pub proxy_url: Option<Url>,
    pub upstream_base_url: Url,
    pub tenants: Vec<TenantConfig>,
    /// Log filter directive (e.g. `info`, `tapcast_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub aggregator: AggregatorConfig,
    pub heartbeat_interval: Duration,
    pub profile_ttl: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TAPCAST_HOST` | `0.0.0.0` |
    /// | `TAPCAST_PORT` | `10000` |
    /// | `TAPCAST_WS_SECRET` | dev-only placeholder |
    /// | `TAPCAST_ADMIN_SECRET` | dev-only placeholder |
    /// | `TAPCAST_PROXY_URL` | *(none)* |
    /// | `TAPCAST_UPSTREAM_BASE_URL` | `https://webcast.tiktok.com/webcast` |
    /// | `TAPCAST_TENANTS_JSON` | *(none)* |
    /// | `TAPCAST_TENANTS` | *(none)* |
    /// | `TAPCAST_LOG_FILTER` | `info` |
    /// | `TAPCAST_LOG_FORMAT` | `text` |
    /// | `TAPCAST_BASE_RECONNECT_SECS` | `15` |
    /// | `TAPCAST_MAX_BACKOFF_SECS` | `3600` |
    /// | `TAPCAST_MAX_CONSECUTIVE_FAILURES` | `10` |
    /// | `TAPCAST_MAX_PROXY_FAILURES` | `5` |
    /// | `TAPCAST_PROXY_FALLBACK_SECS` | `900` |
    /// | `TAPCAST_CONNECT_TIMEOUT_SECS` | `20` |
    /// | `TAPCAST_COALESCE_WINDOW_MS` | `1000` |
    /// | `TAPCAST_HEARTBEAT_SECS` | `30` |
    /// | `TAPCAST_PROFILE_TTL_SECS` | `1800` |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let number = |key: &str, default: u64| -> u64 {
            env(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let host = env("TAPCAST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TAPCAST_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(10000);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let ws_secret = env("TAPCAST_WS_SECRET").unwrap_or_else(|_| DEV_WS_SECRET.into());
        let admin_secret = env("TAPCAST_ADMIN_SECRET").unwrap_or_else(|_| DEV_ADMIN_SECRET.into());

        let proxy_url = match env("TAPCAST_PROXY_URL") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                Url::parse(raw.trim()).context("TAPCAST_PROXY_URL is not a valid URL")?,
            ),
            _ => None,
        };
        let upstream_base_url = Url::parse(
            &env("TAPCAST_UPSTREAM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
        )
        .context("TAPCAST_UPSTREAM_BASE_URL is not a valid URL")?;

        let mut tenants = match env("TAPCAST_TENANTS_JSON") {
            Ok(raw) if !raw.trim().is_empty() => parse_tenants_json(&raw)?,
            _ => Vec::new(),
        };
        if let Ok(raw) = env("TAPCAST_TENANTS") {
            for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                if tenants.iter().all(|tenant| tenant.key.as_str() != name) {
                    let mut tenant = TenantConfig::new(name, name);
                    tenant.active = true;
                    tenants.push(tenant);
                }
            }
        }

        let log_filter = env("TAPCAST_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TAPCAST_LOG_FORMAT").as_deref().map(str::trim) {
            Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            base_delay: Duration::from_secs(
                number("TAPCAST_BASE_RECONNECT_SECS", defaults.base_delay.as_secs()).max(1),
            ),
            max_delay: Duration::from_secs(
                number("TAPCAST_MAX_BACKOFF_SECS", defaults.max_delay.as_secs()).max(1),
            ),
            failure_ceiling: number(
                "TAPCAST_MAX_CONSECUTIVE_FAILURES",
                u64::from(defaults.failure_ceiling),
            )
            .try_into()
            .unwrap_or(defaults.failure_ceiling),
            proxy_failure_threshold: number(
                "TAPCAST_MAX_PROXY_FAILURES",
                u64::from(defaults.proxy_failure_threshold),
            )
            .try_into()
            .unwrap_or(defaults.proxy_failure_threshold),
            fallback_delay: Duration::from_secs(number(
                "TAPCAST_PROXY_FALLBACK_SECS",
                defaults.fallback_delay.as_secs(),
            )),
        };

        Ok(Self {
            listen_addr,
            ws_secret,
            admin_secret,
            proxy_url,
            upstream_base_url,
            tenants,
            log_filter,
            log_format,
            reconnect,
            connect_timeout: Duration::from_secs(number("TAPCAST_CONNECT_TIMEOUT_SECS", 20).max(1)),
            aggregator: AggregatorConfig::with_millis(number("TAPCAST_COALESCE_WINDOW_MS", 1000)),
            heartbeat_interval: Duration::from_secs(number("TAPCAST_HEARTBEAT_SECS", 30).max(1)),
            profile_ttl: Duration::from_secs(number("TAPCAST_PROFILE_TTL_SECS", 1800).max(1)),
        })
    }

    /// Returns true when using the development-only subscriber secret.
    pub fn is_dev_ws_secret(&self) -> bool {
        self.ws_secret == DEV_WS_SECRET
    }

    /// Returns true when using the development-only operator secret.
    pub fn is_dev_admin_secret(&self) -> bool {
        self.admin_secret == DEV_ADMIN_SECRET
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            policy: self.reconnect.clone(),
            proxy_url: self.proxy_url.clone(),
            connect_timeout: self.connect_timeout,
            aggregator: self.aggregator.clone(),
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Parse a JSON array of tenant entries, dropping entries with an empty key.
pub fn parse_tenants_json(raw: &str) -> anyhow::Result<Vec<TenantConfig>> {
    let tenants: Vec<TenantConfig> =
        serde_json::from_str(raw).context("TAPCAST_TENANTS_JSON must be a JSON array of tenants")?;
    Ok(tenants
        .into_iter()
        .filter(|tenant| !tenant.key.is_empty())
        .map(TenantConfig::normalized)
        .collect())
}

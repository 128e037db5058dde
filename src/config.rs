//! Client configuration: timeouts, pool limits, TLS and proxy settings.
//!
//! Values come from three places, in order of precedence:
//! - explicit [`ClientParams`] supplied by the caller
//! - environment overrides read through [`Runtime`]
//! - process-wide [`Defaults`]

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::http::FALLBACK_CONCURRENT_LIMIT;
use crate::proxy::ProxyRules;
use crate::runtime::Runtime;

/// Maximum simultaneous (and idle keep-alive) connections per client.
pub const DEFAULT_CONCURRENT_LIMIT: usize = 1000;

/// Timeout applied when a client is built without one.
pub const DEFAULT_TIMEOUT: Timeout = Timeout::new(Duration::from_secs(5), Duration::from_secs(5));

/// Timeout for clients the cache builds when no parameters are given.
pub const CACHED_CLIENT_TIMEOUT: Timeout =
    Timeout::new(Duration::from_secs(600), Duration::from_secs(5));

pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";
pub const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
pub const NO_PROXY_ENV: &str = "NO_PROXY";
pub const SSL_VERIFY_ENV: &str = "SSL_VERIFY";
pub const SSL_CERTIFICATE_ENV: &str = "SSL_CERTIFICATE";

/// Request timeout: an overall deadline plus a connect deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub overall: Duration,
    pub connect: Duration,
}

impl Timeout {
    pub const fn new(overall: Duration, connect: Duration) -> Self {
        Self { overall, connect }
    }

    /// Same deadline for connecting and for the whole request.
    pub const fn uniform(duration: Duration) -> Self {
        Self::new(duration, duration)
    }

    /// Uniform timeout from fractional seconds. Zero, negative, NaN and
    /// out-of-range values are rejected.
    pub fn try_from_secs_f64(secs: f64) -> Result<Self, InvalidTimeout> {
        if secs.is_nan() || secs <= 0.0 {
            return Err(InvalidTimeout(secs));
        }
        Duration::try_from_secs_f64(secs)
            .map(Self::uniform)
            .map_err(|_| InvalidTimeout(secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("timeout must be a positive, finite number of seconds, got {0}")]
pub struct InvalidTimeout(pub f64);

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::uniform(duration)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overall == self.connect {
            write!(f, "{}", self.overall.as_secs_f64())
        } else {
            write!(
                f,
                "Timeout(overall={}, connect={})",
                self.overall.as_secs_f64(),
                self.connect.as_secs_f64()
            )
        }
    }
}

/// A single named client parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Timeout(Timeout),
    ConcurrentLimit(usize),
}

impl Param {
    pub fn name(&self) -> &'static str {
        match self {
            Param::Timeout(_) => "timeout",
            Param::ConcurrentLimit(_) => "concurrent_limit",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Timeout(timeout) => write!(f, "{}", timeout),
            Param::ConcurrentLimit(limit) => write!(f, "{}", limit),
        }
    }
}

/// Ordered client parameters, as a caller would pass keyword arguments.
///
/// Order is preserved because it feeds the client cache key: the same
/// parameters supplied in a different order produce a different key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientParams {
    params: Vec<Param>,
}

impl ClientParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.set(Param::Timeout(timeout.into()));
        self
    }

    pub fn concurrent_limit(mut self, limit: usize) -> Self {
        self.set(Param::ConcurrentLimit(limit));
        self
    }

    /// Set a parameter. An existing parameter of the same name keeps its position.
    pub fn set(&mut self, param: Param) {
        match self.params.iter_mut().find(|p| p.name() == param.name()) {
            Some(existing) => *existing = param,
            None => self.params.push(param),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get_timeout(&self) -> Option<Timeout> {
        self.params.iter().find_map(|p| match p {
            Param::Timeout(timeout) => Some(*timeout),
            _ => None,
        })
    }

    pub fn get_concurrent_limit(&self) -> Option<usize> {
        self.params.iter().find_map(|p| match p {
            Param::ConcurrentLimit(limit) => Some(*limit),
            _ => None,
        })
    }

    /// Concatenates `name_value` for every parameter in order.
    pub fn key_fragment(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("{}_{}", p.name(), p))
            .collect()
    }
}

/// Process-wide fallbacks used when no environment override is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub ssl_verify: bool,
    /// Path to a PEM client certificate.
    pub ssl_certificate: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            ssl_verify: true,
            ssl_certificate: None,
        }
    }
}

/// Environment-sourced settings, resolved once at client construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub ssl_verify: bool,
    pub ssl_certificate: Option<PathBuf>,
}

impl Settings {
    /// Read environment overrides, falling back to `defaults`.
    pub fn resolve<R: Runtime + ?Sized>(runtime: &R, defaults: &Defaults) -> Self {
        let var = |key: &str| runtime.env_var(key).ok().filter(|v| !v.is_empty());

        let ssl_verify = match runtime.env_var(SSL_VERIFY_ENV) {
            Ok(value) => parse_bool(&value),
            Err(_) => defaults.ssl_verify,
        };

        let ssl_certificate = var(SSL_CERTIFICATE_ENV)
            .map(PathBuf::from)
            .or_else(|| defaults.ssl_certificate.clone());

        Self {
            http_proxy: var(HTTP_PROXY_ENV),
            https_proxy: var(HTTPS_PROXY_ENV),
            no_proxy: var(NO_PROXY_ENV),
            ssl_verify,
            ssl_certificate,
        }
    }

    pub fn proxy_rules(&self) -> Option<ProxyRules> {
        ProxyRules::resolve(
            self.http_proxy.as_deref(),
            self.https_proxy.as_deref(),
            self.no_proxy.as_deref(),
        )
    }
}

/// Boolean-ish environment value: empty, `0`, `false`, `no` and `off` are false.
fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Immutable configuration of one pooled client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub timeout: Timeout,
    pub concurrent_limit: usize,
    pub ssl_verify: bool,
    pub ssl_certificate: Option<PathBuf>,
    pub proxy: Option<ProxyRules>,
}

impl ClientConfig {
    /// Build a configuration, applying [`DEFAULT_TIMEOUT`] when `timeout` is `None`.
    pub fn new(settings: &Settings, timeout: Option<Timeout>, concurrent_limit: usize) -> Self {
        let config = Self {
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            concurrent_limit,
            ssl_verify: settings.ssl_verify,
            ssl_certificate: settings.ssl_certificate.clone(),
            proxy: settings.proxy_rules(),
        };
        debug!(
            "Client config: timeout={}, concurrent_limit={}, ssl_verify={}, proxy={}",
            config.timeout,
            config.concurrent_limit,
            config.ssl_verify,
            config.proxy.is_some()
        );
        config
    }

    pub fn from_params(settings: &Settings, params: &ClientParams) -> Self {
        Self::new(
            settings,
            params.get_timeout(),
            params
                .get_concurrent_limit()
                .unwrap_or(DEFAULT_CONCURRENT_LIMIT),
        )
    }

    /// Same settings, limited to a single connection.
    pub fn single_connection(&self) -> Self {
        Self {
            concurrent_limit: FALLBACK_CONCURRENT_LIMIT,
            ..self.clone()
        }
    }
}

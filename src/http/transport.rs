//! Transport capability and the reqwest-backed pooled client factory.
//!
//! A [`Connector`] turns a [`ClientConfig`] into a transport owning one
//! connection pool. The reqwest client behind a transport is built lazily on
//! the first request, so configuration problems such as a malformed proxy URL
//! or an unreadable certificate surface from `send`, never from construction.

use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use tokio::sync::Semaphore;

use super::request::{Request, RequestBody};
use super::response::Response;
use super::retry::classify_error;
use crate::config::ClientConfig;
use crate::error::{BoxError, Error, Result};

const USER_AGENT: &str = concat!("pooled-http/", env!("POOLED_HTTP_VERSION"));

/// Asynchronous request capability over one connection pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Unless `stream` is set the body is read before returning.
    async fn send(&self, request: &Request, stream: bool) -> Result<Response>;

    /// Release the pool. Later sends fail with [`Error::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Blocking request capability over one connection pool.
#[cfg_attr(test, mockall::automock)]
pub trait BlockingTransport: Send + Sync {
    fn send(&self, request: &Request, stream: bool) -> Result<Response>;
    fn close(&self) -> Result<()>;
}

/// Builds pool-backed transports from a client configuration.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ClientConfig) -> Box<dyn Transport>;
    fn connect_blocking(&self, config: &ClientConfig) -> Box<dyn BlockingTransport>;
}

/// Connector producing reqwest-backed transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PooledConnector;

impl Connector for PooledConnector {
    #[tracing::instrument(skip(self, config))]
    fn connect(&self, config: &ClientConfig) -> Box<dyn Transport> {
        Box::new(PooledTransport::new(config.clone()))
    }

    #[tracing::instrument(skip(self, config))]
    fn connect_blocking(&self, config: &ClientConfig) -> Box<dyn BlockingTransport> {
        Box::new(BlockingPooledTransport::new(config.clone()))
    }
}

/// Lifecycle of the pool behind a transport.
enum Pool<C> {
    /// Not built yet; sockets open on first use.
    Pending,
    Ready(C),
    Closed,
}

impl<C: Clone> Pool<C> {
    /// Returns the live client, building it on first use.
    fn get_or_build(&mut self, build: impl FnOnce() -> Result<C, BoxError>) -> Result<C> {
        match self {
            Pool::Ready(client) => Ok(client.clone()),
            Pool::Closed => Err(Error::Closed),
            Pool::Pending => {
                let client = build().map_err(Error::Transport)?;
                *self = Pool::Ready(client.clone());
                Ok(client)
            }
        }
    }

    /// Marks the pool closed, returning whether it was open before.
    fn close(&mut self) -> bool {
        !matches!(std::mem::replace(self, Pool::Closed), Pool::Closed)
    }
}

/// Applies the settings shared by the async and blocking reqwest builders.
macro_rules! configure_builder {
    ($builder:expr, $config:expr) => {{
        let config: &ClientConfig = $config;
        let mut builder = $builder
            .user_agent(USER_AGENT)
            .timeout(config.timeout.overall)
            .connect_timeout(config.timeout.connect)
            .pool_max_idle_per_host(config.concurrent_limit)
            .danger_accept_invalid_certs(!config.ssl_verify)
            // Routing comes only from ProxyRules, never from reqwest's own env lookup
            .no_proxy();

        if let Some(rules) = &config.proxy {
            for proxy in rules.to_proxies()? {
                builder = builder.proxy(proxy);
            }
        }

        if let Some(path) = &config.ssl_certificate {
            let pem = fs::read(path)?;
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        builder.build()?
    }};
}

/// Copies a [`Request`] onto a reqwest request builder.
macro_rules! apply_request {
    ($builder:expr, $request:expr) => {{
        let request: &Request = $request;
        let mut builder = $builder.headers(request.headers.clone());
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        match (&request.body, &request.json) {
            (Some(RequestBody::Form(fields)), _) => builder.form(fields),
            (Some(RequestBody::Text(text)), _) => builder.body(text.clone()),
            (None, Some(json)) => builder.json(json),
            (None, None) => builder,
        }
    }};
}

fn build_client(config: &ClientConfig) -> Result<reqwest::Client, BoxError> {
    let client = configure_builder!(reqwest::Client::builder(), config);
    debug!(
        "Built connection pool: limit={}, timeout={}",
        config.concurrent_limit, config.timeout
    );
    Ok(client)
}

/// Live state of a blocking pool.
#[derive(Clone)]
struct BlockingPool {
    client: reqwest::blocking::Client,
    /// Lets synchronous callers wait for a connection slot.
    gate: Arc<tokio::runtime::Runtime>,
}

fn build_blocking_pool(config: &ClientConfig) -> Result<BlockingPool, BoxError> {
    let client = configure_builder!(reqwest::blocking::Client::builder(), config);
    let gate = tokio::runtime::Builder::new_current_thread().build()?;
    debug!(
        "Built blocking connection pool: limit={}, timeout={}",
        config.concurrent_limit, config.timeout
    );
    Ok(BlockingPool {
        client,
        gate: Arc::new(gate),
    })
}

/// Asynchronous transport over a reqwest connection pool.
///
/// Live connections are bounded by `concurrent_limit`; excess requests wait
/// for a slot. A streaming response keeps its slot until its body is dropped.
pub struct PooledTransport {
    config: ClientConfig,
    pool: Mutex<Pool<reqwest::Client>>,
    permits: Arc<Semaphore>,
}

impl PooledTransport {
    pub fn new(config: ClientConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrent_limit.max(1)));
        Self {
            config,
            pool: Mutex::new(Pool::Pending),
            permits,
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_build(|| build_client(&self.config))
    }
}

#[async_trait]
impl Transport for PooledTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &Request, stream: bool) -> Result<Response> {
        let client = self.client()?;
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let builder = apply_request!(client.request(request.method.clone(), &request.url), request);
        let response = builder.send().await.map_err(classify_error)?;

        if stream {
            return Ok(Response::streaming(response, Some(permit)));
        }

        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify_error)?;
        Ok(Response::buffered(url, status, headers, body))
    }

    async fn close(&self) -> Result<()> {
        let was_open = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        self.permits.close();
        if was_open {
            debug!("Released connection pool (limit={})", self.config.concurrent_limit);
        }
        Ok(())
    }
}

/// Blocking transport over a reqwest connection pool.
///
/// Slots are counted as in [`PooledTransport`]; a caller over the limit
/// blocks its thread until one frees up. The reqwest client runs its own
/// runtime thread, so the transport must be used and dropped outside of an
/// asynchronous context.
pub struct BlockingPooledTransport {
    config: ClientConfig,
    pool: Mutex<Pool<BlockingPool>>,
    permits: Arc<Semaphore>,
}

impl BlockingPooledTransport {
    pub fn new(config: ClientConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrent_limit.max(1)));
        Self {
            config,
            pool: Mutex::new(Pool::Pending),
            permits,
        }
    }

    fn pool(&self) -> Result<BlockingPool> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_build(|| build_blocking_pool(&self.config))
    }
}

impl BlockingTransport for BlockingPooledTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    fn send(&self, request: &Request, stream: bool) -> Result<Response> {
        let pool = self.pool()?;
        let permit = pool
            .gate
            .block_on(Arc::clone(&self.permits).acquire_owned())
            .map_err(|_| Error::Closed)?;

        let builder = apply_request!(
            pool.client.request(request.method.clone(), &request.url),
            request
        );
        let response = builder.send().map_err(classify_error)?;

        if stream {
            return Ok(Response::blocking_streaming(response, Some(permit)));
        }

        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().map_err(classify_error)?;
        Ok(Response::buffered(url, status, headers, body))
    }

    fn close(&self) -> Result<()> {
        let was_open = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        self.permits.close();
        if was_open {
            debug!("Released blocking connection pool (limit={})", self.config.concurrent_limit);
        }
        Ok(())
    }
}

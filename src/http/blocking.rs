//! Blocking pooled HTTP client.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use reqwest::header::HeaderMap;

use super::request::{PostRequest, Request};
use super::response::Response;
use super::transport::{BlockingTransport, Connector, PooledConnector};
use crate::config::{ClientConfig, ClientParams, Defaults, Settings};
use crate::error::Result;
use crate::runtime::RealRuntime;

/// Pooled HTTP client that blocks the calling thread for each request.
///
/// Unlike [`AsyncHttpClient`](super::AsyncHttpClient) this client never checks
/// response status and never retries: a 500 comes back as an `Ok` response.
///
/// The reqwest pool behind it runs its own runtime thread, so the client must
/// be used and dropped outside of an async context. Dropping an unclosed
/// client closes it and discards any error.
pub struct HttpClient {
    transport: Box<dyn BlockingTransport>,
    closed: AtomicBool,
}

impl HttpClient {
    /// Creates a client backed by a reqwest connection pool.
    pub fn new(settings: &Settings, params: &ClientParams) -> Self {
        Self::with_connector(&ClientConfig::from_params(settings, params), &PooledConnector)
    }

    /// Creates a client reading proxy and TLS settings from the process environment.
    pub fn from_env(params: &ClientParams) -> Self {
        Self::new(&Settings::resolve(&RealRuntime, &Defaults::default()), params)
    }

    pub fn with_connector(config: &ClientConfig, connector: &dyn Connector) -> Self {
        Self::with_transport(connector.connect_blocking(config))
    }

    /// Wraps an already constructed transport.
    pub fn with_transport(transport: Box<dyn BlockingTransport>) -> Self {
        Self {
            transport,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a GET. Errors are returned unchanged.
    #[tracing::instrument(skip(self, params, headers))]
    pub fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
        headers: Option<&HeaderMap>,
    ) -> Result<Response> {
        let request = Request::get(url, params, headers);
        self.transport.send(&request, false)
    }

    /// Sends a POST. The status is left for the caller to check.
    #[tracing::instrument(skip(self, post))]
    pub fn post(&self, url: &str, post: PostRequest) -> Result<Response> {
        let request = Request::post(url, &post);
        self.transport.send(&request, post.stream)
    }

    /// Releases the connection pool. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.close()
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!("Ignoring error while closing client: {}", err);
        }
    }
}

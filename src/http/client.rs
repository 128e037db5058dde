//! Asynchronous pooled HTTP client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use reqwest::header::HeaderMap;

use super::request::{PostRequest, Request};
use super::response::Response;
use super::retry::post_with_fallback;
use super::transport::{Connector, PooledConnector, Transport};
use crate::config::{ClientConfig, ClientParams, Defaults, Settings};
use crate::error::{Error, Result};
use crate::runtime::RealRuntime;

/// Pooled HTTP client for use from async tasks.
///
/// Requests from many tasks share one connection pool bounded by the
/// configured concurrency limit. A POST that loses its connection mid-flight
/// is retried once on a throwaway single-connection client.
///
/// Prefer an explicit [`close`](Self::close) or [`scope`](Self::scope). When a
/// client is dropped unclosed inside a Tokio runtime, closing is scheduled as
/// a background task; outside a runtime it is skipped.
pub struct AsyncHttpClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    closed: AtomicBool,
}

impl AsyncHttpClient {
    /// Creates a client backed by a reqwest connection pool.
    pub fn new(settings: &Settings, params: &ClientParams) -> Self {
        Self::with_connector(
            ClientConfig::from_params(settings, params),
            Arc::new(PooledConnector),
        )
    }

    /// Creates a client reading proxy and TLS settings from the process environment.
    pub fn from_env(params: &ClientParams) -> Self {
        Self::new(&Settings::resolve(&RealRuntime, &Defaults::default()), params)
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let transport = connector.connect(&config);
        Self {
            config,
            connector,
            transport: Some(transport),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Result<&dyn Transport> {
        self.transport.as_deref().ok_or(Error::Closed)
    }

    /// Sends a GET. The status is not checked and errors are returned unchanged.
    #[tracing::instrument(skip(self, params, headers))]
    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
        headers: Option<&HeaderMap>,
    ) -> Result<Response> {
        let request = Request::get(url, params, headers);
        self.transport()?.send(&request, false).await
    }

    /// Sends a POST and fails with [`Error::Status`] on a 4xx/5xx response.
    ///
    /// On [`Error::ConnectionProtocol`] the request is retried exactly once on
    /// a fresh single-connection client, which is closed before returning.
    #[tracing::instrument(skip(self, post))]
    pub async fn post(&self, url: &str, post: PostRequest) -> Result<Response> {
        let request = Request::post(url, &post);
        let stream = post.stream;

        let this = self;
        let request = &request;
        post_with_fallback(
            move || async move { this.transport()?.send(request, stream).await },
            move || this.fallback_post(request, stream),
        )
        .await
    }

    /// Sends a POST on this client without fallback, checking the status.
    pub async fn single_connection_post(&self, request: &Request, stream: bool) -> Result<Response> {
        self.transport()?
            .send(request, stream)
            .await?
            .error_for_status()
    }

    async fn fallback_post(&self, request: &Request, stream: bool) -> Result<Response> {
        let fallback = Self::with_connector(
            self.config.single_connection(),
            Arc::clone(&self.connector),
        );
        fallback
            .scope(async |client| client.single_connection_post(request, stream).await)
            .await
    }

    /// Releases the connection pool. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.transport.as_deref() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    /// Closes the client, discarding any error raised while closing.
    pub async fn release(self) {
        if let Err(err) = self.close().await {
            debug!("Ignoring error while closing client: {}", err);
        }
    }

    /// Runs `f` with this client and releases it afterwards on every path.
    pub async fn scope<T>(self, f: impl AsyncFnOnce(&AsyncHttpClient) -> T) -> T {
        let output = f(&self).await;
        self.release().await;
        output
    }
}

impl Drop for AsyncHttpClient {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        let Some(transport) = self.transport.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeout;
    use crate::http::{MockConnector, MockTransport};
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn response(status: StatusCode) -> Response {
        Response::buffered(
            "http://llm.local/v1/chat".parse().unwrap(),
            status,
            HeaderMap::new(),
            format!("status {}", status.as_u16()),
        )
    }

    fn config() -> ClientConfig {
        ClientConfig::new(
            &Settings::default(),
            Some(Timeout::uniform(Duration::from_secs(30))),
            100,
        )
    }

    fn boxed(transport: MockTransport) -> Box<dyn Transport> {
        Box::new(transport)
    }

    /// Main transport whose POSTs always return `result`.
    fn main_transport(result: fn() -> Result<Response>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(move |_, _| result());
        transport.expect_close().returning(|| Ok(()));
        transport
    }

    /// Connector handing out `main` first, then `fallback` for a single-connection config.
    fn connector(main: MockTransport, fallback: Option<MockTransport>) -> Arc<dyn Connector> {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .withf(|config| config.concurrent_limit == 100)
            .times(1)
            .return_once(move |_| boxed(main));
        match fallback {
            Some(fallback) => {
                connector
                    .expect_connect()
                    .withf(|config| {
                        config.concurrent_limit == 1
                            && config.timeout == Timeout::uniform(Duration::from_secs(30))
                    })
                    .times(1)
                    .return_once(move |_| boxed(fallback));
            }
            None => {
                connector
                    .expect_connect()
                    .withf(|config| config.concurrent_limit == 1)
                    .never();
            }
        }
        Arc::new(connector)
    }

    fn fallback_transport(
        result: fn() -> Result<Response>,
        closes: Arc<AtomicUsize>,
        close_result: fn() -> Result<()>,
    ) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(move |_, _| result());
        transport.expect_close().times(1).returning(move || {
            closes.fetch_add(1, Ordering::SeqCst);
            close_result()
        });
        transport
    }

    #[tokio::test]
    async fn test_post_success_uses_shared_pool() {
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(main_transport(|| Ok(response(StatusCode::OK))), None),
        );

        let response = client
            .post("http://llm.local/v1/chat", PostRequest::new().json(json!({"q": 1})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_error_status_fails_without_fallback() {
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Ok(response(StatusCode::INTERNAL_SERVER_ERROR))),
                None,
            ),
        );

        let err = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(err.response().unwrap().text().unwrap(), "status 500");
    }

    #[tokio::test]
    async fn test_post_other_error_fails_without_fallback() {
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Err(Error::Transport("operation timed out".into()))),
                None,
            ),
        );

        let err = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("operation timed out"));
    }

    #[tokio::test]
    async fn test_post_connection_error_retries_on_single_connection() {
        let closes = Arc::new(AtomicUsize::new(0));
        let fallback = fallback_transport(
            || Ok(response(StatusCode::OK)),
            closes.clone(),
            || Ok(()),
        );
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Err(Error::ConnectionProtocol("peer reset".into()))),
                Some(fallback),
            ),
        );

        let response = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_second_connection_error_is_raised_and_fallback_closed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let fallback = fallback_transport(
            || Err(Error::ConnectionProtocol("reset on retry".into())),
            closes.clone(),
            || Ok(()),
        );
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Err(Error::ConnectionProtocol("peer reset".into()))),
                Some(fallback),
            ),
        );

        let err = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap_err();

        assert!(err.is_connection_protocol());
        assert!(err.to_string().contains("reset on retry"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_status_error_is_raised_and_fallback_closed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let fallback = fallback_transport(
            || Ok(response(StatusCode::BAD_GATEWAY)),
            closes.clone(),
            || Ok(()),
        );
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Err(Error::ConnectionProtocol("peer reset".into()))),
                Some(fallback),
            ),
        );

        let err = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_close_error_is_swallowed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let fallback = fallback_transport(
            || Ok(response(StatusCode::OK)),
            closes.clone(),
            || Err(Error::Transport("close failed".into())),
        );
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Err(Error::ConnectionProtocol("peer reset".into()))),
                Some(fallback),
            ),
        );

        let response = client
            .post("http://llm.local/v1/chat", PostRequest::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_does_not_check_status() {
        let client = AsyncHttpClient::with_connector(
            config(),
            connector(
                main_transport(|| Ok(response(StatusCode::SERVICE_UNAVAILABLE))),
                None,
            ),
        );

        let response = client.get("http://llm.local/health", &[], None).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_close_twice_closes_transport_once() {
        let mut transport = MockTransport::new();
        transport.expect_close().times(1).returning(|| Ok(()));
        let client = AsyncHttpClient::with_connector(config(), connector(transport, None));

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_scope_releases_client() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_, _| Ok(response(StatusCode::OK)));
        transport.expect_close().times(1).returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let client = AsyncHttpClient::with_connector(config(), connector(transport, None));

        let status = client
            .scope(async |client| {
                client
                    .get("http://llm.local/health", &[], None)
                    .await
                    .map(|r| r.status())
            })
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_schedules_close_in_runtime() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut transport = MockTransport::new();
        transport.expect_close().times(1).returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        drop(AsyncHttpClient::with_connector(config(), connector(transport, None)));

        for _ in 0..10 {
            if closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_outside_runtime_skips_close() {
        let mut transport = MockTransport::new();
        transport.expect_close().never();

        drop(AsyncHttpClient::with_connector(config(), connector(transport, None)));
    }
}

//! Responses returned by the clients, buffered or streaming.

use std::io::{self, Read};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use tokio::sync::OwnedSemaphorePermit;

use super::retry::classify_error;
use crate::error::{Error, Result};

/// Response body as handed back by the transport.
#[derive(Debug)]
pub enum ResponseBody {
    /// Fully read before the request returned.
    Buffered(Bytes),
    /// Unread body of an asynchronous request sent with `stream`.
    Streaming(Streaming<reqwest::Response>),
    /// Unread body of a blocking request sent with `stream`.
    BlockingStreaming(Streaming<reqwest::blocking::Response>),
}

/// Unread body that occupies one of its client's connection slots.
///
/// The slot is released when the body is dropped, so a client never has
/// more than `concurrent_limit` live connections, streaming or not.
#[derive(Debug)]
pub struct Streaming<R> {
    response: R,
    permit: Option<OwnedSemaphorePermit>,
}

impl<R> Streaming<R> {
    pub(crate) fn new(response: R, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self { response, permit }
    }

    pub fn get_ref(&self) -> &R {
        &self.response
    }

    /// Whether this body still counts against the client's limit.
    pub fn holds_slot(&self) -> bool {
        self.permit.is_some()
    }
}

impl Streaming<reqwest::Response> {
    /// Next chunk of the body, `None` once it is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(classify_error)
    }

    /// The body as a stream of chunks. The slot is held until the stream is dropped.
    pub fn bytes_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> {
        let permit = self.permit;
        self.response.bytes_stream().map(move |chunk| {
            let _slot = &permit;
            chunk
        })
    }
}

impl Read for Streaming<reqwest::blocking::Response> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}

#[derive(Debug)]
pub struct Response {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn buffered(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            url,
            status,
            headers,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    /// Wraps an unread async response; `permit` is released with the body.
    pub fn streaming(response: reqwest::Response, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            url: response.url().clone(),
            status: response.status(),
            headers: response.headers().clone(),
            body: ResponseBody::Streaming(Streaming::new(response, permit)),
        }
    }

    /// Wraps an unread blocking response; `permit` is released with the body.
    pub fn blocking_streaming(
        response: reqwest::blocking::Response,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            url: response.url().clone(),
            status: response.status(),
            headers: response.headers().clone(),
            body: ResponseBody::BlockingStreaming(Streaming::new(response, permit)),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self.body, ResponseBody::Buffered(_))
    }

    /// Buffered body bytes. Fails with [`Error::Streaming`] on a streaming response.
    pub fn bytes(&self) -> Result<&Bytes> {
        match &self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            _ => Err(Error::Streaming),
        }
    }

    /// Buffered body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Result<String> {
        self.bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Turns a 4xx/5xx response into [`Error::Status`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::Status(Box::new(self)))
        } else {
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode) -> Response {
        Response::buffered(
            "http://example.com/".parse().unwrap(),
            status,
            HeaderMap::new(),
            "hello",
        )
    }

    #[test]
    fn test_error_for_status_passes_success_and_redirects() {
        assert!(response(StatusCode::OK).error_for_status().is_ok());
        assert!(response(StatusCode::NO_CONTENT).error_for_status().is_ok());
        assert!(response(StatusCode::FOUND).error_for_status().is_ok());
    }

    #[test]
    fn test_error_for_status_rejects_client_and_server_errors() {
        for status in [StatusCode::NOT_FOUND, StatusCode::INTERNAL_SERVER_ERROR] {
            let err = response(status).error_for_status().unwrap_err();
            assert_eq!(err.status(), Some(status));
            assert_eq!(err.response().unwrap().text().unwrap(), "hello");
        }
    }

    #[test]
    fn test_buffered_body_access() {
        let response = response(StatusCode::OK);
        assert!(!response.is_streaming());
        assert_eq!(response.bytes().unwrap().as_ref(), b"hello");
        assert!(matches!(response.into_body(), ResponseBody::Buffered(_)));
    }
}

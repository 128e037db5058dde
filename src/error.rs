//! Error taxonomy shared by the synchronous and asynchronous clients.

use crate::http::Response;

/// Boxed source error carried by transport-level variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer reset or corrupted the connection mid-request.
    ///
    /// This is the only error the asynchronous POST path recovers from, by
    /// retrying once on a single-connection client.
    #[error("connection protocol error: {0}")]
    ConnectionProtocol(#[source] BoxError),

    /// The server answered with a 4xx or 5xx status. Carries the response.
    #[error("HTTP status {} for url ({})", .0.status(), .0.url())]
    Status(Box<Response>),

    /// Any other transport failure (timeout, DNS, TLS, proxy, invalid URL).
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The client's connection pool was released by `close()`.
    #[error("client has been closed")]
    Closed,

    /// A buffered body was requested from a streaming response.
    #[error("response body is streaming; read it through into_body()")]
    Streaming,
}

impl Error {
    /// Returns true for the connection-protocol class of failure.
    pub fn is_connection_protocol(&self) -> bool {
        matches!(self, Error::ConnectionProtocol(_))
    }

    /// Returns the response carried by a status error.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Status(response) => Some(response),
            _ => None,
        }
    }

    /// Returns the status code carried by a status error.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        self.response().map(Response::status)
    }
}

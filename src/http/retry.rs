//! Error classification and the single-connection fallback for POST requests.
//!
//! The asynchronous POST path is a small state machine:
//!
//! ```text
//! Attempt --response--------> StatusCheck --2xx/3xx--> Done
//!    |                            `--4xx/5xx--> Failed
//!    |--connection protocol--> Fallback --ok--> Done
//!    |                            `--any error--> Failed
//!    `--other error---------> Failed
//! ```
//!
//! `Fallback` runs exactly once on a fresh single-connection client. There
//! is no backoff and no second fallback.

use std::error::Error as StdError;
use std::future::Future;
use std::io;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::http::Response;

/// Connection limit of the throwaway client used for the fallback attempt.
pub const FALLBACK_CONCURRENT_LIMIT: usize = 1;

/// Messages hyper and h2 use when a peer breaks an in-flight exchange.
const PROTOCOL_FAILURE_MARKERS: &[&str] = &[
    "connection closed before message completed",
    "end of file before message length reached",
    "connection reset",
    "broken pipe",
    "unexpected eof",
    "incomplete message",
    "unexpected message from connection",
    "invalid http",
    "protocol error",
    "frame with invalid size",
];

/// Maps a reqwest error onto the crate's error taxonomy.
pub fn classify_error(error: reqwest::Error) -> Error {
    if !error.is_timeout() && is_connection_protocol(&error) {
        debug!("Classified as connection protocol failure: {}", error);
        Error::ConnectionProtocol(Box::new(error))
    } else {
        Error::Transport(Box::new(error))
    }
}

/// Walks the source chain looking for a broken-connection cause.
pub fn is_connection_protocol(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }

        let message = err.to_string().to_ascii_lowercase();
        if PROTOCOL_FAILURE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return true;
        }

        current = err.source();
    }
    false
}

/// Result of one send attempt, tagged by how the caller must react.
#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    ConnectionLost(Error),
    Failed(Error),
}

impl From<Result<Response>> for Outcome {
    fn from(result: Result<Response>) -> Self {
        match result {
            Ok(response) => Outcome::Response(response),
            Err(err) if err.is_connection_protocol() => Outcome::ConnectionLost(err),
            Err(err) => Outcome::Failed(err),
        }
    }
}

#[derive(Debug)]
enum PostState {
    Attempt,
    StatusCheck(Response),
    Fallback,
    Done(Response),
    Failed(Error),
}

/// Drives one POST through the state machine.
///
/// `attempt` sends on the shared pool; `fallback` sends on a fresh
/// single-connection client, checks the status and releases that client.
pub async fn post_with_fallback<A, AF, F, FF>(mut attempt: A, mut fallback: F) -> Result<Response>
where
    A: FnMut() -> AF,
    AF: Future<Output = Result<Response>>,
    F: FnMut() -> FF,
    FF: Future<Output = Result<Response>>,
{
    let mut state = PostState::Attempt;
    loop {
        state = match state {
            PostState::Attempt => match Outcome::from(attempt().await) {
                Outcome::Response(response) => PostState::StatusCheck(response),
                Outcome::ConnectionLost(err) => {
                    warn!("POST lost its connection ({}), retrying on a single connection", err);
                    PostState::Fallback
                }
                Outcome::Failed(err) => PostState::Failed(err),
            },
            PostState::StatusCheck(response) => match response.error_for_status() {
                Ok(response) => PostState::Done(response),
                Err(err) => PostState::Failed(err),
            },
            PostState::Fallback => match fallback().await {
                Ok(response) => PostState::Done(response),
                Err(err) => PostState::Failed(err),
            },
            PostState::Done(response) => return Ok(response),
            PostState::Failed(err) => return Err(err),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(status: StatusCode) -> Response {
        Response::buffered(
            "http://example.com/".parse().unwrap(),
            status,
            HeaderMap::new(),
            "",
        )
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "error sending request")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_is_connection_protocol_io_kinds() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = Wrapped(io::Error::new(kind, "boom"));
            assert!(is_connection_protocol(&err), "{kind:?}");
        }
        let err = Wrapped(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(!is_connection_protocol(&err));
    }

    #[test]
    fn test_is_connection_protocol_hyper_messages() {
        let err = io::Error::other("connection closed before message completed");
        assert!(is_connection_protocol(&err));

        let err = io::Error::other("dns error: failed to lookup address information");
        assert!(!is_connection_protocol(&err));
    }

    #[test]
    fn test_outcome_tags() {
        assert!(matches!(
            Outcome::from(Ok(response(StatusCode::OK))),
            Outcome::Response(_)
        ));
        assert!(matches!(
            Outcome::from(Err(Error::ConnectionProtocol("reset".into()))),
            Outcome::ConnectionLost(_)
        ));
        assert!(matches!(
            Outcome::from(Err(Error::Transport("timeout".into()))),
            Outcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_success_skips_fallback() {
        let counter = AtomicUsize::new(0);
        let fallbacks = &counter;
        let result = post_with_fallback(
            || async { Ok(response(StatusCode::OK)) },
            move || async move {
                fallbacks.fetch_add(1, Ordering::SeqCst);
                Ok(response(StatusCode::OK))
            },
        )
        .await;

        assert_eq!(result.unwrap().status(), StatusCode::OK);
        assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_status_fails_without_fallback() {
        let counter = AtomicUsize::new(0);
        let fallbacks = &counter;
        let result = post_with_fallback(
            || async { Ok(response(StatusCode::TOO_MANY_REQUESTS)) },
            move || async move {
                fallbacks.fetch_add(1, Ordering::SeqCst);
                Ok(response(StatusCode::OK))
            },
        )
        .await;

        assert_eq!(
            result.unwrap_err().status(),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
        assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connection_error_runs_fallback_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let fallbacks = Arc::new(AtomicUsize::new(0));

        let result = post_with_fallback(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ConnectionProtocol("reset".into()))
                }
            },
            || {
                let fallbacks = fallbacks.clone();
                async move {
                    fallbacks.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ConnectionProtocol("reset again".into()))
                }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_connection_protocol());
        assert!(err.to_string().contains("reset again"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_error_is_returned_unchanged() {
        let result = post_with_fallback(
            || async { Err(Error::Transport("tls handshake failed".into())) },
            || async { Ok(response(StatusCode::OK)) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("tls handshake failed"));
    }
}

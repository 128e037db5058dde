//! Pooled HTTP clients with single-connection fallback on broken connections.

mod blocking;
mod client;
mod request;
mod response;
pub mod retry;
mod transport;

pub use blocking::HttpClient;
pub use client::AsyncHttpClient;
pub use request::{PostRequest, Request, RequestBody};
pub use response::{Response, ResponseBody, Streaming};
pub use retry::{FALLBACK_CONCURRENT_LIMIT, classify_error, is_connection_protocol};
pub use transport::{
    BlockingPooledTransport, BlockingTransport, Connector, PooledConnector, PooledTransport,
    Transport,
};

#[cfg(test)]
pub use transport::{MockBlockingTransport, MockConnector, MockTransport};

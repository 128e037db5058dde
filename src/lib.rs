//! Managed HTTP clients for services that make many outbound calls.
//!
//! - [`http::AsyncHttpClient`] / [`http::HttpClient`]: pooled clients with
//!   proxy routing and TLS settings taken from the environment.
//! - [`cache::ClientCache`]: reuses one pooled client per distinct set of
//!   construction parameters.
//!
//! An asynchronous POST that loses its connection mid-request is retried
//! once on a fresh single-connection client.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod runtime;

pub use cache::{CachedClient, ClientCache, ClientKind};
pub use config::{ClientConfig, ClientParams, Defaults, Settings, Timeout};
pub use error::{Error, Result};
pub use http::{AsyncHttpClient, HttpClient, PostRequest, Response, ResponseBody};

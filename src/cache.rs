//! Registry of live clients keyed by their construction parameters.
//!
//! Repeated requests with identical parameters reuse one pooled client
//! instead of building a connection pool per call. Entries live as long as
//! the cache; there is no eviction and no invalidation.
//!
//! The key concatenates parameters in the order they were supplied, so
//! `timeout` then `concurrent_limit` and the reverse map to different
//! entries even though they configure identical clients.

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use log::debug;

use crate::config::{
    CACHED_CLIENT_TIMEOUT, ClientConfig, ClientParams, DEFAULT_CONCURRENT_LIMIT, Defaults,
    Settings,
};
use crate::http::{AsyncHttpClient, Connector, HttpClient, PooledConnector};
use crate::runtime::{RealRuntime, Runtime};

/// Which flavour of client an entry holds. Each kind has its own key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Sync,
    Async,
}

impl ClientKind {
    fn prefix(&self) -> &'static str {
        match self {
            ClientKind::Sync => "http_client",
            ClientKind::Async => "async_http_client",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Sync => write!(f, "sync"),
            ClientKind::Async => write!(f, "async"),
        }
    }
}

/// A client handed out by [`ClientCache::get`].
#[derive(Clone)]
pub enum CachedClient {
    Sync(Arc<HttpClient>),
    Async(Arc<AsyncHttpClient>),
}

/// Process-wide client registry, owned explicitly and shared by reference.
///
/// Concurrent first lookups of the same key construct exactly one client.
/// Closing a cached client does not remove it; later lookups return the
/// same, now closed, instance.
pub struct ClientCache {
    runtime: Arc<dyn Runtime>,
    defaults: Defaults,
    connector: Arc<dyn Connector>,
    sync_clients: DashMap<String, Arc<HttpClient>>,
    async_clients: DashMap<String, Arc<AsyncHttpClient>>,
}

impl ClientCache {
    pub fn new(runtime: Arc<dyn Runtime>, defaults: Defaults) -> Self {
        Self::with_connector(runtime, defaults, Arc::new(PooledConnector))
    }

    /// Cache whose clients read settings from the process environment.
    pub fn from_env() -> Self {
        Self::new(Arc::new(RealRuntime), Defaults::default())
    }

    pub fn with_connector(
        runtime: Arc<dyn Runtime>,
        defaults: Defaults,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            runtime,
            defaults,
            connector,
            sync_clients: DashMap::new(),
            async_clients: DashMap::new(),
        }
    }

    /// Derives the key for `kind` and `params`.
    ///
    /// Absent params map to the bare prefix; supplied params, even empty,
    /// add a `:` separator so they never collide with the default entry.
    pub fn cache_key(kind: ClientKind, params: Option<&ClientParams>) -> String {
        match params {
            None => kind.prefix().to_string(),
            Some(params) => format!("{}:{}", kind.prefix(), params.key_fragment()),
        }
    }

    /// Returns the cached client for `kind`, building it on first use.
    pub fn get(&self, kind: ClientKind, params: Option<&ClientParams>) -> CachedClient {
        match kind {
            ClientKind::Sync => CachedClient::Sync(self.get_client(params)),
            ClientKind::Async => CachedClient::Async(self.get_async_client(params)),
        }
    }

    /// Returns the cached blocking client for `params`.
    pub fn get_client(&self, params: Option<&ClientParams>) -> Arc<HttpClient> {
        let key = Self::cache_key(ClientKind::Sync, params);
        match self.sync_clients.entry(key) {
            Entry::Occupied(entry) => {
                debug!("Client cache hit: {}", entry.key());
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                debug!("Client cache miss: {}", entry.key());
                let config = self.config_for(params);
                let client = Arc::new(HttpClient::with_connector(&config, self.connector.as_ref()));
                entry.insert(Arc::clone(&client));
                client
            }
        }
    }

    /// Returns the cached asynchronous client for `params`.
    pub fn get_async_client(&self, params: Option<&ClientParams>) -> Arc<AsyncHttpClient> {
        let key = Self::cache_key(ClientKind::Async, params);
        match self.async_clients.entry(key) {
            Entry::Occupied(entry) => {
                debug!("Client cache hit: {}", entry.key());
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                debug!("Client cache miss: {}", entry.key());
                let config = self.config_for(params);
                let client = Arc::new(AsyncHttpClient::with_connector(
                    config,
                    Arc::clone(&self.connector),
                ));
                entry.insert(Arc::clone(&client));
                client
            }
        }
    }

    pub fn contains(&self, kind: ClientKind, params: Option<&ClientParams>) -> bool {
        let key = Self::cache_key(kind, params);
        match kind {
            ClientKind::Sync => self.sync_clients.contains_key(&key),
            ClientKind::Async => self.async_clients.contains_key(&key),
        }
    }

    pub fn len(&self) -> usize {
        self.sync_clients.len() + self.async_clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn config_for(&self, params: Option<&ClientParams>) -> ClientConfig {
        let settings = Settings::resolve(self.runtime.as_ref(), &self.defaults);
        match params {
            Some(params) => ClientConfig::from_params(&settings, params),
            None => ClientConfig::new(
                &settings,
                Some(CACHED_CLIENT_TIMEOUT),
                DEFAULT_CONCURRENT_LIMIT,
            ),
        }
    }
}

//! Proxy routing derived from `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY` style settings.
//!
//! Routing is only installed when both an HTTP and an HTTPS proxy are given.
//! A single proxy on its own leaves every request on a direct connection.
//! `NO_PROXY` entries are added as direct-connect overrides that win over the
//! scheme-level routes for the hosts they name. Host matching itself is left
//! to reqwest's [`NoProxy`].

use log::debug;
use reqwest::{NoProxy, Proxy};

/// Routing decision for a URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Send matching requests through the proxy at this URL.
    Proxy(String),
    /// Connect to matching hosts directly.
    Direct,
}

/// Ordered table of URL patterns to routing decisions.
///
/// Patterns are scheme prefixes (`"http://"`, `"https://"`), URL prefixes
/// with a host (`"http://10.0.0.1"`, `"all://localhost"`), or bare host
/// entries in `NO_PROXY` syntax (`"internal.example.com"`, `".example.com"`,
/// `"192.168.0.0/16"`, `"*"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRules {
    routes: Vec<(String, Route)>,
}

impl ProxyRules {
    /// Derive routing rules from proxy settings.
    ///
    /// Returns `None` unless both `http_proxy` and `https_proxy` are present.
    /// No URL is validated here; a malformed proxy surfaces on the first request.
    pub fn resolve(
        http_proxy: Option<&str>,
        https_proxy: Option<&str>,
        no_proxy: Option<&str>,
    ) -> Option<Self> {
        let (Some(http_proxy), Some(https_proxy)) = (http_proxy, https_proxy) else {
            if http_proxy.is_some() || https_proxy.is_some() {
                debug!("Only one of HTTP_PROXY/HTTPS_PROXY is set, proxy routing disabled");
            }
            return None;
        };

        let mut rules = Self::default();
        rules.set("http://", Route::Proxy(http_proxy.to_string()));
        rules.set("https://", Route::Proxy(https_proxy.to_string()));

        if let Some(no_proxy) = no_proxy {
            for entry in no_proxy.split(',').map(str::trim) {
                if entry.is_empty() {
                    continue;
                }
                rules.set(entry, Route::Direct);
            }
        }

        debug!("Proxy routing installed with {} rules", rules.routes.len());
        Some(rules)
    }

    /// Insert a route, replacing an existing route for the same pattern in place.
    pub fn set(&mut self, pattern: impl Into<String>, route: Route) {
        let pattern = pattern.into();
        match self.routes.iter_mut().find(|(p, _)| *p == pattern) {
            Some(existing) => existing.1 = route,
            None => self.routes.push((pattern, route)),
        }
    }

    /// Returns the route registered for exactly this pattern.
    pub fn get(&self, pattern: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|(p, _)| p == pattern)
            .map(|(_, route)| route)
    }

    /// Every proxy URL referenced by the table.
    pub fn proxy_urls(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().filter_map(|(_, route)| match route {
            Route::Proxy(url) => Some(url.as_str()),
            Route::Direct => None,
        })
    }

    pub fn routes(&self) -> &[(String, Route)] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Proxy URL for requests with this scheme, `None` when they go direct.
    pub fn proxy_for_scheme(&self, scheme: &str) -> Option<&str> {
        match self.get(&format!("{scheme}://")) {
            Some(Route::Proxy(url)) => Some(url),
            _ => None,
        }
    }

    /// Hosts that bypass the proxy for `scheme`, in `NO_PROXY` syntax.
    ///
    /// Bare entries apply to every scheme; `http://host` style entries only
    /// to their own scheme (`all://` to both). Ports are dropped because
    /// [`NoProxy`] matches on host alone.
    pub fn bypass_hosts(&self, scheme: &str) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, route)| *route == Route::Direct)
            .filter_map(|(pattern, _)| bypass_host(pattern, scheme))
            .collect()
    }

    /// One reqwest proxy per proxied scheme, each carrying its bypass list.
    pub fn to_proxies(&self) -> reqwest::Result<Vec<Proxy>> {
        let mut proxies = Vec::with_capacity(2);
        if let Some(url) = self.proxy_for_scheme("http") {
            proxies.push(Proxy::http(url)?.no_proxy(self.no_proxy("http")));
        }
        if let Some(url) = self.proxy_for_scheme("https") {
            proxies.push(Proxy::https(url)?.no_proxy(self.no_proxy("https")));
        }
        Ok(proxies)
    }

    fn no_proxy(&self, scheme: &str) -> Option<NoProxy> {
        let hosts = self.bypass_hosts(scheme);
        if hosts.is_empty() {
            return None;
        }
        NoProxy::from_string(&hosts.join(","))
    }
}

/// Host part of a direct entry when it applies to `scheme`.
fn bypass_host(pattern: &str, scheme: &str) -> Option<String> {
    let host = match pattern.split_once("://") {
        Some((entry_scheme, rest)) => {
            if entry_scheme != "all" && !entry_scheme.eq_ignore_ascii_case(scheme) {
                return None;
            }
            rest.split('/').next().unwrap_or_default()
        }
        None => pattern,
    };
    // Scheme-only entries replace the scheme route itself
    if host.is_empty() {
        return None;
    }
    let host = strip_port(host);
    let host = match host.strip_prefix('*') {
        Some(domain) if domain.starts_with('.') => domain,
        _ => host,
    };
    Some(host.to_string())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(ip, _)| ip);
    }
    match host.split_once(':') {
        // A second colon means a bare IPv6 literal
        Some((name, port)) if !port.contains(':') => name,
        _ => host,
    }
}

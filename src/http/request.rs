//! Outbound request description, independent of the transport that sends it.

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

/// Non-JSON request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` fields.
    Form(Vec<(String, String)>),
    /// Raw text sent as-is.
    Text(String),
}

/// A fully described request ready to hand to a transport.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Takes precedence over `json` when both are set.
    pub body: Option<RequestBody>,
    pub json: Option<Value>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            json: None,
        }
    }

    pub fn get(url: &str, params: &[(&str, &str)], headers: Option<&HeaderMap>) -> Self {
        let mut request = Self::new(Method::GET, url);
        request.params = owned_pairs(params);
        if let Some(headers) = headers {
            request.headers = headers.clone();
        }
        request
    }

    pub fn post(url: &str, post: &PostRequest) -> Self {
        Self {
            method: Method::POST,
            url: url.to_string(),
            params: post.params.clone(),
            headers: post.headers.clone(),
            body: post.data.clone(),
            json: post.json.clone(),
        }
    }
}

/// Options for a POST: payload, query, headers and whether to stream the response.
#[derive(Debug, Clone, Default)]
pub struct PostRequest {
    pub data: Option<RequestBody>,
    pub json: Option<Value>,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Return the response with its body unread instead of buffering it.
    pub stream: bool,
}

impl PostRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, value: Value) -> Self {
        self.json = Some(value);
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.data = Some(RequestBody::Form(owned_pairs(fields)));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.data = Some(RequestBody::Text(text.into()));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

fn owned_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

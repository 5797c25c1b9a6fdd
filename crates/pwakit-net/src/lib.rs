//! # PwaKit Net
//!
//! Request/response model and network access for the PwaKit offline worker.
//!
//! ## Design Goals
//!
//! 1. **Owned snapshots**: a response body is a single-consumption stream until
//!    it is buffered; only buffered responses can be duplicated
//! 2. **Pluggable network**: the worker talks to a [`Network`] trait object, so
//!    tests and hosts can substitute the transport
//! 3. **Response typing**: every response is classified as basic, CORS, or
//!    opaque relative to the served origin
//! 4. **Routing**: [`RequestRouter`] decides which requests bypass the store

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use pwakit_common::PwaKitError;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod intercept;
pub mod loader;

pub use intercept::{InterceptRule, RequestRouter, Route, UrlPattern};
pub use loader::{HttpNetwork, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Response body already consumed")]
    BodyConsumed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for PwaKitError {
    fn from(err: NetError) -> Self {
        PwaKitError::network_with_source("fetch failed", err)
    }
}

/// Request mode, as seen by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin subresource.
    #[default]
    SameOrigin,
    /// Cross-origin without CORS; yields opaque responses.
    NoCors,
    /// Cross-origin with CORS.
    Cors,
}

/// HTTP cache mode for the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Let intermediaries answer.
    #[default]
    Default,
    /// Always revalidate with the origin server.
    NoCache,
}

/// An intercepted or outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub cache: CacheMode,
    pub headers: HeaderMap,
}

impl Request {
    /// Create a GET request for a subresource.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            mode: RequestMode::SameOrigin,
            cache: CacheMode::Default,
            headers: HeaderMap::new(),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cache mode.
    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this request loads a top-level document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response type, relative to the served origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Same-origin, fully readable.
    Basic,
    /// Cross-origin, CORS-approved.
    Cors,
    /// Cross-origin without CORS; contents hidden.
    Opaque,
    /// Redirect captured without following.
    OpaqueRedirect,
    /// Network error placeholder.
    Error,
}

impl ResponseType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::OpaqueRedirect => "opaqueredirect",
            ResponseType::Error => "error",
        }
    }

    /// Parse a name produced by [`ResponseType::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "opaqueredirect" => Some(ResponseType::OpaqueRedirect),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body; can be read exactly once.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

/// A response, either from the network or reconstructed from the store.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: ResponseBody,
}

impl Response {
    /// Create an empty basic response.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: ResponseBody::Empty,
        }
    }

    /// Create a response whose body arrives over a channel.
    pub fn streaming(
        url: Url,
        status: StatusCode,
        body: mpsc::Receiver<Result<Bytes, NetError>>,
    ) -> Self {
        Self {
            body: ResponseBody::Stream(body),
            ..Self::new(url, status)
        }
    }

    /// Set a buffered body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark as the result of a redirect chain.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if the status is successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Successful and same-origin: the only responses worth storing.
    pub fn is_cacheable(&self) -> bool {
        self.ok() && self.response_type == ResponseType::Basic
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Whether the body is held in memory.
    pub fn is_buffered(&self) -> bool {
        !matches!(self.body, ResponseBody::Stream(_))
    }

    /// Buffered body bytes, if the body is not a stream.
    pub fn body(&self) -> Option<Bytes> {
        match &self.body {
            ResponseBody::Full(bytes) => Some(bytes.clone()),
            ResponseBody::Empty => Some(Bytes::new()),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Drain a streaming body into memory, producing an owned snapshot.
    pub async fn buffered(mut self) -> Result<Self, NetError> {
        if let ResponseBody::Stream(mut rx) = self.body {
            let mut body = Vec::new();
            while let Some(chunk) = rx.recv().await {
                body.extend_from_slice(&chunk?);
            }
            self.body = ResponseBody::Full(Bytes::from(body));
        }
        Ok(self)
    }

    /// Duplicate a buffered response. Streams cannot be duplicated.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            ResponseBody::Full(bytes) => ResponseBody::Full(bytes.clone()),
            ResponseBody::Empty => ResponseBody::Empty,
            ResponseBody::Stream(_) => return None,
        };
        Some(Self {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            redirected: self.redirected,
            body,
        })
    }

    /// Consume the response and return its body.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        match self.buffered().await?.body {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Stream(_) => Err(NetError::BodyConsumed),
        }
    }

    /// Consume the response and return its body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Transport used by the worker to reach the origin.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request. `Err` means no response was obtained at all.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://shop.example/").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("/logo.png"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("image/png"),
            )
            .cache(CacheMode::NoCache);

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.cache, CacheMode::NoCache);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
        assert!(Request::navigate(url("/")).is_navigation());
    }

    #[test]
    fn test_cacheability() {
        let ok = Response::new(url("/a.js"), StatusCode::OK);
        assert!(ok.is_cacheable());

        let missing = Response::new(url("/a.js"), StatusCode::NOT_FOUND);
        assert!(!missing.is_cacheable());

        let opaque = Response::new(url("/a.js"), StatusCode::OK).with_type(ResponseType::Opaque);
        assert!(!opaque.is_cacheable());

        let cors = Response::new(url("/a.js"), StatusCode::OK).with_type(ResponseType::Cors);
        assert!(!cors.is_cacheable());
    }

    #[test]
    fn test_content_type() {
        let response = Response::new(url("/"), StatusCode::OK).with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert_eq!(response.content_type().unwrap().subtype(), mime::HTML);
    }

    #[test]
    fn test_response_type_names() {
        for ty in [
            ResponseType::Basic,
            ResponseType::Cors,
            ResponseType::Opaque,
            ResponseType::OpaqueRedirect,
            ResponseType::Error,
        ] {
            assert_eq!(ResponseType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ResponseType::parse("weird"), None);
    }

    #[tokio::test]
    async fn test_stream_cannot_be_cloned_until_buffered() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"<html>"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"</html>"))).await.unwrap();
        drop(tx);

        let response = Response::streaming(url("/"), StatusCode::OK, rx);
        assert!(!response.is_buffered());
        assert!(response.try_clone().is_none());

        let response = response.buffered().await.unwrap();
        let copy = response.try_clone().unwrap();
        assert_eq!(copy.text().await.unwrap(), "<html></html>");
        assert_eq!(response.text().await.unwrap(), "<html></html>");
    }

    #[tokio::test]
    async fn test_stream_error_surfaces_on_buffer() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Err(NetError::RequestFailed("reset".into())))
            .await
            .unwrap();
        drop(tx);

        let response = Response::streaming(url("/big.bin"), StatusCode::OK, rx);
        assert!(response.buffered().await.is_err());
    }
}

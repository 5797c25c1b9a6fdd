//! reqwest-backed [`Network`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{CacheMode, NetError, Network, Request, RequestMode, Response, ResponseType};

/// Buffered chunks between the transport task and the response reader.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// HTTP loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("PwaKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Network access over HTTP for a single served origin.
pub struct HttpNetwork {
    client: Client,
    origin: Url,
    config: LoaderConfig,
}

impl HttpNetwork {
    /// Create a network for `origin`.
    pub fn new(origin: Url, config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %origin, "HttpNetwork initialized");

        Ok(Self {
            client,
            origin,
            config,
        })
    }

    /// The origin responses are classified against.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Classify a response by where the request ended up.
    pub fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if request.cache == CacheMode::NoCache {
            builder = builder
                .header(http::header::CACHE_CONTROL, "no-cache")
                .header(http::header::PRAGMA, "no-cache");
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.default_timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;
        let response_type = self.classify(request, &final_url);

        trace!(
            url = %final_url,
            status = %status,
            response_type = response_type.as_str(),
            redirected,
            "Response headers received"
        );

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk.map_err(NetError::HttpError)).await.is_err() {
                    // Reader dropped the response.
                    break;
                }
                if failed {
                    warn!("Response body stream failed");
                    break;
                }
            }
        });

        let mut out = Response::streaming(final_url, status, rx)
            .with_type(response_type)
            .with_redirected(redirected);
        out.headers = headers;
        Ok(out)
    }
}

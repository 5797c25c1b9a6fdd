//! In-memory origin for tests, built with the `test-util` feature.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use pwakit_net::{NetError, Network, Request, RequestMode, Response, ResponseType};
use tracing::trace;
use url::Url;

#[derive(Debug, Clone)]
enum Scripted {
    Respond {
        status: StatusCode,
        body: Bytes,
        response_type: Option<ResponseType>,
    },
    Fail,
}

/// A scripted origin: every path answers with what it was told to.
///
/// Unknown paths answer 404. Going offline makes every request fail.
#[derive(Debug)]
pub struct MemoryNetwork {
    origin: Url,
    routes: Mutex<HashMap<String, Scripted>>,
    hits: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryNetwork {
    /// Create an origin with no routes.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Scripted>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hits(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `path` with 200 and `body`.
    pub fn serve(&self, path: &str, body: impl Into<Bytes>) {
        self.routes().insert(
            path.to_string(),
            Scripted::Respond {
                status: StatusCode::OK,
                body: body.into(),
                response_type: None,
            },
        );
    }

    /// Answer `path` with an empty body and `status`.
    pub fn serve_status(&self, path: &str, status: StatusCode) {
        self.routes().insert(
            path.to_string(),
            Scripted::Respond {
                status,
                body: Bytes::new(),
                response_type: None,
            },
        );
    }

    /// Answer `path` with a fixed response type (e.g. opaque).
    pub fn serve_typed(&self, path: &str, body: impl Into<Bytes>, response_type: ResponseType) {
        self.routes().insert(
            path.to_string(),
            Scripted::Respond {
                status: StatusCode::OK,
                body: body.into(),
                response_type: Some(response_type),
            },
        );
    }

    /// Make `path` fail at the transport level.
    pub fn fail(&self, path: &str) {
        self.routes().insert(path.to_string(), Scripted::Fail);
    }

    /// Toggle connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Requests seen for `path`, including failed ones.
    pub fn requests_for(&self, path: &str) -> usize {
        self.hits().get(path).copied().unwrap_or(0)
    }

    /// Requests seen in total.
    pub fn total_requests(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.hits().entry(path.clone()).or_insert(0) += 1;
        trace!(url = %request.url, "MemoryNetwork fetch");

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }

        let scripted = self.routes().get(&path).cloned();
        let default_type = if request.url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        };

        match scripted {
            Some(Scripted::Fail) => Err(NetError::RequestFailed(format!("{path} unreachable"))),
            Some(Scripted::Respond {
                status,
                body,
                response_type,
            }) => Ok(Response::new(request.url.clone(), status)
                .with_type(response_type.unwrap_or(default_type))
                .with_body(body)),
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND).with_type(default_type)),
        }
    }
}

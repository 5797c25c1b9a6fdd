//! # PwaKit Service Worker
//!
//! Offline worker for a single-origin web application.
//!
//! ## Features
//!
//! - **Cache storage**: named, versioned generations of request → response entries
//! - **Lifecycle**: install (precache) → activate (sweep, claim) as an explicit state machine
//! - **Fetch interception**: bypass, serve-from-store, network-then-populate, offline fallback
//! - **Clients**: open pages and the generation controlling each
//! - **Container**: per-origin registration host that rolls out new generations
//!
//! The `test-util` feature adds [`MemoryNetwork`], a scripted in-process
//! origin for exercising workers without sockets.
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per origin)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │               ├── LifecycleController
//!     │               └── FetchGateway
//!     │
//!     ├── Clients
//!     │
//!     └── CacheStorage
//!             └── Cache (generation)
//!                     └── RequestKey → CacheEntry
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod fetch;
pub mod lifecycle;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod registration;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey};
pub use clients::{Client, ClientId, ClientType, Clients, Controller};
pub use container::{
    NetworkScriptSource, ServiceWorkerContainer, ServiceWorkerEvent, UpdateOutcome,
    WorkerScriptSource,
};
pub use fetch::{FetchGateway, FetchResponse, ResponseSource};
pub use lifecycle::{Effect, LifecycleController, LifecycleInput, WorkerState};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryNetwork;
pub use registration::{RegistrationOptions, ServiceWorkerRegistration, UpdateViaCache};
pub use worker::{ServiceWorker, WorkerId};

use pwakit_common::PwaKitError;
use pwakit_net::NetError;

// ==================== Errors ====================

/// Errors from the resource store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Precache of {url} failed: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Generation {0} was deleted")]
    GenerationDeleted(String),

    #[error("Response body is still streaming")]
    NotBuffered,

    #[error("Invalid stored entry: {0}")]
    InvalidEntry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Errors from the lifecycle state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{input} is not valid while {state:?}")]
    InvalidTransition {
        state: WorkerState,
        input: &'static str,
    },
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Worker is not active (state {0:?})")]
    NotActive(WorkerState),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for PwaKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::RegistrationFailed(_) | ServiceWorkerError::SecurityError(_) => {
                PwaKitError::registration_with_source("worker registration rejected", err)
            }
            ServiceWorkerError::Cache(_) => PwaKitError::cache(err.to_string()),
            ServiceWorkerError::NotFound(what) => PwaKitError::NotFound(what),
            other => PwaKitError::lifecycle(other.to_string()),
        }
    }
}

//! # PwaKit Page
//!
//! The page half of offline delivery. Pages never touch the resource store;
//! they only register the worker, watch its lifecycle, and decide when to
//! reload.
//!
//! ## Features
//!
//! - **Update coordination**: register with script revalidation, poll for new
//!   generations, reload once a new generation is ready to replace the current one
//! - **Install prompt**: defer the platform's install offer until the user asks

use thiserror::Error;

pub mod prompt;
pub mod update;

pub use prompt::{
    BeforeInstallPromptEvent, DisplayMode, InstallPrompt, InstallPromptBroker, PromptOutcome,
    PromptState,
};
pub use update::{should_reload, CoordinatorStatus, Registrar, Reloader, UpdateCoordinator};

use pwakit_common::PwaKitError;

/// Errors surfaced by the platform's install dialog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Install dialog failed: {0}")]
    Platform(String),

    #[error("Install opportunity expired")]
    Expired,
}

impl From<PromptError> for PwaKitError {
    fn from(err: PromptError) -> Self {
        PwaKitError::internal(err.to_string())
    }
}

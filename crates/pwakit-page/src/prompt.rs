//! Install prompt: hold the platform's install offer until the user asks.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::PromptError;

/// How the application is currently displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// A regular browser tab.
    #[default]
    Browser,
    /// Installed and running standalone.
    Standalone,
}

/// Where the install offer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptState {
    /// Nothing to offer.
    #[default]
    None,
    /// An install offer is held and can be triggered.
    Available,
    /// The user answered the last offer; nothing can be triggered until the
    /// platform offers again. Rendered like [`PromptState::None`].
    Consumed,
}

/// The user's answer to the install dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Accepted,
    Dismissed,
}

/// The platform's install dialog.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
    /// Show the dialog and wait for the user's choice.
    async fn prompt(&self) -> Result<PromptOutcome, PromptError>;
}

/// The platform's install offer.
pub struct BeforeInstallPromptEvent {
    prompt: Box<dyn InstallPrompt>,
    default_prevented: bool,
}

impl BeforeInstallPromptEvent {
    /// Wrap the platform dialog behind an offer.
    pub fn new(prompt: Box<dyn InstallPrompt>) -> Self {
        Self {
            prompt,
            default_prevented: false,
        }
    }

    /// Suppress the platform's own automatic prompt.
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    /// Whether the automatic prompt was suppressed.
    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }
}

#[derive(Default)]
struct BrokerState {
    deferred: Option<Box<dyn InstallPrompt>>,
    consumed: bool,
    display_mode: DisplayMode,
}

impl BrokerState {
    fn offer_state(&self) -> PromptState {
        match (&self.deferred, self.consumed) {
            (Some(_), _) => PromptState::Available,
            (None, true) => PromptState::Consumed,
            (None, false) => PromptState::None,
        }
    }
}

/// Defers the install offer and surfaces it on demand. Each offer is used at
/// most once.
#[derive(Default)]
pub struct InstallPromptBroker {
    state: Mutex<BrokerState>,
}

impl InstallPromptBroker {
    /// Create a broker for a page shown in `display_mode`.
    pub fn new(display_mode: DisplayMode) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                deferred: None,
                consumed: false,
                display_mode,
            }),
        }
    }

    /// Record a change of display mode reported by the runtime.
    pub async fn set_display_mode(&self, display_mode: DisplayMode) {
        self.state.lock().await.display_mode = display_mode;
    }

    /// Take the platform's offer, suppressing its automatic prompt. Returns
    /// whether the default was prevented. A newer offer replaces an older one.
    pub async fn on_before_install_prompt(&self, mut event: BeforeInstallPromptEvent) -> bool {
        event.prevent_default();
        let prevented = event.default_prevented();

        let mut state = self.state.lock().await;
        state.consumed = false;
        if state.deferred.replace(event.prompt).is_some() {
            debug!("Replaced earlier install offer");
        }
        debug!(display_mode = ?state.display_mode, "Install offer deferred");
        prevented
    }

    /// Lifecycle of the current offer.
    pub async fn state(&self) -> PromptState {
        self.state.lock().await.offer_state()
    }

    /// What the page should show: `Available` or `None`. Always `None` when
    /// standalone.
    pub async fn visible_state(&self) -> PromptState {
        let state = self.state.lock().await;
        match (state.offer_state(), state.display_mode) {
            (PromptState::Available, DisplayMode::Browser) => PromptState::Available,
            _ => PromptState::None,
        }
    }

    /// Show the install dialog for the held offer.
    ///
    /// Returns `Ok(None)` when there is nothing to prompt. The offer is
    /// discarded whatever the outcome.
    pub async fn prompt(&self) -> Result<Option<PromptOutcome>, PromptError> {
        let prompt = {
            let mut state = self.state.lock().await;
            if state.display_mode == DisplayMode::Standalone {
                return Ok(None);
            }
            match state.deferred.take() {
                Some(prompt) => {
                    state.consumed = true;
                    prompt
                }
                None => return Ok(None),
            }
        };

        let outcome = prompt.prompt().await?;
        info!(?outcome, "Install prompt answered");
        Ok(Some(outcome))
    }

    /// The application was installed; any held offer is stale.
    pub async fn on_app_installed(&self) {
        let mut state = self.state.lock().await;
        state.consumed = false;
        if state.deferred.take().is_some() {
            debug!("Dropped install offer after installation");
        }
        info!("Application installed");
    }
}

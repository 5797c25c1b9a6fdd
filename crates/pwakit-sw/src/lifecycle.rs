//! Worker lifecycle as an explicit state machine.
//!
//! [`LifecycleController::handle`] is pure: it takes one input, moves to the
//! next state, and returns the effects the host must perform. The host feeds
//! the result of each effect back in as the next input:
//!
//! ```text
//! Parsed ──Install──▶ Installing ──PrecacheSucceeded──▶ Installed
//!                         │                                 │
//!                  PrecacheFailed                      SkipWaiting
//!                         ▼                                 ▼
//!                     Redundant ◀──Superseded── Activated ◀─ Activating
//!                                                   (StaleGenerationsDeleted,
//!                                                    then ClientsClaimed)
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::LifecycleError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Script evaluated, install not started.
    #[default]
    Parsed,
    /// Precaching the asset manifest.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Sweeping stale generations and claiming clients.
    Activating,
    /// Serving requests.
    Activated,
    /// Install failed, superseded, or unregistered.
    Redundant,
}

/// Inbound lifecycle messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleInput {
    Install,
    PrecacheSucceeded,
    PrecacheFailed { reason: String },
    SkipWaiting,
    StaleGenerationsDeleted,
    ClientsClaimed,
    Superseded,
    Unregister,
}

impl LifecycleInput {
    fn name(&self) -> &'static str {
        match self {
            LifecycleInput::Install => "Install",
            LifecycleInput::PrecacheSucceeded => "PrecacheSucceeded",
            LifecycleInput::PrecacheFailed { .. } => "PrecacheFailed",
            LifecycleInput::SkipWaiting => "SkipWaiting",
            LifecycleInput::StaleGenerationsDeleted => "StaleGenerationsDeleted",
            LifecycleInput::ClientsClaimed => "ClientsClaimed",
            LifecycleInput::Superseded => "Superseded",
            LifecycleInput::Unregister => "Unregister",
        }
    }
}

/// Work the host must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Populate `generation` with the asset manifest.
    Precache { generation: String },
    /// Throw away a generation that never became ready.
    DiscardGeneration { generation: String },
    /// Delete every generation except `current`.
    DeleteGenerationsExcept { current: String },
    /// Re-point all open clients at `generation`.
    ClaimClients { generation: String },
    /// The worker entered a new state.
    StateChanged(WorkerState),
}

/// Lifecycle of one worker generation.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    generation: String,
    state: WorkerState,
    stale_swept: bool,
    failure: Option<String>,
}

impl LifecycleController {
    /// Create a controller for `generation`.
    pub fn new(generation: impl Into<String>) -> Self {
        Self {
            generation: generation.into(),
            state: WorkerState::Parsed,
            stale_swept: false,
            failure: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Generation name.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Reason the install failed, if it did.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Apply one input.
    ///
    /// Rejected inputs leave the state untouched.
    pub fn handle(&mut self, input: LifecycleInput) -> Result<Vec<Effect>, LifecycleError> {
        use LifecycleInput as In;
        use WorkerState as S;

        let generation = self.generation.clone();
        let effects = match (self.state, &input) {
            (S::Parsed, In::Install) => {
                self.state = S::Installing;
                vec![
                    Effect::StateChanged(S::Installing),
                    Effect::Precache { generation },
                ]
            }
            (S::Installing, In::PrecacheSucceeded) => {
                self.state = S::Installed;
                vec![Effect::StateChanged(S::Installed)]
            }
            (S::Installing, In::PrecacheFailed { reason }) => {
                self.failure = Some(reason.clone());
                self.state = S::Redundant;
                vec![
                    Effect::DiscardGeneration { generation },
                    Effect::StateChanged(S::Redundant),
                ]
            }
            (S::Installed, In::SkipWaiting) => {
                self.state = S::Activating;
                vec![
                    Effect::StateChanged(S::Activating),
                    Effect::DeleteGenerationsExcept {
                        current: generation,
                    },
                ]
            }
            (S::Activating, In::StaleGenerationsDeleted) if !self.stale_swept => {
                self.stale_swept = true;
                vec![Effect::ClaimClients { generation }]
            }
            (S::Activating, In::ClientsClaimed) if self.stale_swept => {
                self.state = S::Activated;
                vec![Effect::StateChanged(S::Activated)]
            }
            (S::Installed | S::Activated, In::Superseded) => {
                self.state = S::Redundant;
                vec![Effect::StateChanged(S::Redundant)]
            }
            (state, In::Unregister) if state != S::Redundant => {
                self.state = S::Redundant;
                vec![Effect::StateChanged(S::Redundant)]
            }
            (state, _) => {
                return Err(LifecycleError::InvalidTransition {
                    state,
                    input: input.name(),
                })
            }
        };

        debug!(generation = %self.generation, input = input.name(), state = ?self.state, "Lifecycle transition");
        Ok(effects)
    }
}

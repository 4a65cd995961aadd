//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::SwError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Installing (critical asset preload).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (stale generation cleanup).
    Activating,
    /// Active and intercepting requests.
    Activated,
    /// Install failed.
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

/// Current worker state with checked transitions.
#[derive(Debug, Clone, Default)]
pub struct WorkerLifecycle {
    state: ServiceWorkerState,
}

impl WorkerLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    fn transition(
        &mut self,
        allowed_from: &[ServiceWorkerState],
        to: ServiceWorkerState,
    ) -> Result<(), SwError> {
        if !allowed_from.contains(&self.state) {
            return Err(SwError::State(format!(
                "cannot move from {} to {}",
                self.state.as_str(),
                to.as_str()
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Parsed or Redundant (a retry) → Installing.
    pub fn begin_install(&mut self) -> Result<(), SwError> {
        self.transition(
            &[ServiceWorkerState::Parsed, ServiceWorkerState::Redundant],
            ServiceWorkerState::Installing,
        )
    }

    /// Installing → Installed, or Redundant when the preload failed.
    pub fn finish_install(&mut self, succeeded: bool) -> Result<(), SwError> {
        let to = if succeeded {
            ServiceWorkerState::Installed
        } else {
            ServiceWorkerState::Redundant
        };
        self.transition(&[ServiceWorkerState::Installing], to)
    }

    /// Installed → Activating.
    pub fn begin_activate(&mut self) -> Result<(), SwError> {
        self.transition(&[ServiceWorkerState::Installed], ServiceWorkerState::Activating)
    }

    /// Activating → Activated.
    pub fn finish_activate(&mut self) -> Result<(), SwError> {
        self.transition(&[ServiceWorkerState::Activating], ServiceWorkerState::Activated)
    }

    /// Parsed → Activated for a worker whose generation is already on disk.
    pub fn resume(&mut self) -> Result<(), SwError> {
        self.transition(&[ServiceWorkerState::Parsed], ServiceWorkerState::Activated)
    }

    /// Parsed → Installed for a generation on disk that was never activated.
    pub fn adopt(&mut self) -> Result<(), SwError> {
        self.transition(&[ServiceWorkerState::Parsed], ServiceWorkerState::Installed)
    }
}

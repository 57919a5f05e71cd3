//! Authorization state machine
//!
//! The F1s only accepts privileged commands after the user presses the
//! central button. That press is only observable by polling the key-state
//! characteristic, so the state moves exclusively on explicit reads.
//!
//! ```text
//!   connect ──► Unauthorized ──(key state read = true)──► Authorized
//!                    ▲   │                                     │
//!                    │   └──(key state read = false)──┐        │
//!                    │                                 ▼        │
//!                    └──────────── reconnect ◄─────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::F1Error;
use crate::protocol::CharacteristicDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorizationState {
    Unauthorized,
    Authorized,
}

/// Per-link key-state tracker.
#[derive(Debug, Clone)]
pub struct KeyStateMachine {
    state: AuthorizationState,
    /// Value of the most recent live key-state read.
    last_observed: Option<bool>,
}

impl Default for KeyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStateMachine {
    /// Fresh links always start unauthorized.
    pub fn new() -> Self {
        Self {
            state: AuthorizationState::Unauthorized,
            last_observed: None,
        }
    }

    pub fn state(&self) -> AuthorizationState {
        self.state
    }

    pub fn is_authorized(&self) -> bool {
        self.state == AuthorizationState::Authorized
    }

    /// Last live observation, usable by silent checks. `None` until the
    /// first live read succeeds.
    pub fn cached(&self) -> Option<bool> {
        self.last_observed
    }

    /// Record a live key-state read. Authorization is sticky for the
    /// lifetime of the link.
    pub fn observe(&mut self, key_state: bool) -> AuthorizationState {
        self.last_observed = Some(key_state);
        if key_state && self.state == AuthorizationState::Unauthorized {
            log::info!("device authorized the connection (central button pressed)");
            self.state = AuthorizationState::Authorized;
        }
        self.state
    }

    /// Back to the initial state, for a new link.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Gate a command: privileged features need an authorized link unless
    /// the check is disabled.
    pub fn check(&self, descriptor: &CharacteristicDescriptor, enforce: bool) -> Result<(), F1Error> {
        if !descriptor.privileged {
            return Ok(());
        }
        if !enforce {
            log::debug!("skipping key state check for {} because it is disabled", descriptor.feature);
            return Ok(());
        }
        if self.is_authorized() {
            Ok(())
        } else {
            Err(F1Error::NotAuthorized)
        }
    }
}

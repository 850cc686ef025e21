//! Observable lifecycle state machine for provider subprocesses.
//!
//! A provider client moves through `Unstarted → Starting → Ready → Stopped`.
//! State lives in a `tokio::sync::watch` channel so callers waiting on a start
//! in progress are woken the moment it settles, without polling.
//!
//! # Example
//!
//! ```rust
//! use toolgate_common::lifecycle::{Lifecycle, ProviderState};
//!
//! let lifecycle = Lifecycle::new();
//! lifecycle.begin_start().unwrap();
//! lifecycle.mark_ready().unwrap();
//! assert!(lifecycle.is_ready());
//!
//! assert!(lifecycle.mark_stopped("shutdown"));
//! assert!(matches!(lifecycle.current(), ProviderState::Stopped { .. }));
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle states of a provider client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderState {
    /// Constructed, subprocess not launched yet
    Unstarted,
    /// Subprocess launched, waiting for it to become usable
    Starting,
    /// Accepting calls
    Ready,
    /// Terminal state; the subprocess is gone
    Stopped { reason: String },
}

impl ProviderState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProviderState::Ready)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ProviderState::Stopped { .. })
    }

    /// Short label for logs and status endpoints.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderState::Unstarted => "unstarted",
            ProviderState::Starting => "starting",
            ProviderState::Ready => "ready",
            ProviderState::Stopped { .. } => "stopped",
        }
    }
}

/// Rejected transition between two lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// Shared handle to a provider's lifecycle state.
#[derive(Clone)]
pub struct Lifecycle {
    sender: Arc<watch::Sender<ProviderState>>,
    // Keeps the channel open even when nobody is subscribed
    _receiver: watch::Receiver<ProviderState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(ProviderState::Unstarted);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    pub fn current(&self) -> ProviderState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProviderState> {
        self.sender.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.sender.borrow().is_ready()
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.borrow().is_stopped()
    }

    /// `Unstarted → Starting`. A client can only be started once.
    pub fn begin_start(&self) -> Result<(), TransitionError> {
        self.advance(ProviderState::Starting, |state| {
            matches!(state, ProviderState::Unstarted)
        })
    }

    /// `Starting → Ready`.
    pub fn mark_ready(&self) -> Result<(), TransitionError> {
        self.advance(ProviderState::Ready, |state| {
            matches!(state, ProviderState::Starting)
        })
    }

    /// Moves any non-stopped state to `Stopped`.
    ///
    /// Returns `false` when the machine was already stopped, so exactly one
    /// caller observes the transition.
    pub fn mark_stopped(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.sender.send_if_modified(|state| {
            if state.is_stopped() {
                false
            } else {
                *state = ProviderState::Stopped { reason };
                true
            }
        })
    }

    /// Waits until the state is `Ready` or `Stopped`.
    ///
    /// Returns the stop reason as the error when the client never became ready.
    pub async fn wait_until_settled(&self) -> Result<(), String> {
        let mut rx = self.sender.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    ProviderState::Ready => return Ok(()),
                    ProviderState::Stopped { reason } => return Err(reason.clone()),
                    ProviderState::Unstarted | ProviderState::Starting => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err("lifecycle dropped".to_string());
            }
        }
    }

    fn advance(
        &self,
        next: ProviderState,
        allowed_from: impl Fn(&ProviderState) -> bool,
    ) -> Result<(), TransitionError> {
        let to = next.label();
        let mut from = "";
        let moved = self.sender.send_if_modified(|state| {
            from = state.label();
            if allowed_from(state) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(TransitionError { from, to })
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &*self.sender.borrow())
            .finish()
    }
}

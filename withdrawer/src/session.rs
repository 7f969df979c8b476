//! Per-session state of the withdrawal flow.
//!
//! The state is held in a `watch` channel: every transition goes through
//! [`Session`], and observers (the CLI, the status endpoint) subscribe to
//! snapshots.

use crate::errors::WithdrawError;
use crate::types::ItemId;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Discovering,
    Ready { remaining: usize },
    /// A withdrawal owns the session and is re-checking its candidates.
    Verifying,
    Signing,
    Submitted { call_reference: String },
    Failed { reason: String },
}

impl SessionState {
    /// Whether a discovery or withdrawal sequence currently owns the session.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SessionState::Discovering | SessionState::Verifying | SessionState::Signing
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Discovering => write!(f, "discovering"),
            SessionState::Ready { remaining } => write!(f, "ready ({remaining} remaining)"),
            SessionState::Verifying => write!(f, "verifying"),
            SessionState::Signing => write!(f, "signing"),
            SessionState::Submitted { .. } => write!(f, "submitted"),
            SessionState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// Everything an observer of the session can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub state: SessionState,
    /// Candidates found by the last discovery.
    pub item_ids: Vec<ItemId>,
    /// The last message built for signing.
    pub message: Option<String>,
    /// Signature over `message`. Cleared whenever a new message is built.
    pub signature: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot {
            state: SessionState::Idle,
            item_ids: Vec::new(),
            message: None,
            signature: None,
        }
    }
}

pub struct Session {
    sender: watch::Sender<SessionSnapshot>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SessionSnapshot::default());
        Session { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.sender.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.sender.borrow().state.clone()
    }

    /// Applies `transition` atomically if `allowed` accepts the current state.
    fn transition(
        &self,
        operation: &'static str,
        allowed: impl Fn(&SessionState) -> bool,
        transition: impl FnOnce(&mut SessionSnapshot),
    ) -> Result<(), WithdrawError> {
        let mut rejected = None;
        self.sender.send_if_modified(|snapshot| {
            if allowed(&snapshot.state) {
                transition(snapshot);
                true
            } else {
                rejected = Some(snapshot.state.clone());
                false
            }
        });
        match rejected {
            Some(from) => Err(WithdrawError::InvalidTransition { operation, from }),
            None => Ok(()),
        }
    }

    /// `idle → discovering`. Acts as the re-entry guard for discovery.
    pub fn begin_discovery(&self) -> Result<(), WithdrawError> {
        self.transition(
            "start discovery",
            |state| *state == SessionState::Idle,
            |snapshot| {
                *snapshot = SessionSnapshot {
                    state: SessionState::Discovering,
                    ..SessionSnapshot::default()
                }
            },
        )
    }

    /// `discovering → ready`.
    pub fn finish_discovery(
        &self,
        item_ids: Vec<ItemId>,
        remaining: usize,
    ) -> Result<(), WithdrawError> {
        self.transition(
            "finish discovery",
            |state| *state == SessionState::Discovering,
            |snapshot| {
                snapshot.state = SessionState::Ready { remaining };
                snapshot.item_ids = item_ids;
            },
        )
    }

    /// `ready(n > 0) → verifying`, claiming the session for one withdrawal
    /// and returning its candidates. Any concurrent caller is refused.
    pub fn begin_withdrawal(&self) -> Result<Vec<ItemId>, WithdrawError> {
        let mut outcome = Err(WithdrawError::NothingToWithdraw);
        self.sender.send_if_modified(|snapshot| match snapshot.state {
            SessionState::Ready { remaining } if remaining > 0 && !snapshot.item_ids.is_empty() => {
                snapshot.state = SessionState::Verifying;
                outcome = Ok(snapshot.item_ids.clone());
                true
            }
            SessionState::Ready { .. } => false,
            ref other => {
                outcome = Err(WithdrawError::InvalidTransition {
                    operation: "withdraw",
                    from: other.clone(),
                });
                false
            }
        });
        outcome
    }

    /// `verifying → ready`, when re-verification leaves nothing to sign.
    pub fn finish_verification(&self, remaining: usize) -> Result<(), WithdrawError> {
        self.transition(
            "finish verification",
            |state| *state == SessionState::Verifying,
            |snapshot| snapshot.state = SessionState::Ready { remaining },
        )
    }

    /// `verifying → signing`, storing the message to be signed and dropping
    /// any signature over an older message.
    pub fn begin_signing(&self, message: String) -> Result<(), WithdrawError> {
        self.transition(
            "start signing",
            |state| *state == SessionState::Verifying,
            |snapshot| {
                snapshot.state = SessionState::Signing;
                snapshot.message = Some(message);
                snapshot.signature = None;
            },
        )
    }

    pub fn record_signature(&self, signature: String) -> Result<(), WithdrawError> {
        self.transition(
            "record signature",
            |state| *state == SessionState::Signing,
            |snapshot| snapshot.signature = Some(signature),
        )
    }

    /// `signing → submitted`.
    pub fn finish_submission(&self, call_reference: String) -> Result<(), WithdrawError> {
        self.transition(
            "finish submission",
            |state| *state == SessionState::Signing,
            |snapshot| snapshot.state = SessionState::Submitted { call_reference },
        )
    }

    /// Moves the in-flight sequence to `failed`. Returns `false` and leaves
    /// the session untouched when no sequence is in flight.
    pub fn fail(&self, reason: String) -> bool {
        self.sender.send_if_modified(|snapshot| {
            if !snapshot.state.is_in_flight() {
                return false;
            }
            snapshot.state = SessionState::Failed { reason };
            true
        })
    }

    /// Back to `idle`, e.g. after the wallet disconnects or to retry after a
    /// failure. Not allowed while a sequence is in flight.
    pub fn reset(&self) -> Result<(), WithdrawError> {
        self.transition(
            "reset",
            |state| !state.is_in_flight(),
            |snapshot| *snapshot = SessionSnapshot::default(),
        )
    }
}

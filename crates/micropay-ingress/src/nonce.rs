//! Per-session sender nonce tracking (ticket replay prevention).
//!
//! Nonces must strictly increase per `(session, sender)`. Gaps are fine:
//! the sender may skip nonces for tickets it never delivered. A nonce at or
//! below the highest one already accepted is a replay of an earlier ticket
//! body or a reordering the sender is not allowed to make.

use std::collections::HashMap;

use micropay_types::{Address, MicropayError, Result, SessionId};

/// Highest accepted nonce per `(session, sender)`.
#[derive(Debug, Default)]
pub struct SessionNonces {
    highest: HashMap<(SessionId, Address), u64>,
}

impl SessionNonces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a nonce without recording it.
    ///
    /// # Errors
    /// Returns [`MicropayError::InvalidTicket`] if `nonce` is not above the
    /// highest accepted nonce.
    pub fn check(&self, session_id: SessionId, sender: Address, nonce: u64) -> Result<()> {
        match self.highest.get(&(session_id, sender)) {
            Some(&highest) if nonce <= highest => Err(MicropayError::InvalidTicket {
                reason: format!("sender nonce {nonce} not above last accepted {highest}"),
            }),
            _ => Ok(()),
        }
    }

    /// Record an accepted nonce. Call only after [`check`](Self::check) passed.
    pub fn record(&mut self, session_id: SessionId, sender: Address, nonce: u64) {
        let entry = self.highest.entry((session_id, sender)).or_insert(nonce);
        *entry = (*entry).max(nonce);
    }

    /// Highest accepted nonce, if any.
    #[must_use]
    pub fn highest(&self, session_id: SessionId, sender: Address) -> Option<u64> {
        self.highest.get(&(session_id, sender)).copied()
    }

    /// Drop all nonces of a session (teardown).
    pub fn forget_session(&mut self, session_id: SessionId) {
        self.highest.retain(|(sid, _), _| *sid != session_id);
    }

    /// Number of `(session, sender)` pairs tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.highest.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.highest.is_empty()
    }
}

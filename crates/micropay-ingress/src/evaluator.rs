//! Winning-ticket evaluator.
//!
//! ```text
//! digest = SHA-256("micropay:win:v1:" || ticket_hash || recipient_rand)
//! winner  <=>  digest < win_prob        (both 256-bit big-endian)
//! ```
//!
//! The evaluation is pure and bit-exact: anyone holding the ticket and the
//! revealed secret reproduces the same digest and the same verdict. It must
//! only ever run after the secret is revealed; computing it earlier would
//! let the party holding the secret bias which tickets win.

use micropay_types::{RecipientRand, Ticket};
use sha2::{Digest, Sha256};

/// Domain tag for the winning digest.
const WIN_DOMAIN: &[u8] = b"micropay:win:v1:";

/// Result of evaluating one ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinEvaluation {
    /// The 256-bit big-endian digest compared against the threshold.
    pub digest: [u8; 32],
    /// Whether `digest < win_prob`.
    pub is_winner: bool,
}

/// The winning digest for a ticket and its revealed secret.
#[must_use]
pub fn winning_digest(ticket: &Ticket, recipient_rand: &RecipientRand) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(WIN_DOMAIN);
    hasher.update(ticket.hash().0);
    hasher.update(recipient_rand.as_bytes());
    hasher.finalize().into()
}

/// Evaluate a ticket, returning the digest alongside the verdict.
#[must_use]
pub fn evaluate(ticket: &Ticket, recipient_rand: &RecipientRand) -> WinEvaluation {
    let digest = winning_digest(ticket, recipient_rand);
    // Big-endian byte arrays order exactly like the integers they encode.
    let is_winner = digest < ticket.win_prob.0;
    WinEvaluation { digest, is_winner }
}

#[must_use]
pub fn is_winning(ticket: &Ticket, recipient_rand: &RecipientRand) -> bool {
    evaluate(ticket, recipient_rand).is_winner
}

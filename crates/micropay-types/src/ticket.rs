//! # Ticket — the probabilistic payment unit
//!
//! A sender issues many cheap tickets instead of one transaction per unit
//! of service. Each ticket wins with probability `win_prob`; only winners
//! are redeemed on the ledger.
//!
//! ## Commit / reveal
//!
//! ```text
//!   recipient                      sender
//!   ─────────                      ──────
//!   pick recipient_rand
//!   send H(recipient_rand) ──────▶ sign tickets carrying H(recipient_rand)
//!                                  (never sees recipient_rand)
//!   reveal recipient_rand at redemption
//!   winner iff H(ticket_hash ‖ recipient_rand) < win_prob
//! ```
//!
//! Neither party controls both inputs of the winning digest, so neither can
//! bias which tickets win.
//!
//! ## Canonical identity
//!
//! [`Ticket::hash`] is SHA-256 over a fixed binary payload, independent of
//! any serialization format. Re-serializing a ticket never changes its
//! identity.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Address, SessionId, TicketHash};

/// Domain tag for the ticket identity payload.
const TICKET_DOMAIN: &[u8] = b"micropay:ticket:v1:";

/// Domain tag for the recipient-rand commitment.
const RAND_DOMAIN: &[u8] = b"micropay:rand:v1:";

// ---------------------------------------------------------------------------
// WinProb
// ---------------------------------------------------------------------------

/// Winning probability as a 256-bit numerator over 2^256.
///
/// Stored big-endian so that numeric comparison equals byte comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WinProb(pub [u8; 32]);

impl WinProb {
    /// Probability zero: no digest is below the threshold.
    pub const NEVER: Self = Self([0u8; 32]);

    /// Largest representable probability, `(2^256 - 1) / 2^256`.
    pub const ALWAYS: Self = Self([0xff; 32]);

    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Probability `numerator / 2^64`, scaled into the 256-bit range.
    #[must_use]
    pub fn from_u64_fraction(numerator: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&numerator.to_be_bytes());
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for WinProb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// RecipientRand
// ---------------------------------------------------------------------------

/// Secret chosen by the recipient at session start and revealed only at
/// redemption. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRand(pub [u8; 32]);

impl RecipientRand {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The commitment carried in tickets as `recipient_rand_hash`.
    #[must_use]
    pub fn commitment(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(RAND_DOMAIN);
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

impl fmt::Debug for RecipientRand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecipientRand(<redacted>)")
    }
}

/// Random secret for tests. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl RecipientRand {
    pub fn random() -> Self {
        Self(rand::random::<[u8; 32]>())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Opaque signature bytes bound to exactly one [`TicketHash`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Signature {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// One probabilistic payment unit. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// The paying party.
    pub sender: Address,
    /// The receiving party.
    pub recipient: Address,
    /// Amount redeemable if the ticket wins.
    pub face_value: Decimal,
    /// Winning probability, fixed for the whole session.
    pub win_prob: WinProb,
    /// Strictly increasing per sender per session.
    pub sender_nonce: u64,
    /// Commitment to the recipient's secret.
    pub recipient_rand_hash: [u8; 32],
    /// Ledger round the ticket was created in.
    pub creation_round: u64,
    /// First round in which redemption must be rejected.
    pub expiration_round: u64,
}

impl Ticket {
    /// Canonical signing payload.
    ///
    /// Format: `"micropay:ticket:v1:" || sender || recipient || face_value
    /// (normalized mantissa i128 LE, scale u32 LE) || win_prob || sender_nonce
    /// || recipient_rand_hash || creation_round || expiration_round`
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let face_value = self.face_value.normalize();
        let mut payload = Vec::with_capacity(256);
        payload.extend_from_slice(TICKET_DOMAIN);
        payload.extend_from_slice(&self.sender.0);
        payload.extend_from_slice(&self.recipient.0);
        payload.extend_from_slice(&face_value.mantissa().to_le_bytes());
        payload.extend_from_slice(&face_value.scale().to_le_bytes());
        payload.extend_from_slice(&self.win_prob.0);
        payload.extend_from_slice(&self.sender_nonce.to_le_bytes());
        payload.extend_from_slice(&self.recipient_rand_hash);
        payload.extend_from_slice(&self.creation_round.to_le_bytes());
        payload.extend_from_slice(&self.expiration_round.to_le_bytes());
        payload
    }

    /// Canonical identity digest.
    #[must_use]
    pub fn hash(&self) -> TicketHash {
        TicketHash(Sha256::digest(self.signing_payload()).into())
    }

    /// Two tickets with the same key in one session are the same logical unit.
    #[must_use]
    pub fn logical_key(&self) -> (Address, u64) {
        (self.sender, self.sender_nonce)
    }

    /// Whether `recipient_rand` opens this ticket's commitment.
    #[must_use]
    pub fn commitment_matches(&self, recipient_rand: &RecipientRand) -> bool {
        recipient_rand.commitment() == self.recipient_rand_hash
    }
}

/// Dummy ticket for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Ticket {
    /// A ticket committing to `recipient_rand`, valid from round 10 to 20.
    pub fn dummy(
        sender: Address,
        recipient: Address,
        face_value: Decimal,
        win_prob: WinProb,
        sender_nonce: u64,
        recipient_rand: &RecipientRand,
    ) -> Self {
        Self {
            sender,
            recipient,
            face_value,
            win_prob,
            sender_nonce,
            recipient_rand_hash: recipient_rand.commitment(),
            creation_round: 10,
            expiration_round: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// StoredTicket
// ---------------------------------------------------------------------------

/// A winning ticket as persisted by the ticket store, with everything
/// needed to redeem it after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTicket {
    pub session_id: SessionId,
    pub ticket: Ticket,
    pub signature: Signature,
    pub recipient_rand: RecipientRand,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ticket() -> Ticket {
        Ticket::dummy(
            Address([1u8; 32]),
            Address([2u8; 32]),
            Decimal::new(100, 0),
            WinProb::from_u64_fraction(u64::MAX / 2),
            1,
            &RecipientRand([9u8; 32]),
        )
    }

    #[test]
    fn hash_deterministic() {
        let t = make_ticket();
        assert_eq!(t.hash(), t.hash());
        assert_eq!(t.hash(), t.clone().hash());
    }

    #[test]
    fn hash_differs_by_nonce() {
        let t1 = make_ticket();
        let mut t2 = t1.clone();
        t2.sender_nonce = 2;
        assert_ne!(t1.hash(), t2.hash());
    }

    #[test]
    fn hash_ignores_decimal_representation() {
        let t1 = make_ticket();
        let mut t2 = t1.clone();
        t2.face_value = Decimal::new(10000, 2); // 100.00
        assert_eq!(t1.hash(), t2.hash());
    }

    #[test]
    fn hash_stable_under_reserialization() {
        let t = make_ticket();
        let json = serde_json::to_string(&t).unwrap();
        let back: Ticket = serde_json::from_str(&json).unwrap();
        assert_eq!(t.hash(), back.hash());
    }

    #[test]
    fn commitment_opens_only_with_matching_secret() {
        let rand = RecipientRand([9u8; 32]);
        let t = make_ticket();
        assert!(t.commitment_matches(&rand));
        assert!(!t.commitment_matches(&RecipientRand([8u8; 32])));
    }

    #[test]
    fn recipient_rand_debug_is_redacted() {
        let rand = RecipientRand([0x42; 32]);
        let dbg = format!("{rand:?}");
        assert!(!dbg.contains("42"), "secret leaked: {dbg}");
    }

    #[test]
    fn win_prob_fraction_scaling() {
        let half = WinProb::from_u64_fraction(1 << 63);
        assert_eq!(half.0[0], 0x80);
        assert!(half.0[1..].iter().all(|b| *b == 0));
        assert!(WinProb::NEVER < half && half < WinProb::ALWAYS);
        assert!(WinProb::NEVER.is_zero());
    }

    #[test]
    fn logical_key_is_sender_and_nonce() {
        let t = make_ticket();
        assert_eq!(t.logical_key(), (Address([1u8; 32]), 1));
    }
}

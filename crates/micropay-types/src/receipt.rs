//! Signed receipts for the redemption audit trail.
//!
//! When the orchestrator runs with an account manager, every ticket it sees
//! redeemed produces a [`RedemptionReceipt`] signed by the recipient's key,
//! so an auditor can later match local records against the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Address, SessionId, Signature, TicketHash};

/// The terminal outcome this receipt proves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptType {
    /// The ledger accepted our redemption transaction.
    Redeemed,
    /// The ledger already held the ticket as redeemed.
    AlreadyRedeemed,
}

impl ReceiptType {
    fn code(self) -> u8 {
        match self {
            Self::Redeemed => 1,
            Self::AlreadyRedeemed => 2,
        }
    }
}

impl std::fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redeemed => write!(f, "REDEEMED"),
            Self::AlreadyRedeemed => write!(f, "ALREADY_REDEEMED"),
        }
    }
}

/// A signed receipt proving a ticket was redeemed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    /// What kind of outcome this receipt proves.
    pub receipt_type: ReceiptType,
    /// The session the ticket was paid in.
    pub session_id: SessionId,
    /// Identity of the redeemed ticket.
    pub ticket_hash: TicketHash,
    /// Face value at stake.
    pub face_value: Decimal,
    /// Ledger submissions made.
    pub attempts: u32,
    /// SHA-256 over the fields above and `issued_at`.
    pub payload_hash: [u8; 32],
    /// Signature over `payload_hash` from `issuer`.
    pub signature: Signature,
    /// The account that signed this receipt.
    pub issuer: Address,
    /// When this receipt was issued.
    pub issued_at: DateTime<Utc>,
}

impl RedemptionReceipt {
    /// Compute the payload hash for the given receipt fields.
    #[must_use]
    pub fn compute_payload_hash(
        receipt_type: ReceiptType,
        session_id: SessionId,
        ticket_hash: TicketHash,
        face_value: Decimal,
        attempts: u32,
        issued_at: DateTime<Utc>,
    ) -> [u8; 32] {
        let face_value = face_value.normalize();
        let mut hasher = Sha256::new();
        hasher.update(b"micropay:receipt:v1:");
        hasher.update([receipt_type.code()]);
        hasher.update(session_id.0.as_bytes());
        hasher.update(ticket_hash.0);
        hasher.update(face_value.mantissa().to_le_bytes());
        hasher.update(face_value.scale().to_le_bytes());
        hasher.update(attempts.to_le_bytes());
        hasher.update(issued_at.timestamp_millis().to_le_bytes());
        hasher.finalize().into()
    }

    /// The bytes that are signed: the payload hash.
    #[must_use]
    pub fn signing_bytes(&self) -> &[u8; 32] {
        &self.payload_hash
    }

    /// Whether `payload_hash` matches the receipt's fields.
    #[must_use]
    pub fn payload_hash_valid(&self) -> bool {
        self.payload_hash
            == Self::compute_payload_hash(
                self.receipt_type,
                self.session_id,
                self.ticket_hash,
                self.face_value,
                self.attempts,
                self.issued_at,
            )
    }
}

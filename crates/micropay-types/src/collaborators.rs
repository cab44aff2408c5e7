//! Capability traits for the systems the settlement core talks to.
//!
//! The core never owns ledger state, storage, or keys. It consumes them
//! through these small interfaces, each carrying exactly the operations it
//! needs. Calls that may block on I/O are `async`; cryptographic checks are
//! plain functions.
//!
//! The ledger is the system of record for deposits, escrow, used tickets
//! and approved signers. Anything the core caches from it is a performance
//! shortcut only.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    Address, BrokerError, RecipientRand, SessionId, Signature, SigningError, StoreError,
    StoredTicket, Ticket, ValidationError,
};

/// Durable log of winning tickets. Must be safe for concurrent calls
/// across sessions.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Durably record a winning ticket before it is redeemed.
    async fn store(
        &self,
        session_id: SessionId,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<(), StoreError>;

    /// All tickets stored for a session, in storage order.
    async fn load(&self, session_id: SessionId) -> Result<Vec<StoredTicket>, StoreError>;
}

/// Structural and cryptographic ticket checks. Stateless.
pub trait Validator: Send + Sync {
    /// Check signature, commitment and structure.
    fn validate_ticket(
        &self,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<(), ValidationError>;

    /// Whether the ticket won, given the revealed secret.
    fn is_winning_ticket(
        &self,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> bool;
}

/// Asymmetric signature verification primitive.
pub trait SigVerifier: Send + Sync {
    fn verify(&self, address: &Address, message: &[u8], signature: &Signature) -> bool;
}

/// The settlement ledger.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit a winning ticket. Atomic per call on the ledger side.
    async fn redeem_winning_ticket(
        &self,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<(), BrokerError>;

    /// Whether the ledger already holds this ticket as redeemed.
    async fn is_used_ticket(&self, ticket: &Ticket) -> Result<bool, BrokerError>;

    async fn get_deposit(&self, address: &Address) -> Result<Decimal, BrokerError>;

    async fn get_penalty_escrow(&self, address: &Address) -> Result<Decimal, BrokerError>;

    async fn is_approved_signer(
        &self,
        sender: &Address,
        signer: &Address,
    ) -> Result<bool, BrokerError>;
}

/// Local signing-key custody.
pub trait AccountManager: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Signature, SigningError>;

    fn account(&self) -> Address;
}

/// The ledger's round clock, used to bound a ticket's validity window.
pub trait RoundsManager: Send + Sync {
    fn last_initialized_round(&self) -> u64;
}

//! # micropay-settlement
//!
//! **Finality Plane**: durable recording and ledger redemption of winning
//! tickets.
//!
//! ## Architecture
//!
//! The [`TicketSettlementOrchestrator`] receives tickets per payment session
//! and:
//! 1. Admits them through the ingress plane (validation, nonces, exposure)
//! 2. Evaluates the lottery once the recipient secret is revealed
//! 3. Stores every winner before any redemption starts
//! 4. Hands winners to the [`RedemptionDispatcher`] (one FIFO lane per sender)
//! 5. Reconciles sender exposure with the outcome and signs receipts
//!
//! The [`ReplayGuard`] keeps a ticket from being submitted twice by one
//! process; the ledger's used-ticket set covers restarts, which
//! [`recovery`] relies on to replay the ticket store safely.

pub mod dispatcher;
pub mod orchestrator;
pub mod recovery;
pub mod replay_guard;

pub use dispatcher::{
    PendingRedemption, RedemptionAttempt, RedemptionDispatcher, RedemptionOutcome,
    RedemptionState,
};
pub use orchestrator::{Collaborators, ProcessOutcome, SessionParams, TicketSettlementOrchestrator};
pub use recovery::RecoveryReport;
pub use replay_guard::ReplayGuard;

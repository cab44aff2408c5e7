//! # micropay-types
//!
//! Shared types, errors, configuration and collaborator contracts for
//! **Micropay** probabilistic ticket settlement.
//!
//! This crate is the leaf dependency of the workspace — every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`Address`], [`SessionId`], [`TicketHash`]
//! - **Ticket model**: [`Ticket`], [`WinProb`], [`RecipientRand`], [`Signature`], [`StoredTicket`]
//! - **Receipt model**: [`RedemptionReceipt`], [`ReceiptType`]
//! - **Configuration**: [`SettlementConfig`], [`RetryPolicy`], [`ExposureConfig`]
//! - **Errors**: [`MicropayError`] with `MP_ERR_` prefix codes, plus collaborator errors
//! - **Collaborators**: [`TicketStore`], [`Validator`], [`SigVerifier`], [`Broker`],
//!   [`AccountManager`], [`RoundsManager`]
//! - **Constants**: system-wide limits and defaults
//!
//! With the `test-helpers` feature, [`testing`] provides stub collaborators.

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod receipt;
pub mod ticket;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

// Re-export all primary types at crate root for ergonomic imports:
//   use micropay_types::{Ticket, WinProb, Broker, MicropayError, ...};

pub use collaborators::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use receipt::*;
pub use ticket::*;

// Constants are accessed via `micropay_types::constants::FOO`
// (not re-exported to avoid name collisions).

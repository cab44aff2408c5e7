//! # micropay-ingress
//!
//! **Admission Plane**: everything that decides whether a ticket may enter
//! settlement, before any state is written.
//!
//! ## Architecture
//!
//! 1. **TicketValidator**: hard gate — signature, commitment, structure
//! 2. **SessionNonces**: per-session nonce monotonicity (replay of ticket bodies)
//! 3. **ExposureTracker**: per-sender admission control against deposit/escrow
//! 4. **evaluator**: pure winning-ticket evaluation after the secret is revealed
//!
//! ## Ticket Flow
//!
//! ```text
//! Orchestrator → TicketValidator.validate_ticket() → SessionNonces.check()
//!     → ExposureTracker.reserve() → evaluator::evaluate() → Finality Plane
//! ```
//!
//! Validation and evaluation are pure and never block; only the exposure
//! tracker touches the ledger.

pub mod evaluator;
pub mod exposure;
pub mod nonce;
pub mod validator;

pub use evaluator::{WinEvaluation, evaluate, is_winning};
pub use exposure::{ExposureTracker, SessionExposure};
pub use nonce::SessionNonces;
pub use validator::{Ed25519AccountManager, Ed25519SigVerifier, TicketValidator};

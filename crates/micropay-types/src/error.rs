//! Error types for Micropay ticket settlement.
//!
//! All errors use the `MP_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Ticket validation errors
//! - 2xx: Coverage / admission errors
//! - 3xx: Persistence errors
//! - 4xx: Redemption errors
//! - 5xx: Session errors
//! - 9xx: General / internal errors
//!
//! Collaborator-side errors ([`BrokerError`], [`StoreError`],
//! [`ValidationError`], [`SigningError`]) are separate types and are
//! converted into [`MicropayError`] at the orchestration boundary.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{Address, SessionId, TicketHash};

/// Central error enum for all Micropay operations.
#[derive(Debug, Error)]
pub enum MicropayError {
    // =================================================================
    // Ticket Errors (1xx)
    // =================================================================
    /// The ticket is definitively invalid: bad signature, bad commitment,
    /// nonce reuse, wrong parties or parameters.
    #[error("MP_ERR_100: Invalid ticket: {reason}")]
    InvalidTicket { reason: String },

    /// The ticket's creation round is outside the valid window.
    #[error(
        "MP_ERR_101: Stale ticket: created in round {creation_round}, expires at \
         {expiration_round}, current round {current_round}"
    )]
    StaleTicket {
        creation_round: u64,
        expiration_round: u64,
        current_round: u64,
    },

    // =================================================================
    // Coverage Errors (2xx)
    // =================================================================
    /// The sender cannot currently back this ticket.
    #[error("MP_ERR_200: Insufficient coverage for {sender}: need {needed}, available {available}")]
    InsufficientCoverage {
        sender: Address,
        needed: Decimal,
        available: Decimal,
    },

    /// Deposit or escrow could not be read from the ledger.
    #[error("MP_ERR_201: Ledger unavailable: {reason}")]
    LedgerUnavailable { reason: String },

    // =================================================================
    // Persistence Errors (3xx)
    // =================================================================
    /// A winning ticket could not be stored; it was not redeemed.
    #[error("MP_ERR_300: Persistence failure: {reason}")]
    PersistenceFailure { reason: String },

    /// Stored tickets could not be loaded for recovery.
    #[error("MP_ERR_301: Load failure: {reason}")]
    LoadFailure { reason: String },

    // =================================================================
    // Redemption Errors (4xx)
    // =================================================================
    /// Redemption kept failing transiently until the attempt bound.
    /// The ticket record stays in the store for later recovery.
    #[error("MP_ERR_400: Redemption gave up after {attempts} attempts: {reason}")]
    RedemptionTransient { attempts: u32, reason: String },

    /// The ledger rejected the redemption for good.
    #[error("MP_ERR_401: Redemption rejected: {reason}")]
    RedemptionPermanent { reason: String },

    /// The session was torn down while the redemption was retrying.
    #[error("MP_ERR_402: Redemption cancelled")]
    RedemptionCancelled,

    /// The ticket identity was already submitted in this process.
    #[error("MP_ERR_403: Ticket already submitted: {0}")]
    TicketAlreadySubmitted(TicketHash),

    // =================================================================
    // Session Errors (5xx)
    // =================================================================
    /// No open session with this ID.
    #[error("MP_ERR_500: Unknown session: {0}")]
    UnknownSession(SessionId),

    /// A session with this ID is already open.
    #[error("MP_ERR_501: Session already open: {0}")]
    DuplicateSession(SessionId),

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("MP_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("MP_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, bad values, etc.).
    #[error("MP_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl MicropayError {
    /// Whether the same ticket may succeed if submitted again later.
    ///
    /// Cryptographic and structural failures never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCoverage { .. }
                | Self::LedgerUnavailable { .. }
                | Self::RedemptionTransient { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, MicropayError>;

impl From<serde_json::Error> for MicropayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ValidationError> for MicropayError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidTicket {
            reason: err.to_string(),
        }
    }
}

// =====================================================================
// Collaborator errors
// =====================================================================

/// How a redemption failure must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The ledger already holds this ticket as redeemed. Counts as success.
    AlreadyUsed,
    /// May succeed on retry.
    Transient,
    /// Retrying cannot change the outcome.
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyUsed => write!(f, "ALREADY_USED"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Permanent => write!(f, "PERMANENT"),
        }
    }
}

/// Errors reported by the settlement ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("ticket already redeemed")]
    AlreadyUsed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("ledger call timed out")]
    Timeout,

    #[error("transaction nonce contention")]
    NonceContention,

    #[error("signature rejected by ledger")]
    InvalidSignature,

    #[error("sender deposit insufficient at ledger level")]
    InsufficientDeposit,

    #[error("signer not approved for sender")]
    UnapprovedSigner,

    #[error("ticket expired at ledger level")]
    TicketExpired,

    #[error("transaction rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Classify this error for the redemption state machine.
    #[must_use]
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::AlreadyUsed => FailureClass::AlreadyUsed,
            Self::Transport(_) | Self::Timeout | Self::NonceContention => FailureClass::Transient,
            Self::InvalidSignature
            | Self::InsufficientDeposit
            | Self::UnapprovedSigner
            | Self::TicketExpired
            | Self::Rejected(_) => FailureClass::Permanent,
        }
    }
}

/// Error from the durable ticket store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ticket store: {reason}")]
pub struct StoreError {
    pub reason: String,
}

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why a ticket failed structural or cryptographic validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("sender is the zero address")]
    ZeroSender,

    #[error("recipient {actual} does not match {expected}")]
    WrongRecipient { expected: String, actual: String },

    #[error("face value must be positive")]
    NonPositiveFaceValue,

    #[error("win probability is zero")]
    ZeroWinProb,

    #[error("expiration round {expiration_round} not after creation round {creation_round}")]
    BadRoundWindow {
        creation_round: u64,
        expiration_round: u64,
    },

    #[error("recipient rand does not match commitment")]
    CommitmentMismatch,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("{0}")]
    Other(String),
}

/// Error from the local signing-key custody component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signing failed: {reason}")]
pub struct SigningError {
    pub reason: String,
}

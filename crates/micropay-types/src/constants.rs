//! System-wide constants for Micropay ticket settlement.

/// Default maximum redemption attempts per ticket (first try included).
pub const DEFAULT_MAX_REDEEM_ATTEMPTS: u32 = 5;

/// Default backoff before the first redemption retry, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;

/// Default cap on a single redemption backoff, in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default growth factor between consecutive backoffs.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Default lifetime of a cached sender deposit / escrow reading, in milliseconds.
pub const DEFAULT_EXPOSURE_CACHE_TTL_MS: u64 = 30_000;

/// Number of ledger rounds after its creation round in which a ticket is accepted.
pub const DEFAULT_TICKET_VALIDITY_ROUNDS: u64 = 2;

/// Default time an empty per-sender redemption lane lives on, in milliseconds.
pub const DEFAULT_LANE_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Replay guard size (number of ticket identities to remember).
pub const REPLAY_GUARD_CACHE_SIZE: usize = 100_000;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Micropay";

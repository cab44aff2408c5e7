//! Session exposure tracker — admission control against a sender's funds.
//!
//! A sender's deposit backs every ticket it has issued, across all of its
//! sessions. The tracker keeps, per sender:
//!
//! - `outstanding`: face value of tickets admitted but not yet finalized
//!   (authoritative for this process only)
//! - `deposit` / `penalty_escrow`: read from the ledger, cached for
//!   `cache_ttl`, refreshed on miss, expiry or invalidation
//!
//! ```text
//! coverage = max(0, deposit - penalty_escrow * escrow_reserve_ratio)
//! admit    <=> outstanding + face_value <= coverage
//! ```
//!
//! ## Locking
//!
//! Each sender has its own async mutex; check-and-increment happens under
//! it, so concurrent reservations for one sender are linearizable and can
//! never jointly exceed coverage. The outer map lock is only held to find
//! the sender's entry, never across a ledger call, so unrelated senders do
//! not contend.
//!
//! An entry is created on a sender's first reservation. The owner drops it
//! with [`ExposureTracker::forget_idle`] once the sender has no open session
//! and nothing outstanding.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use micropay_types::{Address, Broker, ExposureConfig, MicropayError, Result};
use rust_decimal::Decimal;
use tokio::time::Instant;

/// Point-in-time view of one sender's exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExposure {
    /// Face value admitted but not yet finalized.
    pub outstanding: Decimal,
    /// Last known ledger deposit.
    pub deposit: Decimal,
    /// Last known ledger penalty escrow.
    pub penalty_escrow: Decimal,
}

/// Cached ledger reading.
#[derive(Debug, Clone, Copy)]
struct LedgerFunds {
    deposit: Decimal,
    penalty_escrow: Decimal,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct SenderExposure {
    outstanding: Decimal,
    funds: Option<LedgerFunds>,
}

/// Per-sender running exposure versus on-chain funds.
pub struct ExposureTracker {
    broker: Arc<dyn Broker>,
    config: ExposureConfig,
    senders: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<SenderExposure>>>>,
}

impl ExposureTracker {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: ExposureConfig) -> Self {
        Self {
            broker,
            config,
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, sender: Address) -> Arc<tokio::sync::Mutex<SenderExposure>> {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(senders.entry(sender).or_default())
    }

    fn coverage(&self, funds: &LedgerFunds) -> Decimal {
        let reserve = funds.penalty_escrow * self.config.escrow_reserve_ratio;
        (funds.deposit - reserve).max(Decimal::ZERO)
    }

    /// Return fresh ledger funds, fetching them if the cache is cold.
    async fn fresh_funds(&self, sender: Address, state: &mut SenderExposure) -> Result<LedgerFunds> {
        if let Some(funds) = state.funds {
            if funds.fetched_at.elapsed() < self.config.cache_ttl() {
                return Ok(funds);
            }
        }

        let deposit = self.broker.get_deposit(&sender).await.map_err(|err| {
            tracing::warn!(sender = %sender, error = %err, "Deposit read failed");
            MicropayError::LedgerUnavailable {
                reason: format!("get deposit for {sender}: {err}"),
            }
        })?;
        let penalty_escrow = self
            .broker
            .get_penalty_escrow(&sender)
            .await
            .map_err(|err| {
                tracing::warn!(sender = %sender, error = %err, "Penalty escrow read failed");
                MicropayError::LedgerUnavailable {
                    reason: format!("get penalty escrow for {sender}: {err}"),
                }
            })?;

        let funds = LedgerFunds {
            deposit,
            penalty_escrow,
            fetched_at: Instant::now(),
        };
        state.funds = Some(funds);
        tracing::debug!(
            sender = %sender,
            deposit = %deposit,
            penalty_escrow = %penalty_escrow,
            "Sender funds refreshed"
        );
        Ok(funds)
    }

    /// Atomically check coverage and add `amount` to `outstanding`.
    ///
    /// # Errors
    /// - `InsufficientCoverage` if admitting `amount` would exceed coverage
    /// - `LedgerUnavailable` if funds had to be refreshed and the read failed
    pub async fn reserve(&self, sender: Address, amount: Decimal) -> Result<()> {
        let entry = self.entry(sender);
        let mut state = entry.lock().await;
        let funds = self.fresh_funds(sender, &mut state).await?;
        let coverage = self.coverage(&funds);
        let available = (coverage - state.outstanding).max(Decimal::ZERO);

        if state.outstanding + amount > coverage {
            return Err(MicropayError::InsufficientCoverage {
                sender,
                needed: amount,
                available,
            });
        }

        state.outstanding += amount;
        Ok(())
    }

    /// Like [`reserve`](Self::reserve), reporting a coverage refusal as `false`.
    pub async fn try_reserve(&self, sender: Address, amount: Decimal) -> Result<bool> {
        match self.reserve(sender, amount).await {
            Ok(()) => Ok(true),
            Err(MicropayError::InsufficientCoverage { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove `amount` from `outstanding` without touching cached funds.
    pub async fn release(&self, sender: Address, amount: Decimal) {
        let entry = self.entry(sender);
        let mut state = entry.lock().await;
        Self::decrement(sender, &mut state, amount);
    }

    /// Finalize a confirmed redemption: release `amount` and account for the
    /// ledger's deduction in the cached deposit.
    ///
    /// `queued_at` must not be later than the redemption's first ledger
    /// call. A reading fetched by then cannot contain the deduction, so
    /// `amount` is subtracted from it. A later reading may already contain
    /// it and is dropped instead; the next reservation re-reads the ledger.
    pub async fn settle(&self, sender: Address, amount: Decimal, queued_at: Instant) {
        let entry = self.entry(sender);
        let mut state = entry.lock().await;
        Self::decrement(sender, &mut state, amount);
        match state.funds.as_mut() {
            Some(funds) if funds.fetched_at <= queued_at => {
                funds.deposit = (funds.deposit - amount).max(Decimal::ZERO);
            }
            Some(_) => state.funds = None,
            None => {}
        }
    }

    /// Force a ledger refresh on the next reservation for `sender`.
    pub async fn invalidate(&self, sender: Address) {
        let entry = self.entry(sender);
        entry.lock().await.funds = None;
    }

    /// Drop `sender`'s entry if nothing is outstanding and no call is using
    /// it. Returns whether an entry was removed.
    pub fn forget_idle(&self, sender: Address) -> bool {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = senders.get(&sender) else {
            return false;
        };
        // Callers clone the entry under the map lock, so a count of one
        // means nobody is between lookup and release.
        let idle = Arc::strong_count(entry) == 1
            && entry
                .try_lock()
                .is_ok_and(|state| state.outstanding.is_zero());
        if idle {
            senders.remove(&sender);
        }
        idle
    }

    /// Number of senders with an entry.
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Current view of a sender, if it has been seen.
    pub async fn snapshot(&self, sender: Address) -> Option<SessionExposure> {
        let entry = {
            let senders = self
                .senders
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            senders.get(&sender).map(Arc::clone)?
        };
        let state = entry.lock().await;
        let funds = state.funds;
        Some(SessionExposure {
            outstanding: state.outstanding,
            deposit: funds.map_or(Decimal::ZERO, |f| f.deposit),
            penalty_escrow: funds.map_or(Decimal::ZERO, |f| f.penalty_escrow),
        })
    }

    fn decrement(sender: Address, state: &mut SenderExposure, amount: Decimal) {
        if state.outstanding < amount {
            tracing::warn!(
                sender = %sender,
                outstanding = %state.outstanding,
                amount = %amount,
                "Exposure release exceeds outstanding, clamping to zero"
            );
            state.outstanding = Decimal::ZERO;
        } else {
            state.outstanding -= amount;
        }
    }
}

#[cfg(test)]
mod tests {
    use micropay_types::testing::StubBroker;

    use super::*;

    const ALICE: Address = Address([1u8; 32]);
    const BOB: Address = Address([2u8; 32]);

    fn setup(deposit: i64, escrow: i64) -> (Arc<StubBroker>, ExposureTracker) {
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(deposit, 0));
        broker.set_penalty_escrow(ALICE, Decimal::new(escrow, 0));
        let tracker = ExposureTracker::new(broker.clone(), ExposureConfig::default());
        (broker, tracker)
    }

    #[tokio::test]
    async fn reserve_within_deposit() {
        let (_, tracker) = setup(1000, 0);
        tracker.reserve(ALICE, Decimal::new(600, 0)).await.unwrap();
        tracker.reserve(ALICE, Decimal::new(400, 0)).await.unwrap();
        let snap = tracker.snapshot(ALICE).await.unwrap();
        assert_eq!(snap.outstanding, Decimal::new(1000, 0));
    }

    #[tokio::test]
    async fn reserve_beyond_deposit_refused() {
        let (_, tracker) = setup(1000, 0);
        tracker.reserve(ALICE, Decimal::new(900, 0)).await.unwrap();
        let err = tracker
            .reserve(ALICE, Decimal::new(200, 0))
            .await
            .unwrap_err();
        match err {
            MicropayError::InsufficientCoverage {
                needed, available, ..
            } => {
                assert_eq!(needed, Decimal::new(200, 0));
                assert_eq!(available, Decimal::new(100, 0));
            }
            other => panic!("expected InsufficientCoverage, got {other:?}"),
        }
        assert!(!tracker.try_reserve(ALICE, Decimal::new(200, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn penalty_escrow_reserve_reduces_coverage() {
        let (_, tracker) = setup(1000, 300);
        assert!(tracker.try_reserve(ALICE, Decimal::new(700, 0)).await.unwrap());
        assert!(!tracker.try_reserve(ALICE, Decimal::ONE).await.unwrap());
    }

    #[tokio::test]
    async fn release_restores_headroom() {
        let (_, tracker) = setup(100, 0);
        tracker.reserve(ALICE, Decimal::new(100, 0)).await.unwrap();
        assert!(!tracker.try_reserve(ALICE, Decimal::ONE).await.unwrap());
        tracker.release(ALICE, Decimal::new(100, 0)).await;
        assert!(tracker.try_reserve(ALICE, Decimal::ONE).await.unwrap());
    }

    #[tokio::test]
    async fn release_underflow_clamps() {
        let (_, tracker) = setup(100, 0);
        tracker.reserve(ALICE, Decimal::new(10, 0)).await.unwrap();
        tracker.release(ALICE, Decimal::new(50, 0)).await;
        assert_eq!(
            tracker.snapshot(ALICE).await.unwrap().outstanding,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn settle_deducts_cached_deposit() {
        let (_, tracker) = setup(1000, 0);
        tracker.reserve(ALICE, Decimal::new(100, 0)).await.unwrap();
        tracker
            .settle(ALICE, Decimal::new(100, 0), Instant::now())
            .await;
        let snap = tracker.snapshot(ALICE).await.unwrap();
        assert_eq!(snap.outstanding, Decimal::ZERO);
        assert_eq!(snap.deposit, Decimal::new(900, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_drops_reading_taken_after_submission() {
        let (broker, tracker) = setup(1000, 0);
        tracker.reserve(ALICE, Decimal::new(100, 0)).await.unwrap();
        let queued = Instant::now();
        tokio::time::advance(std::time::Duration::from_millis(5)).await;

        // The ledger deducts; another reservation re-reads it meanwhile.
        broker.set_deposit(ALICE, Decimal::new(900, 0));
        tracker.invalidate(ALICE).await;
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        assert_eq!(broker.get_deposit_calls(), 2);

        tracker
            .settle(ALICE, Decimal::new(100, 0), queued)
            .await;
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        assert_eq!(broker.get_deposit_calls(), 3);
        let snap = tracker.snapshot(ALICE).await.unwrap();
        assert_eq!(snap.deposit, Decimal::new(900, 0), "deduction counted once");
        assert_eq!(snap.outstanding, Decimal::new(2, 0));
    }

    #[tokio::test]
    async fn idle_sender_forgotten() {
        let (_, tracker) = setup(1000, 0);
        assert!(!tracker.forget_idle(ALICE), "nothing to forget yet");

        tracker.reserve(ALICE, Decimal::new(100, 0)).await.unwrap();
        assert!(!tracker.forget_idle(ALICE), "outstanding keeps the entry");
        assert_eq!(tracker.sender_count(), 1);

        tracker.release(ALICE, Decimal::new(100, 0)).await;
        assert!(tracker.forget_idle(ALICE));
        assert_eq!(tracker.sender_count(), 0);
        assert!(tracker.snapshot(ALICE).await.is_none());

        // A returning sender starts from a fresh ledger reading.
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        assert_eq!(tracker.sender_count(), 1);
    }

    #[tokio::test]
    async fn funds_cached_until_invalidated() {
        let (broker, tracker) = setup(1000, 0);
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        assert_eq!(broker.get_deposit_calls(), 1);

        broker.set_deposit(ALICE, Decimal::new(5, 0));
        tracker.invalidate(ALICE).await;
        assert!(!tracker.try_reserve(ALICE, Decimal::new(4, 0)).await.unwrap());
        assert_eq!(broker.get_deposit_calls(), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_refreshes() {
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(1000, 0));
        let config = ExposureConfig {
            cache_ttl_ms: 0,
            ..ExposureConfig::default()
        };
        let tracker = ExposureTracker::new(broker.clone(), config);
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        tracker.reserve(ALICE, Decimal::ONE).await.unwrap();
        assert_eq!(broker.get_deposit_calls(), 2);
    }

    #[tokio::test]
    async fn ledger_failure_is_unavailable_not_refusal() {
        let (broker, tracker) = setup(1000, 0);
        broker.set_get_deposit_should_fail(true);
        let err = tracker.reserve(ALICE, Decimal::ONE).await.unwrap_err();
        assert!(matches!(err, MicropayError::LedgerUnavailable { .. }));
        assert!(tracker.try_reserve(ALICE, Decimal::ONE).await.is_err());
        assert_eq!(
            tracker.snapshot(ALICE).await.unwrap().outstanding,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn senders_are_independent() {
        let (broker, tracker) = setup(100, 0);
        broker.set_deposit(BOB, Decimal::new(100, 0));
        tracker.reserve(ALICE, Decimal::new(100, 0)).await.unwrap();
        tracker.reserve(BOB, Decimal::new(100, 0)).await.unwrap();
        assert!(!tracker.try_reserve(ALICE, Decimal::ONE).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_deposit() {
        let (_, tracker) = setup(1000, 0);
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker.try_reserve(ALICE, Decimal::new(100, 0)).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(
            tracker.snapshot(ALICE).await.unwrap().outstanding,
            Decimal::new(1000, 0)
        );
    }

    #[tokio::test]
    async fn unknown_sender_has_no_snapshot() {
        let (_, tracker) = setup(100, 0);
        assert!(tracker.snapshot(BOB).await.is_none());
    }
}

//! Redemption dispatcher — per-sender serialized ledger submission.
//!
//! The ledger orders transactions per account, so at most one redemption
//! per sender may be in flight. Each sender gets a FIFO lane: an unbounded
//! channel drained by a single worker task. Tickets of one sender queue
//! behind one another; different senders run fully in parallel.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐   ┌────────────┐  ok / already used  ┌───────────┐
//!   │ PENDING ├──▶│ SUBMITTING ├────────────────────▶│ CONFIRMED ├──┐
//!   └────┬────┘   └──┬─────┬───┘                     └───────────┘  │
//!        │           │     │ permanent               ┌──────────┐   │
//!        │ cancel /  │     └────────────────────────▶│ REJECTED ├───┤
//!        │ replayed  │ transient                     └──────────┘   │
//!        │           ▼                                              ▼
//!        │      ┌──────────┐  backoff elapsed          ┌──────────┐
//!        │      │ RETRYING ├──────▶ SUBMITTING         │ TERMINAL │
//!        │      └────┬─────┘                           └──────────┘
//!        │           │ exhausted / cancelled                 ▲
//!        └───────────┴───────────────────────────────────────┘
//! ```
//!
//! Cancellation is checked before every submission and raced against every
//! backoff. A submission already sent to the ledger is never interrupted;
//! the ledger applies it atomically or not at all.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use micropay_types::{
    Address, Broker, BrokerError, FailureClass, MicropayError, RecipientRand, Result, RetryPolicy,
    Signature, Ticket, TicketHash, constants,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::replay_guard::ReplayGuard;

// ---------------------------------------------------------------------------
// RedemptionState / RedemptionAttempt
// ---------------------------------------------------------------------------

/// Where a redemption attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedemptionState {
    /// Queued in the sender's lane.
    Pending,
    /// A ledger call is in flight.
    Submitting,
    /// The ledger holds the ticket as redeemed (by us or earlier).
    Confirmed,
    /// The ledger refused the ticket for good.
    Rejected,
    /// Waiting out a backoff after a transient failure.
    Retrying,
    /// Done. The attempt record is discarded.
    Terminal,
}

impl RedemptionState {
    /// Can an attempt move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Submitting | Self::Terminal)
                | (Self::Submitting, Self::Confirmed | Self::Rejected | Self::Retrying)
                | (Self::Retrying, Self::Submitting | Self::Terminal)
                | (Self::Confirmed | Self::Rejected, Self::Terminal)
        )
    }
}

impl std::fmt::Display for RedemptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitting => write!(f, "SUBMITTING"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Terminal => write!(f, "TERMINAL"),
        }
    }
}

/// Transient bookkeeping for one ticket while the dispatcher owns it.
#[derive(Debug, Clone)]
pub struct RedemptionAttempt {
    pub ticket_hash: TicketHash,
    pub state: RedemptionState,
    /// Ledger submissions made so far.
    pub attempts: u32,
    pub last_error: Option<FailureClass>,
    pub next_retry_at: Option<Instant>,
}

impl RedemptionAttempt {
    fn new(ticket_hash: TicketHash) -> Self {
        Self {
            ticket_hash,
            state: RedemptionState::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    fn transition(&mut self, target: RedemptionState) {
        debug_assert!(
            self.state.can_transition_to(target),
            "invalid redemption transition {} -> {}",
            self.state,
            target
        );
        tracing::trace!(
            ticket = %self.ticket_hash.short(),
            from = %self.state,
            to = %target,
            attempts = self.attempts,
            "Redemption state change"
        );
        self.state = target;
    }
}

// ---------------------------------------------------------------------------
// RedemptionOutcome
// ---------------------------------------------------------------------------

/// Terminal result of one redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// Our transaction redeemed the ticket.
    Confirmed { attempts: u32 },
    /// The ticket was already redeemed, by this process or on the ledger.
    /// Counts as success.
    AlreadyRedeemed { attempts: u32 },
    /// The ledger refused the ticket, or transient failures exhausted the
    /// retry budget (`permanent == false`).
    Failed {
        attempts: u32,
        permanent: bool,
        error: BrokerError,
    },
    /// The owning session was torn down before redemption finished.
    Cancelled { attempts: u32 },
}

impl RedemptionOutcome {
    /// Whether the ticket is redeemed on the ledger.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::AlreadyRedeemed { .. })
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Confirmed { attempts }
            | Self::AlreadyRedeemed { attempts }
            | Self::Failed { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct RedemptionJob {
    ticket: Ticket,
    signature: Signature,
    recipient_rand: RecipientRand,
    cancel: CancellationToken,
    reply: oneshot::Sender<RedemptionOutcome>,
}

/// Handle to a queued redemption.
pub struct PendingRedemption {
    ticket_hash: TicketHash,
    queued_at: Instant,
    rx: oneshot::Receiver<RedemptionOutcome>,
}

impl PendingRedemption {
    #[must_use]
    pub fn ticket_hash(&self) -> TicketHash {
        self.ticket_hash
    }

    /// When the ticket entered its lane. No ledger call for it started
    /// earlier.
    #[must_use]
    pub fn queued_at(&self) -> Instant {
        self.queued_at
    }

    /// Wait for the terminal outcome.
    ///
    /// # Errors
    /// Returns [`MicropayError::Internal`] if the lane worker stopped
    /// without answering (runtime shutdown).
    pub async fn outcome(self) -> Result<RedemptionOutcome> {
        self.rx.await.map_err(|_| {
            MicropayError::Internal(format!(
                "redemption worker stopped before answering for {}",
                self.ticket_hash
            ))
        })
    }
}

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<RedemptionJob>,
}

struct DispatcherInner {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    replay_guard: Mutex<ReplayGuard>,
    lanes: Mutex<HashMap<Address, Lane>>,
    next_lane_id: AtomicU64,
}

/// Serializes redemptions per sender and drives each through the state
/// machine above.
///
/// A lane whose channel stays empty for the idle timeout retires: its
/// worker removes the lane and exits. The sender's next ticket starts a
/// fresh one.
pub struct RedemptionDispatcher {
    inner: Arc<DispatcherInner>,
    lane_idle: Duration,
}

impl RedemptionDispatcher {
    /// # Panics
    /// Panics if `replay_guard_capacity` is zero.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy, replay_guard_capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                broker,
                retry,
                replay_guard: Mutex::new(ReplayGuard::new(replay_guard_capacity)),
                lanes: Mutex::new(HashMap::new()),
                next_lane_id: AtomicU64::new(0),
            }),
            lane_idle: Duration::from_millis(constants::DEFAULT_LANE_IDLE_TIMEOUT_MS),
        }
    }

    /// How long a sender lane may sit empty before its worker exits.
    #[must_use]
    pub fn with_lane_idle_timeout(mut self, idle: Duration) -> Self {
        self.lane_idle = idle;
        self
    }

    /// Queue a ticket in its sender's lane. Must be called inside a Tokio
    /// runtime; the lane worker is spawned on first use.
    pub fn submit(
        &self,
        ticket: Ticket,
        signature: Signature,
        recipient_rand: RecipientRand,
        cancel: CancellationToken,
    ) -> PendingRedemption {
        let ticket_hash = ticket.hash();
        let sender = ticket.sender;
        let queued_at = Instant::now();
        let (reply, rx) = oneshot::channel();
        let job = RedemptionJob {
            ticket,
            signature,
            recipient_rand,
            cancel,
            reply,
        };

        let mut lanes = self.inner.lanes();
        let lane = lanes
            .entry(sender)
            .or_insert_with(|| self.spawn_lane(sender));
        if let Err(mpsc::error::SendError(job)) = lane.tx.send(job) {
            // Worker gone (its runtime was shut down); start a fresh lane.
            let fresh = self.spawn_lane(sender);
            if fresh.tx.send(job).is_err() {
                tracing::warn!(sender = %sender, "Redemption lane closed immediately");
            }
            lanes.insert(sender, fresh);
        }
        drop(lanes);

        tracing::debug!(sender = %sender, ticket = %ticket_hash.short(), "Redemption queued");
        PendingRedemption {
            ticket_hash,
            queued_at,
            rx,
        }
    }

    /// Queue a ticket and wait for its outcome.
    pub async fn redeem(
        &self,
        ticket: Ticket,
        signature: Signature,
        recipient_rand: RecipientRand,
        cancel: CancellationToken,
    ) -> Result<RedemptionOutcome> {
        self.submit(ticket, signature, recipient_rand, cancel)
            .outcome()
            .await
    }

    /// Whether this process holds a claim on the ticket, either in flight
    /// or confirmed.
    pub fn is_submitted(&self, ticket_hash: &TicketHash) -> bool {
        self.inner.guard().contains(ticket_hash)
    }

    /// Number of live sender lanes.
    pub fn lane_count(&self) -> usize {
        self.inner.lanes().len()
    }

    fn spawn_lane(&self, sender: Address) -> Lane {
        let id = self.inner.next_lane_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(Arc::clone(&self.inner), sender, id, self.lane_idle, rx));
        Lane { id, tx }
    }
}

async fn run_lane(
    inner: Arc<DispatcherInner>,
    sender: Address,
    lane_id: u64,
    idle: Duration,
    mut rx: mpsc::UnboundedReceiver<RedemptionJob>,
) {
    tracing::debug!(sender = %sender, lane = lane_id, "Redemption lane started");
    loop {
        let next = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(job) => job,
            Err(_) => inner.retire_if_idle(sender, lane_id, &mut rx),
        };
        let Some(job) = next else { break };
        let outcome = inner.redeem(&job).await;
        // The caller may have stopped waiting; the outcome is already logged.
        let _ = job.reply.send(outcome);
    }
    tracing::debug!(sender = %sender, lane = lane_id, "Redemption lane stopped");
}

impl DispatcherInner {
    fn guard(&self) -> MutexGuard<'_, ReplayGuard> {
        self.replay_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<Address, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unregister an idle lane, or hand back a job that raced in.
    ///
    /// `submit` sends while holding the lanes lock, so once the lane is
    /// removed under that lock nothing more can arrive on `rx`.
    fn retire_if_idle(
        &self,
        sender: Address,
        lane_id: u64,
        rx: &mut mpsc::UnboundedReceiver<RedemptionJob>,
    ) -> Option<RedemptionJob> {
        let mut lanes = self.lanes();
        if let Ok(job) = rx.try_recv() {
            return Some(job);
        }
        if lanes.get(&sender).is_some_and(|lane| lane.id == lane_id) {
            lanes.remove(&sender);
        }
        None
    }

    async fn redeem(&self, job: &RedemptionJob) -> RedemptionOutcome {
        let mut attempt = RedemptionAttempt::new(job.ticket.hash());

        if job.cancel.is_cancelled() {
            attempt.transition(RedemptionState::Terminal);
            return RedemptionOutcome::Cancelled { attempts: 0 };
        }

        let claimed = self.guard().claim(&job.ticket);
        if let Err(err) = claimed {
            attempt.transition(RedemptionState::Terminal);
            return match err {
                MicropayError::TicketAlreadySubmitted(_) => {
                    tracing::info!(
                        ticket = %attempt.ticket_hash.short(),
                        sender = %job.ticket.sender,
                        "Ticket already submitted by this process"
                    );
                    RedemptionOutcome::AlreadyRedeemed { attempts: 0 }
                }
                other => {
                    tracing::warn!(
                        ticket = %attempt.ticket_hash.short(),
                        sender = %job.ticket.sender,
                        error = %other,
                        "Redemption refused before submission"
                    );
                    RedemptionOutcome::Failed {
                        attempts: 0,
                        permanent: true,
                        error: BrokerError::Rejected(other.to_string()),
                    }
                }
            };
        }

        let outcome = self.submit_until_terminal(job, &mut attempt).await;
        if outcome.is_success() {
            self.guard().confirm(&attempt.ticket_hash);
        } else {
            self.guard().release(&attempt.ticket_hash);
        }
        attempt.transition(RedemptionState::Terminal);
        outcome
    }

    async fn submit_until_terminal(
        &self,
        job: &RedemptionJob,
        attempt: &mut RedemptionAttempt,
    ) -> RedemptionOutcome {
        loop {
            if job.cancel.is_cancelled() {
                tracing::info!(
                    ticket = %attempt.ticket_hash.short(),
                    attempts = attempt.attempts,
                    "Redemption cancelled, ticket kept in store"
                );
                return RedemptionOutcome::Cancelled {
                    attempts: attempt.attempts,
                };
            }

            attempt.transition(RedemptionState::Submitting);
            attempt.attempts += 1;
            let result = self
                .broker
                .redeem_winning_ticket(&job.ticket, &job.signature, &job.recipient_rand)
                .await;

            let error = match result {
                Ok(()) => {
                    attempt.transition(RedemptionState::Confirmed);
                    tracing::info!(
                        ticket = %attempt.ticket_hash.short(),
                        sender = %job.ticket.sender,
                        face_value = %job.ticket.face_value,
                        attempts = attempt.attempts,
                        "Winning ticket redeemed"
                    );
                    return RedemptionOutcome::Confirmed {
                        attempts: attempt.attempts,
                    };
                }
                Err(error) => error,
            };

            let class = error.classify();
            attempt.last_error = Some(class);
            match class {
                FailureClass::AlreadyUsed => {
                    attempt.transition(RedemptionState::Confirmed);
                    tracing::info!(
                        ticket = %attempt.ticket_hash.short(),
                        sender = %job.ticket.sender,
                        attempts = attempt.attempts,
                        "Ledger reports ticket already redeemed"
                    );
                    return RedemptionOutcome::AlreadyRedeemed {
                        attempts: attempt.attempts,
                    };
                }
                FailureClass::Permanent => {
                    attempt.transition(RedemptionState::Rejected);
                    tracing::warn!(
                        ticket = %attempt.ticket_hash.short(),
                        sender = %job.ticket.sender,
                        error = %error,
                        "Redemption rejected by ledger"
                    );
                    return RedemptionOutcome::Failed {
                        attempts: attempt.attempts,
                        permanent: true,
                        error,
                    };
                }
                FailureClass::Transient => {
                    attempt.transition(RedemptionState::Retrying);
                    if attempt.attempts >= self.retry.max_attempts {
                        tracing::warn!(
                            ticket = %attempt.ticket_hash.short(),
                            sender = %job.ticket.sender,
                            attempts = attempt.attempts,
                            error = %error,
                            "Redemption retries exhausted, ticket kept in store"
                        );
                        return RedemptionOutcome::Failed {
                            attempts: attempt.attempts,
                            permanent: false,
                            error,
                        };
                    }

                    let backoff = self.retry.backoff_for(attempt.attempts);
                    attempt.next_retry_at = Some(Instant::now() + backoff);
                    tracing::warn!(
                        ticket = %attempt.ticket_hash.short(),
                        attempts = attempt.attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Transient redemption failure, retrying"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = job.cancel.cancelled() => {
                            tracing::info!(
                                ticket = %attempt.ticket_hash.short(),
                                attempts = attempt.attempts,
                                "Redemption cancelled during backoff, ticket kept in store"
                            );
                            return RedemptionOutcome::Cancelled {
                                attempts: attempt.attempts,
                            };
                        }
                    }
                }
            }
        }
    }
}

//! Ticket settlement orchestrator — per-session entry point.
//!
//! Composes the admission plane (validator, nonces, exposure, evaluator)
//! with the finality plane (ticket store, dispatcher):
//!
//! ```text
//! process(session, ticket, sig, rand)
//!   1. session parties + round window     → InvalidTicket / StaleTicket
//!   2. Validator + negotiated terms + nonce → InvalidTicket
//!   3. ExposureTracker::reserve           → InsufficientCoverage / LedgerUnavailable
//!   4. is_winning_ticket                  → NotWinning (reservation released)
//!   5. TicketStore::store                 → PersistenceFailure (reservation released)
//!   6. RedemptionDispatcher::submit
//!   7. outcome → exposure reconciled      → Redeemed / AlreadyRedeemed / Redemption*
//! ```
//!
//! Steps 1-6 run under a per-session lock, so a session's tickets are
//! admitted and queued in arrival order. The wait for the ledger in step 7
//! happens outside it.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use micropay_ingress::{ExposureTracker, SessionNonces};
use micropay_types::{
    AccountManager, Address, Broker, BrokerError, MicropayError, ReceiptType, RecipientRand,
    RedemptionReceipt, Result, RoundsManager, SessionId, SettlementConfig, Signature, Ticket,
    TicketHash, TicketStore, Validator, WinProb, constants,
};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{PendingRedemption, RedemptionDispatcher, RedemptionOutcome};

/// Terms negotiated for a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub sender: Address,
    pub recipient: Address,
    pub face_value: Decimal,
    pub win_prob: WinProb,
}

/// External systems the orchestrator depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub store: Arc<dyn TicketStore>,
    pub broker: Arc<dyn Broker>,
    pub rounds: Arc<dyn RoundsManager>,
    /// Signs redemption receipts. Without one, no receipts are issued.
    pub account_manager: Option<Arc<dyn AccountManager>>,
}

impl Collaborators {
    pub fn new(
        validator: Arc<dyn Validator>,
        store: Arc<dyn TicketStore>,
        broker: Arc<dyn Broker>,
        rounds: Arc<dyn RoundsManager>,
    ) -> Self {
        Self {
            validator,
            store,
            broker,
            rounds,
            account_manager: None,
        }
    }

    #[must_use]
    pub fn with_account_manager(mut self, account_manager: Arc<dyn AccountManager>) -> Self {
        self.account_manager = Some(account_manager);
        self
    }
}

/// Successful result of [`TicketSettlementOrchestrator::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Valid ticket that did not win. Nothing was stored.
    NotWinning { ticket_hash: TicketHash },
    /// Our redemption transaction was confirmed.
    Redeemed {
        ticket_hash: TicketHash,
        attempts: u32,
        receipt: Option<RedemptionReceipt>,
    },
    /// The ticket was already redeemed before we got to it.
    AlreadyRedeemed {
        ticket_hash: TicketHash,
        attempts: u32,
        receipt: Option<RedemptionReceipt>,
    },
}

impl ProcessOutcome {
    #[must_use]
    pub fn ticket_hash(&self) -> TicketHash {
        match self {
            Self::NotWinning { ticket_hash }
            | Self::Redeemed { ticket_hash, .. }
            | Self::AlreadyRedeemed { ticket_hash, .. } => *ticket_hash,
        }
    }

    #[must_use]
    pub fn receipt(&self) -> Option<&RedemptionReceipt> {
        match self {
            Self::NotWinning { .. } => None,
            Self::Redeemed { receipt, .. } | Self::AlreadyRedeemed { receipt, .. } => {
                receipt.as_ref()
            }
        }
    }
}

pub(crate) struct Session {
    pub(crate) params: SessionParams,
    /// Cancels queued and retrying redemptions on teardown.
    pub(crate) cancel: CancellationToken,
    /// Held over admission and enqueue.
    pub(crate) admission: tokio::sync::Mutex<()>,
}

/// Validates, evaluates, persists and redeems tickets for many concurrent
/// payment sessions.
pub struct TicketSettlementOrchestrator {
    pub(crate) config: SettlementConfig,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) store: Arc<dyn TicketStore>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) rounds: Arc<dyn RoundsManager>,
    pub(crate) account_manager: Option<Arc<dyn AccountManager>>,
    pub(crate) exposure: ExposureTracker,
    pub(crate) dispatcher: RedemptionDispatcher,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    nonces: Mutex<SessionNonces>,
}

impl TicketSettlementOrchestrator {
    /// # Errors
    /// Returns [`MicropayError::Configuration`] if `config` does not validate.
    pub fn new(config: SettlementConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            validator,
            store,
            broker,
            rounds,
            account_manager,
        } = collaborators;

        let exposure = ExposureTracker::new(Arc::clone(&broker), config.exposure.clone());
        let dispatcher = RedemptionDispatcher::new(
            Arc::clone(&broker),
            config.retry.clone(),
            config.replay_guard_capacity,
        )
        .with_lane_idle_timeout(config.lane_idle_timeout());

        tracing::info!(
            engine = constants::ENGINE_NAME,
            version = constants::VERSION,
            max_attempts = config.retry.max_attempts,
            validity_rounds = config.ticket_validity_rounds,
            receipts = account_manager.is_some(),
            "Settlement orchestrator started"
        );

        Ok(Self {
            config,
            validator,
            store,
            broker,
            rounds,
            account_manager,
            exposure,
            dispatcher,
            sessions: Mutex::new(HashMap::new()),
            nonces: Mutex::new(SessionNonces::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// The exposure tracker shared by all sessions.
    #[must_use]
    pub fn exposure(&self) -> &ExposureTracker {
        &self.exposure
    }

    #[must_use]
    pub fn dispatcher(&self) -> &RedemptionDispatcher {
        &self.dispatcher
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    /// Open a session with a fresh id.
    pub fn open_session(&self, params: SessionParams) -> SessionId {
        let session_id = SessionId::new();
        let inserted = self.insert_session(session_id, params);
        debug_assert!(inserted, "fresh session id {session_id} already open");
        session_id
    }

    /// Reopen a session under a known id, e.g. to recover it after restart.
    ///
    /// # Errors
    /// Returns [`MicropayError::DuplicateSession`] if the id is already open.
    pub fn open_session_with_id(&self, session_id: SessionId, params: SessionParams) -> Result<()> {
        if self.insert_session(session_id, params) {
            Ok(())
        } else {
            Err(MicropayError::DuplicateSession(session_id))
        }
    }

    /// Tear a session down. Queued and retrying redemptions are cancelled;
    /// their ticket records stay in the store.
    ///
    /// # Errors
    /// Returns [`MicropayError::UnknownSession`] if the id is not open.
    pub fn close_session(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .sessions()
            .remove(&session_id)
            .ok_or(MicropayError::UnknownSession(session_id))?;
        session.cancel.cancel();
        self.nonces().forget_session(session_id);
        self.release_idle_sender(session.params.sender);
        tracing::info!(session = %session_id, "Session closed");
        Ok(())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Returns `false` if the id is already taken.
    fn insert_session(&self, session_id: SessionId, params: SessionParams) -> bool {
        match self.sessions().entry(session_id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Session {
                    params,
                    cancel: CancellationToken::new(),
                    admission: tokio::sync::Mutex::new(()),
                }));
            }
        }
        tracing::info!(
            session = %session_id,
            sender = %params.sender,
            face_value = %params.face_value,
            "Session opened"
        );
        true
    }

    /// Drop a sender's exposure entry once no open session pays from it and
    /// nothing is outstanding.
    fn release_idle_sender(&self, sender: Address) {
        let in_use = self
            .sessions()
            .values()
            .any(|session| session.params.sender == sender);
        if !in_use && self.exposure.forget_idle(sender) {
            tracing::debug!(sender = %sender, "Sender exposure dropped");
        }
    }

    pub(crate) fn session(&self, session_id: SessionId) -> Result<Arc<Session>> {
        self.sessions()
            .get(&session_id)
            .cloned()
            .ok_or(MicropayError::UnknownSession(session_id))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn nonces(&self) -> MutexGuard<'_, SessionNonces> {
        self.nonces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------
    // Ticket processing
    // -----------------------------------------------------------------

    /// Validate, evaluate, persist and redeem one ticket.
    ///
    /// # Errors
    /// - `UnknownSession` if the session is not open
    /// - `InvalidTicket` / `StaleTicket` if the ticket is rejected (nothing is written)
    /// - `InsufficientCoverage` / `LedgerUnavailable` if the sender cannot be admitted
    /// - `PersistenceFailure` if a winner could not be stored (it is not redeemed)
    /// - `RedemptionTransient` / `RedemptionPermanent` / `RedemptionCancelled`
    ///   if the stored winner was not redeemed
    pub async fn process(
        &self,
        session_id: SessionId,
        ticket: Ticket,
        signature: Signature,
        recipient_rand: RecipientRand,
    ) -> Result<ProcessOutcome> {
        let session = self.session(session_id)?;
        let ticket_hash = ticket.hash();

        let pending = {
            let _admission = session.admission.lock().await;
            if session.cancel.is_cancelled() {
                return Err(MicropayError::UnknownSession(session_id));
            }

            self.admit(session_id, &session.params, &ticket, &signature, &recipient_rand)
                .inspect_err(|err| {
                    tracing::debug!(
                        session = %session_id,
                        ticket = %ticket_hash.short(),
                        error = %err,
                        "Ticket rejected"
                    );
                })?;

            self.exposure.reserve(ticket.sender, ticket.face_value).await?;
            self.nonces()
                .record(session_id, ticket.sender, ticket.sender_nonce);

            if !self
                .validator
                .is_winning_ticket(&ticket, &signature, &recipient_rand)
            {
                self.exposure.release(ticket.sender, ticket.face_value).await;
                tracing::debug!(session = %session_id, ticket = %ticket_hash.short(), "Ticket did not win");
                return Ok(ProcessOutcome::NotWinning { ticket_hash });
            }

            if let Err(err) = self
                .store
                .store(session_id, &ticket, &signature, &recipient_rand)
                .await
            {
                self.exposure.release(ticket.sender, ticket.face_value).await;
                tracing::warn!(
                    session = %session_id,
                    ticket = %ticket_hash.short(),
                    error = %err,
                    "Winning ticket could not be stored, not redeeming"
                );
                return Err(MicropayError::PersistenceFailure {
                    reason: err.to_string(),
                });
            }
            tracing::info!(
                session = %session_id,
                ticket = %ticket_hash.short(),
                sender = %ticket.sender,
                face_value = %ticket.face_value,
                "Winning ticket stored"
            );

            self.dispatcher.submit(
                ticket.clone(),
                signature,
                recipient_rand,
                session.cancel.clone(),
            )
        };

        self.finish(session_id, &ticket, pending).await
    }

    /// Synchronous checks of steps 1 and 2. Writes nothing.
    fn admit(
        &self,
        session_id: SessionId,
        params: &SessionParams,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<()> {
        if ticket.sender != params.sender {
            return Err(MicropayError::InvalidTicket {
                reason: format!("sender {} is not the session sender {}", ticket.sender, params.sender),
            });
        }
        if ticket.recipient != params.recipient {
            return Err(MicropayError::InvalidTicket {
                reason: format!(
                    "recipient {} is not the session recipient {}",
                    ticket.recipient, params.recipient
                ),
            });
        }
        self.check_round_window(ticket)?;

        self.validator
            .validate_ticket(ticket, signature, recipient_rand)?;

        if ticket.face_value != params.face_value {
            return Err(MicropayError::InvalidTicket {
                reason: format!(
                    "face value {} differs from negotiated {}",
                    ticket.face_value, params.face_value
                ),
            });
        }
        if ticket.win_prob != params.win_prob {
            return Err(MicropayError::InvalidTicket {
                reason: format!(
                    "win probability {} differs from negotiated {}",
                    ticket.win_prob, params.win_prob
                ),
            });
        }
        self.nonces()
            .check(session_id, ticket.sender, ticket.sender_nonce)
    }

    fn check_round_window(&self, ticket: &Ticket) -> Result<()> {
        let current = self.rounds.last_initialized_round();
        let too_old = ticket
            .creation_round
            .saturating_add(self.config.ticket_validity_rounds)
            < current;
        let from_future = ticket.creation_round > current;
        let expired = current >= ticket.expiration_round;

        if too_old || from_future || expired {
            return Err(MicropayError::StaleTicket {
                creation_round: ticket.creation_round,
                expiration_round: ticket.expiration_round,
                current_round: current,
            });
        }
        Ok(())
    }

    /// Wait for a queued redemption, reconcile exposure with its outcome
    /// and map it to the caller-facing result.
    pub(crate) async fn finish(
        &self,
        session_id: SessionId,
        ticket: &Ticket,
        pending: PendingRedemption,
    ) -> Result<ProcessOutcome> {
        let queued_at = pending.queued_at();
        let result = match pending.outcome().await {
            Ok(outcome) => self.reconcile(session_id, ticket, outcome, queued_at).await,
            Err(err) => {
                self.exposure.release(ticket.sender, ticket.face_value).await;
                Err(err)
            }
        };
        self.release_idle_sender(ticket.sender);
        result
    }

    async fn reconcile(
        &self,
        session_id: SessionId,
        ticket: &Ticket,
        outcome: RedemptionOutcome,
        queued_at: Instant,
    ) -> Result<ProcessOutcome> {
        let ticket_hash = ticket.hash();
        let sender = ticket.sender;
        let amount = ticket.face_value;

        match outcome {
            RedemptionOutcome::Confirmed { attempts } => {
                self.exposure.settle(sender, amount, queued_at).await;
                let receipt = self.issue_receipt(ReceiptType::Redeemed, session_id, ticket, attempts);
                Ok(ProcessOutcome::Redeemed {
                    ticket_hash,
                    attempts,
                    receipt,
                })
            }
            RedemptionOutcome::AlreadyRedeemed { attempts } => {
                // Whoever redeemed it already moved the funds; re-read them.
                self.exposure.release(sender, amount).await;
                self.exposure.invalidate(sender).await;
                let receipt =
                    self.issue_receipt(ReceiptType::AlreadyRedeemed, session_id, ticket, attempts);
                Ok(ProcessOutcome::AlreadyRedeemed {
                    ticket_hash,
                    attempts,
                    receipt,
                })
            }
            RedemptionOutcome::Failed {
                attempts,
                permanent,
                error,
            } => {
                self.exposure.release(sender, amount).await;
                if error == BrokerError::InsufficientDeposit {
                    self.exposure.invalidate(sender).await;
                }
                if permanent {
                    Err(MicropayError::RedemptionPermanent {
                        reason: error.to_string(),
                    })
                } else {
                    Err(MicropayError::RedemptionTransient {
                        attempts,
                        reason: error.to_string(),
                    })
                }
            }
            RedemptionOutcome::Cancelled { .. } => {
                self.exposure.release(sender, amount).await;
                Err(MicropayError::RedemptionCancelled)
            }
        }
    }

    /// Sign a receipt for a successful redemption. Signing failures never
    /// change the settlement outcome.
    fn issue_receipt(
        &self,
        receipt_type: ReceiptType,
        session_id: SessionId,
        ticket: &Ticket,
        attempts: u32,
    ) -> Option<RedemptionReceipt> {
        let account_manager = self.account_manager.as_ref()?;
        let ticket_hash = ticket.hash();
        let issued_at = Utc::now();
        let payload_hash = RedemptionReceipt::compute_payload_hash(
            receipt_type,
            session_id,
            ticket_hash,
            ticket.face_value,
            attempts,
            issued_at,
        );

        match account_manager.sign(&payload_hash) {
            Ok(signature) => Some(RedemptionReceipt {
                receipt_type,
                session_id,
                ticket_hash,
                face_value: ticket.face_value,
                attempts,
                payload_hash,
                signature,
                issuer: account_manager.account(),
                issued_at,
            }),
            Err(err) => {
                tracing::warn!(
                    session = %session_id,
                    ticket = %ticket_hash.short(),
                    error = %err,
                    "Receipt signing failed, continuing without receipt"
                );
                None
            }
        }
    }
}

//! Crash recovery: redeem winning tickets left in the ticket store.
//!
//! After a restart the replay guard and exposure tracker are empty, but every
//! winner was stored before its redemption started. Recovery reloads a
//! session's tickets, skips those the ledger already holds as used, and
//! pushes the rest through the normal dispatch path. Redeeming a ticket the
//! previous process already got confirmed is harmless: the ledger answers
//! `AlreadyUsed` and no second deduction happens.
//!
//! Every loaded ticket's nonce is recorded for the session, whatever its
//! fate, so a sender cannot resend a stored ticket once recovery has run.

use micropay_types::{MicropayError, RedemptionReceipt, Result, SessionId, StoredTicket};

use crate::orchestrator::{ProcessOutcome, TicketSettlementOrchestrator};

/// Tally of one [`TicketSettlementOrchestrator::recover_session`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tickets found in the store.
    pub loaded: usize,
    /// Redeemed by this run.
    pub redeemed: usize,
    /// Already used on the ledger.
    pub already_redeemed: usize,
    /// Submitted but not redeemed (rejected, retries exhausted or cancelled).
    pub failed: usize,
    /// Not submitted because the sender could not be admitted right now.
    pub deferred: usize,
    /// Receipts for tickets redeemed or found redeemed by this run.
    pub receipts: Vec<RedemptionReceipt>,
}

impl TicketSettlementOrchestrator {
    /// Redeem every stored winner of an open session that the ledger does
    /// not yet hold as used.
    ///
    /// # Errors
    /// - `UnknownSession` if the session is not open
    /// - `LoadFailure` if the store cannot be read
    pub async fn recover_session(&self, session_id: SessionId) -> Result<RecoveryReport> {
        let session = self.session(session_id)?;
        let stored = self.store.load(session_id).await.map_err(|err| {
            tracing::warn!(session = %session_id, error = %err, "Ticket load failed");
            MicropayError::LoadFailure {
                reason: err.to_string(),
            }
        })?;

        let mut report = RecoveryReport {
            loaded: stored.len(),
            ..RecoveryReport::default()
        };
        tracing::info!(session = %session_id, loaded = report.loaded, "Recovering session");

        let mut pending = Vec::new();
        {
            let _admission = session.admission.lock().await;
            for StoredTicket {
                ticket,
                signature,
                recipient_rand,
                ..
            } in stored
            {
                let ticket_hash = ticket.hash();
                self.nonces()
                    .record(session_id, ticket.sender, ticket.sender_nonce);

                match self.broker.is_used_ticket(&ticket).await {
                    Ok(true) => {
                        tracing::debug!(
                            session = %session_id,
                            ticket = %ticket_hash.short(),
                            "Stored ticket already used on ledger"
                        );
                        report.already_redeemed += 1;
                        continue;
                    }
                    Ok(false) => {}
                    // The dispatcher learns the truth from the redemption itself.
                    Err(err) => tracing::warn!(
                        ticket = %ticket_hash.short(),
                        error = %err,
                        "Used-ticket check failed, submitting anyway"
                    ),
                }

                if let Err(err) = self.exposure.reserve(ticket.sender, ticket.face_value).await {
                    tracing::warn!(
                        session = %session_id,
                        ticket = %ticket_hash.short(),
                        error = %err,
                        "Stored ticket deferred"
                    );
                    report.deferred += 1;
                    continue;
                }

                let handle = self.dispatcher.submit(
                    ticket.clone(),
                    signature,
                    recipient_rand,
                    session.cancel.clone(),
                );
                pending.push((ticket, handle));
            }
        }

        for (ticket, handle) in pending {
            match self.finish(session_id, &ticket, handle).await {
                Ok(ProcessOutcome::Redeemed { receipt, .. }) => {
                    report.redeemed += 1;
                    report.receipts.extend(receipt);
                }
                Ok(ProcessOutcome::AlreadyRedeemed { receipt, .. }) => {
                    report.already_redeemed += 1;
                    report.receipts.extend(receipt);
                }
                Ok(ProcessOutcome::NotWinning { .. }) | Err(_) => report.failed += 1,
            }
        }

        tracing::info!(
            session = %session_id,
            redeemed = report.redeemed,
            already_redeemed = report.already_redeemed,
            failed = report.failed,
            deferred = report.deferred,
            "Session recovery finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use micropay_types::{
        Address, BrokerError, RecipientRand, SettlementConfig, Signature, Ticket, TicketStore,
        WinProb,
        testing::{StubBroker, StubRounds, StubTicketStore, StubValidator},
    };
    use rust_decimal::Decimal;

    use super::*;
    use crate::orchestrator::{Collaborators, SessionParams};

    const ALICE: Address = Address([1u8; 32]);
    const RECIPIENT: Address = Address([9u8; 32]);

    fn params() -> SessionParams {
        SessionParams {
            sender: ALICE,
            recipient: RECIPIENT,
            face_value: Decimal::new(100, 0),
            win_prob: WinProb::ALWAYS,
        }
    }

    fn orchestrator(
        store: Arc<StubTicketStore>,
        broker: Arc<StubBroker>,
    ) -> TicketSettlementOrchestrator {
        TicketSettlementOrchestrator::new(
            SettlementConfig::default(),
            Collaborators::new(
                Arc::new(StubValidator::new()),
                store,
                broker,
                Arc::new(StubRounds::new(10)),
            ),
        )
        .unwrap()
    }

    async fn seed(store: &StubTicketStore, sid: SessionId, nonce: u64) -> Ticket {
        seed_with_rand(store, sid, nonce).await.0
    }

    async fn seed_with_rand(
        store: &StubTicketStore,
        sid: SessionId,
        nonce: u64,
    ) -> (Ticket, RecipientRand) {
        let rand = RecipientRand::random();
        let ticket = Ticket::dummy(
            ALICE,
            RECIPIENT,
            Decimal::new(100, 0),
            WinProb::ALWAYS,
            nonce,
            &rand,
        );
        store
            .store(sid, &ticket, &Signature(vec![1u8; 64]), &rand)
            .await
            .unwrap();
        (ticket, rand)
    }

    #[tokio::test]
    async fn redeems_unredeemed_and_skips_used() {
        let store = Arc::new(StubTicketStore::new());
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(1000, 0));
        let sid = SessionId::new();
        let used = seed(&store, sid, 1).await;
        seed(&store, sid, 2).await;
        broker.mark_used(&used);

        let orch = orchestrator(store, broker.clone());
        orch.open_session_with_id(sid, params()).unwrap();
        let report = orch.recover_session(sid).await.unwrap();

        assert_eq!(report.loaded, 2);
        assert_eq!(report.already_redeemed, 1);
        assert_eq!(report.redeemed, 1);
        assert_eq!(broker.redeem_calls(), 1);
        assert_eq!(
            orch.exposure().snapshot(ALICE).await.unwrap().outstanding,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn load_failure_surfaced() {
        let store = Arc::new(StubTicketStore::new());
        store.set_load_should_fail(true);
        let orch = orchestrator(store, Arc::new(StubBroker::new()));
        let sid = orch.open_session(params());
        let err = orch.recover_session(sid).await.unwrap_err();
        assert!(matches!(err, MicropayError::LoadFailure { .. }));
    }

    #[tokio::test]
    async fn uncovered_tickets_deferred() {
        let store = Arc::new(StubTicketStore::new());
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(150, 0));
        let sid = SessionId::new();
        seed(&store, sid, 1).await;
        seed(&store, sid, 2).await;

        let orch = orchestrator(store, broker);
        orch.open_session_with_id(sid, params()).unwrap();
        let report = orch.recover_session(sid).await.unwrap();
        assert_eq!(report.redeemed, 1);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn rejected_tickets_counted_failed() {
        let store = Arc::new(StubTicketStore::new());
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(1000, 0));
        broker.script_redeem_errors([BrokerError::TicketExpired]);
        let sid = SessionId::new();
        seed(&store, sid, 1).await;

        let orch = orchestrator(store, broker);
        orch.open_session_with_id(sid, params()).unwrap();
        let report = orch.recover_session(sid).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.redeemed, 0);
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let orch = orchestrator(
            Arc::new(StubTicketStore::new()),
            Arc::new(StubBroker::new()),
        );
        assert!(matches!(
            orch.recover_session(SessionId::new()).await,
            Err(MicropayError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn recovered_ticket_cannot_be_resent() {
        let store = Arc::new(StubTicketStore::new());
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(1000, 0));
        let sid = SessionId::new();
        let (ticket, rand) = seed_with_rand(&store, sid, 5).await;

        let orch = orchestrator(store.clone(), broker.clone());
        orch.open_session_with_id(sid, params()).unwrap();
        let report = orch.recover_session(sid).await.unwrap();
        assert_eq!(report.redeemed, 1);

        let err = orch
            .process(sid, ticket, Signature(vec![1u8; 64]), rand)
            .await
            .unwrap_err();
        assert!(matches!(err, MicropayError::InvalidTicket { .. }));
        assert_eq!(store.stored(sid).len(), 1, "no second record");
        assert_eq!(broker.redeem_calls(), 1);

        let (older, rand) = {
            let rand = RecipientRand::random();
            let older = Ticket::dummy(
                ALICE,
                RECIPIENT,
                Decimal::new(100, 0),
                WinProb::ALWAYS,
                4,
                &rand,
            );
            (older, rand)
        };
        assert!(matches!(
            orch.process(sid, older, Signature(vec![1u8; 64]), rand).await,
            Err(MicropayError::InvalidTicket { .. })
        ));
    }

    #[tokio::test]
    async fn skipped_tickets_still_burn_their_nonces() {
        let store = Arc::new(StubTicketStore::new());
        let broker = Arc::new(StubBroker::new());
        broker.set_deposit(ALICE, Decimal::new(100, 0));
        let sid = SessionId::new();
        let used = seed(&store, sid, 1).await;
        broker.mark_used(&used);
        seed(&store, sid, 2).await;
        let (deferred, rand) = seed_with_rand(&store, sid, 3).await;

        let orch = orchestrator(store.clone(), broker);
        orch.open_session_with_id(sid, params()).unwrap();
        let report = orch.recover_session(sid).await.unwrap();
        assert_eq!(report.already_redeemed, 1);
        assert_eq!(report.redeemed, 1);
        assert_eq!(report.deferred, 1);

        assert!(matches!(
            orch.process(sid, deferred, Signature(vec![1u8; 64]), rand).await,
            Err(MicropayError::InvalidTicket { .. })
        ));
        assert_eq!(store.stored(sid).len(), 3);
    }
}

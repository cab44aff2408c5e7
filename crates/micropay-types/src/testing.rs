//! Deterministic test doubles for every collaborator trait.
//!
//! Each stub holds canned state plus switches to make individual calls
//! fail, and records the calls it received. **Never use in production.**

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    AccountManager, Address, Broker, BrokerError, RecipientRand, RoundsManager, SessionId,
    SigVerifier, Signature, SigningError, StoreError, StoredTicket, Ticket, TicketHash,
    TicketStore, Validator, ValidationError,
};

// ---------------------------------------------------------------------------
// StubTicketStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StubTicketStore {
    tickets: Mutex<HashMap<SessionId, Vec<StoredTicket>>>,
    store_should_fail: AtomicBool,
    load_should_fail: AtomicBool,
    store_calls: AtomicUsize,
}

impl StubTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_store_should_fail(&self, fail: bool) {
        self.store_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_should_fail(&self, fail: bool) {
        self.load_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self, session_id: SessionId) -> Vec<StoredTicket> {
        self.tickets
            .lock()
            .expect("stub lock poisoned")
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TicketStore for StubTicketStore {
    async fn store(
        &self,
        session_id: SessionId,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<(), StoreError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.store_should_fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("stub ticket store store error"));
        }
        self.tickets
            .lock()
            .expect("stub lock poisoned")
            .entry(session_id)
            .or_default()
            .push(StoredTicket {
                session_id,
                ticket: ticket.clone(),
                signature: signature.clone(),
                recipient_rand: recipient_rand.clone(),
            });
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Vec<StoredTicket>, StoreError> {
        if self.load_should_fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("stub ticket store load error"));
        }
        Ok(self.stored(session_id))
    }
}

// ---------------------------------------------------------------------------
// StubBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    deposits: HashMap<Address, Decimal>,
    penalty_escrows: HashMap<Address, Decimal>,
    used_tickets: HashSet<TicketHash>,
    approved_signers: HashSet<(Address, Address)>,
    scripted_redeem_errors: VecDeque<BrokerError>,
    redeem_log: Vec<TicketHash>,
    in_flight: HashMap<Address, usize>,
    max_in_flight: HashMap<Address, usize>,
}

/// In-memory ledger.
///
/// Redemption marks the ticket used and deducts its face value from the
/// sender's deposit. A second redemption of the same ticket fails with
/// [`BrokerError::AlreadyUsed`], as a real ledger would.
#[derive(Default)]
pub struct StubBroker {
    state: Mutex<BrokerState>,
    redeem_delay_ms: AtomicU64,
    get_deposit_should_fail: AtomicBool,
    get_penalty_escrow_should_fail: AtomicBool,
    get_deposit_calls: AtomicUsize,
}

impl StubBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("stub lock poisoned")
    }

    pub fn set_deposit(&self, addr: Address, amount: Decimal) {
        self.state().deposits.insert(addr, amount);
    }

    pub fn deposit(&self, addr: &Address) -> Decimal {
        self.state().deposits.get(addr).copied().unwrap_or_default()
    }

    pub fn set_penalty_escrow(&self, addr: Address, amount: Decimal) {
        self.state().penalty_escrows.insert(addr, amount);
    }

    pub fn approve_signers(&self, sender: Address, signers: &[Address]) {
        let mut state = self.state();
        for signer in signers {
            state.approved_signers.insert((sender, *signer));
        }
    }

    pub fn mark_used(&self, ticket: &Ticket) {
        self.state().used_tickets.insert(ticket.hash());
    }

    /// Queue errors returned by the next redemption calls, in order.
    pub fn script_redeem_errors(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.state().scripted_redeem_errors.extend(errors);
    }

    /// Make every redemption take this long before answering.
    pub fn set_redeem_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.redeem_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_get_deposit_should_fail(&self, fail: bool) {
        self.get_deposit_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_get_penalty_escrow_should_fail(&self, fail: bool) {
        self.get_penalty_escrow_should_fail
            .store(fail, Ordering::SeqCst);
    }

    /// Every redemption call received, in order, failures included.
    pub fn redeem_log(&self) -> Vec<TicketHash> {
        self.state().redeem_log.clone()
    }

    pub fn redeem_calls(&self) -> usize {
        self.state().redeem_log.len()
    }

    pub fn get_deposit_calls(&self) -> usize {
        self.get_deposit_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent redemptions observed for a sender.
    pub fn max_in_flight(&self, sender: &Address) -> usize {
        self.state().max_in_flight.get(sender).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Broker for StubBroker {
    async fn redeem_winning_ticket(
        &self,
        ticket: &Ticket,
        _signature: &Signature,
        _recipient_rand: &RecipientRand,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.redeem_log.push(ticket.hash());
            let in_flight = state.in_flight.entry(ticket.sender).or_insert(0);
            *in_flight += 1;
            let now = *in_flight;
            let max = state.max_in_flight.entry(ticket.sender).or_insert(0);
            *max = (*max).max(now);
        }

        let delay = self.redeem_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }

        let mut state = self.state();
        if let Some(n) = state.in_flight.get_mut(&ticket.sender) {
            *n -= 1;
        }
        if let Some(err) = state.scripted_redeem_errors.pop_front() {
            return Err(err);
        }
        let hash = ticket.hash();
        if state.used_tickets.contains(&hash) {
            return Err(BrokerError::AlreadyUsed);
        }
        let deposit = state.deposits.entry(ticket.sender).or_default();
        if *deposit < ticket.face_value {
            return Err(BrokerError::InsufficientDeposit);
        }
        *deposit -= ticket.face_value;
        state.used_tickets.insert(hash);
        Ok(())
    }

    async fn is_used_ticket(&self, ticket: &Ticket) -> Result<bool, BrokerError> {
        Ok(self.state().used_tickets.contains(&ticket.hash()))
    }

    async fn get_deposit(&self, address: &Address) -> Result<Decimal, BrokerError> {
        self.get_deposit_calls.fetch_add(1, Ordering::SeqCst);
        if self.get_deposit_should_fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(
                "stub broker get deposit error".to_string(),
            ));
        }
        Ok(self.deposit(address))
    }

    async fn get_penalty_escrow(&self, address: &Address) -> Result<Decimal, BrokerError> {
        if self.get_penalty_escrow_should_fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(
                "stub broker get penalty escrow error".to_string(),
            ));
        }
        Ok(self
            .state()
            .penalty_escrows
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn is_approved_signer(
        &self,
        sender: &Address,
        signer: &Address,
    ) -> Result<bool, BrokerError> {
        Ok(self.state().approved_signers.contains(&(*sender, *signer)))
    }
}

// ---------------------------------------------------------------------------
// StubValidator
// ---------------------------------------------------------------------------

pub struct StubValidator {
    is_valid_ticket: AtomicBool,
    is_winning_ticket: AtomicBool,
}

impl StubValidator {
    /// A validator that accepts every ticket and declares it a winner.
    pub fn new() -> Self {
        Self {
            is_valid_ticket: AtomicBool::new(true),
            is_winning_ticket: AtomicBool::new(true),
        }
    }

    pub fn set_is_valid_ticket(&self, valid: bool) {
        self.is_valid_ticket.store(valid, Ordering::SeqCst);
    }

    pub fn set_is_winning_ticket(&self, winning: bool) {
        self.is_winning_ticket.store(winning, Ordering::SeqCst);
    }
}

impl Default for StubValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for StubValidator {
    fn validate_ticket(
        &self,
        _ticket: &Ticket,
        _signature: &Signature,
        _recipient_rand: &RecipientRand,
    ) -> Result<(), ValidationError> {
        if self.is_valid_ticket.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ValidationError::Other(
                "stub validator invalid ticket error".to_string(),
            ))
        }
    }

    fn is_winning_ticket(
        &self,
        _ticket: &Ticket,
        _signature: &Signature,
        _recipient_rand: &RecipientRand,
    ) -> bool {
        self.is_winning_ticket.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// StubSigVerifier
// ---------------------------------------------------------------------------

pub struct StubSigVerifier {
    verify_result: AtomicBool,
}

impl StubSigVerifier {
    pub fn new(verify_result: bool) -> Self {
        Self {
            verify_result: AtomicBool::new(verify_result),
        }
    }

    pub fn set_verify_result(&self, result: bool) {
        self.verify_result.store(result, Ordering::SeqCst);
    }
}

impl SigVerifier for StubSigVerifier {
    fn verify(&self, _address: &Address, _message: &[u8], _signature: &Signature) -> bool {
        self.verify_result.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// StubAccountManager
// ---------------------------------------------------------------------------

pub struct StubAccountManager {
    account: Address,
    sign_response: Signature,
    sign_should_fail: AtomicBool,
    last_sign_request: Mutex<Option<Vec<u8>>>,
}

impl StubAccountManager {
    pub fn new(account: Address, sign_response: Signature) -> Self {
        Self {
            account,
            sign_response,
            sign_should_fail: AtomicBool::new(false),
            last_sign_request: Mutex::new(None),
        }
    }

    pub fn set_sign_should_fail(&self, fail: bool) {
        self.sign_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn last_sign_request(&self) -> Option<Vec<u8>> {
        self.last_sign_request
            .lock()
            .expect("stub lock poisoned")
            .clone()
    }
}

impl AccountManager for StubAccountManager {
    fn sign(&self, message: &[u8]) -> Result<Signature, SigningError> {
        *self.last_sign_request.lock().expect("stub lock poisoned") = Some(message.to_vec());
        if self.sign_should_fail.load(Ordering::SeqCst) {
            return Err(SigningError {
                reason: "stub returning error as requested".to_string(),
            });
        }
        Ok(self.sign_response.clone())
    }

    fn account(&self) -> Address {
        self.account
    }
}

// ---------------------------------------------------------------------------
// StubRounds
// ---------------------------------------------------------------------------

pub struct StubRounds {
    round: AtomicU64,
}

impl StubRounds {
    pub fn new(round: u64) -> Self {
        Self {
            round: AtomicU64::new(round),
        }
    }

    pub fn set_round(&self, round: u64) {
        self.round.store(round, Ordering::SeqCst);
    }
}

impl RoundsManager for StubRounds {
    fn last_initialized_round(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }
}

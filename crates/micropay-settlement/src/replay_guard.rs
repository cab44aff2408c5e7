//! Replay guard — which tickets this process has sent to the ledger.
//!
//! A redemption *claims* its ticket before the first ledger call and either
//! *confirms* the claim (ledger holds the ticket as used) or *releases* it
//! (rejected, retries exhausted, cancelled), so recovery may submit it again.
//!
//! Claims are indexed twice:
//!
//! - by [`TicketHash`], so the same ticket body is never sent twice;
//! - by redemption key `(sender, recipient_rand_hash, sender_nonce)`, so a
//!   sender cannot get a second, differently-bodied ticket redeemed against
//!   a nonce this process already spent for the same recipient secret.
//!
//! Only confirmed claims count against the capacity and are evicted, oldest
//! first. A claim whose redemption is still in flight is never evicted.
//! The ledger stays the system of record; after a restart the guard is
//! empty and the ledger's `AlreadyUsed` answer takes over.

use std::collections::{HashMap, VecDeque};

use micropay_types::{Address, MicropayError, Result, Ticket, TicketHash};

/// `(sender, recipient_rand_hash, sender_nonce)` of a ticket.
type RedemptionKey = (Address, [u8; 32], u64);

fn redemption_key(ticket: &Ticket) -> RedemptionKey {
    let (sender, nonce) = ticket.logical_key();
    (sender, ticket.recipient_rand_hash, nonce)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    InFlight,
    Confirmed,
}

#[derive(Debug)]
struct Claim {
    key: RedemptionKey,
    state: ClaimState,
}

/// Claims on tickets submitted for redemption by this process.
#[derive(Debug)]
pub struct ReplayGuard {
    claims: HashMap<TicketHash, Claim>,
    by_key: HashMap<RedemptionKey, TicketHash>,
    /// Confirmed claims, oldest first.
    confirmed: VecDeque<TicketHash>,
    capacity: usize,
}

impl ReplayGuard {
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay guard needs room for at least one ticket");
        Self {
            claims: HashMap::new(),
            by_key: HashMap::new(),
            confirmed: VecDeque::new(),
            capacity,
        }
    }

    /// Claim `ticket` before its first ledger submission.
    ///
    /// # Errors
    /// - `TicketAlreadySubmitted` if this ticket is already claimed
    /// - `InvalidTicket` if a different ticket holds the same redemption key
    pub fn claim(&mut self, ticket: &Ticket) -> Result<()> {
        let hash = ticket.hash();
        if self.claims.contains_key(&hash) {
            return Err(MicropayError::TicketAlreadySubmitted(hash));
        }
        let key = redemption_key(ticket);
        if let Some(holder) = self.by_key.get(&key) {
            return Err(MicropayError::InvalidTicket {
                reason: format!(
                    "sender nonce {} already redeemed by ticket {}",
                    ticket.sender_nonce,
                    holder.short()
                ),
            });
        }

        self.by_key.insert(key, hash);
        self.claims.insert(
            hash,
            Claim {
                key,
                state: ClaimState::InFlight,
            },
        );
        Ok(())
    }

    /// The ledger holds the ticket as used. The claim becomes evictable.
    pub fn confirm(&mut self, hash: &TicketHash) {
        let Some(claim) = self.claims.get_mut(hash) else {
            return;
        };
        if claim.state == ClaimState::Confirmed {
            return;
        }
        claim.state = ClaimState::Confirmed;
        self.confirmed.push_back(*hash);

        while self.confirmed.len() > self.capacity {
            let Some(oldest) = self.confirmed.pop_front() else {
                break;
            };
            if let Some(evicted) = self.claims.remove(&oldest) {
                self.by_key.remove(&evicted.key);
            }
        }
    }

    /// Drop an in-flight claim whose redemption did not go through.
    /// Confirmed claims are kept.
    pub fn release(&mut self, hash: &TicketHash) {
        if self
            .claims
            .get(hash)
            .is_some_and(|claim| claim.state == ClaimState::InFlight)
        {
            if let Some(claim) = self.claims.remove(hash) {
                self.by_key.remove(&claim.key);
            }
        }
    }

    /// Whether `hash` is claimed, in flight or confirmed.
    #[must_use]
    pub fn contains(&self, hash: &TicketHash) -> bool {
        self.claims.contains_key(hash)
    }

    /// Claims whose redemption has not finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.claims.len() - self.confirmed.len()
    }

    /// Confirmed claims currently remembered.
    #[must_use]
    pub fn confirmed(&self) -> usize {
        self.confirmed.len()
    }
}

#[cfg(test)]
mod tests {
    use micropay_types::{RecipientRand, WinProb};
    use rust_decimal::Decimal;

    use super::*;

    const ALICE: Address = Address([1u8; 32]);
    const RECIPIENT: Address = Address([9u8; 32]);

    fn ticket_with(nonce: u64, face_value: i64, rand: &RecipientRand) -> Ticket {
        Ticket::dummy(
            ALICE,
            RECIPIENT,
            Decimal::new(face_value, 0),
            WinProb::ALWAYS,
            nonce,
            rand,
        )
    }

    fn ticket(nonce: u64) -> Ticket {
        ticket_with(nonce, 100, &RecipientRand::from_bytes([7u8; 32]))
    }

    #[test]
    fn confirmed_ticket_cannot_be_sent_again() {
        let mut guard = ReplayGuard::new(10);
        let t = ticket(1);
        guard.claim(&t).unwrap();
        guard.confirm(&t.hash());

        let err = guard.claim(&t).unwrap_err();
        assert!(matches!(err, MicropayError::TicketAlreadySubmitted(h) if h == t.hash()));
        assert_eq!(guard.confirmed(), 1);
        assert_eq!(guard.in_flight(), 0);
    }

    #[test]
    fn ticket_in_flight_cannot_be_sent_again() {
        let mut guard = ReplayGuard::new(10);
        let t = ticket(1);
        guard.claim(&t).unwrap();
        assert!(guard.claim(&t).is_err());
        assert_eq!(guard.in_flight(), 1);
    }

    #[test]
    fn released_ticket_can_be_recovered() {
        let mut guard = ReplayGuard::new(10);
        let t = ticket(1);
        guard.claim(&t).unwrap();
        guard.release(&t.hash());
        assert!(!guard.contains(&t.hash()));

        // A later recovery pass resubmits and gets it through.
        guard.claim(&t).unwrap();
        guard.confirm(&t.hash());
        assert!(guard.contains(&t.hash()));
    }

    #[test]
    fn release_keeps_confirmed_claims() {
        let mut guard = ReplayGuard::new(10);
        let t = ticket(1);
        guard.claim(&t).unwrap();
        guard.confirm(&t.hash());
        guard.release(&t.hash());
        assert!(guard.contains(&t.hash()));
        assert!(guard.claim(&t).is_err());
    }

    #[test]
    fn reused_nonce_with_new_body_refused() {
        let mut guard = ReplayGuard::new(10);
        let rand = RecipientRand::from_bytes([7u8; 32]);
        let original = ticket_with(3, 100, &rand);
        let inflated = ticket_with(3, 500, &rand);
        guard.claim(&original).unwrap();
        guard.confirm(&original.hash());

        let err = guard.claim(&inflated).unwrap_err();
        assert!(matches!(err, MicropayError::InvalidTicket { .. }));
        assert!(!guard.contains(&inflated.hash()));
    }

    #[test]
    fn same_nonce_under_another_secret_allowed() {
        let mut guard = ReplayGuard::new(10);
        let first = ticket_with(1, 100, &RecipientRand::from_bytes([1u8; 32]));
        let second = ticket_with(1, 100, &RecipientRand::from_bytes([2u8; 32]));
        guard.claim(&first).unwrap();
        guard.claim(&second).unwrap();
        assert_eq!(guard.in_flight(), 2);
    }

    #[test]
    fn eviction_skips_redemptions_in_flight() {
        let mut guard = ReplayGuard::new(2);
        let slow = ticket(1);
        guard.claim(&slow).unwrap();

        for nonce in 2..=4 {
            let t = ticket(nonce);
            guard.claim(&t).unwrap();
            guard.confirm(&t.hash());
        }

        assert!(guard.contains(&slow.hash()), "in-flight claim must survive");
        assert!(!guard.contains(&ticket(2).hash()), "oldest confirmed evicted");
        assert!(guard.contains(&ticket(4).hash()));
        assert_eq!(guard.confirmed(), 2);

        // The evicted ticket's nonce is free again; the ledger has the final say.
        guard.claim(&ticket(2)).unwrap();
    }

    #[test]
    #[should_panic(expected = "at least one ticket")]
    fn zero_capacity_rejected() {
        let _ = ReplayGuard::new(0);
    }
}

//! Ticket validator — hard gate for structural and cryptographic checks.
//!
//! Every ticket handed to the orchestrator passes through a [`Validator`]
//! before any state is touched. This is the production implementation.
//!
//! ## Design Principles
//!
//! - **Fail-closed**: any check that cannot pass rejects the ticket
//! - **Stateless**: session-scoped facts (nonces, negotiated terms) are
//!   checked by the orchestrator, not here
//! - **Commitment first**: a secret that does not open the commitment is
//!   rejected regardless of whether the ticket would have won

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use micropay_types::{
    AccountManager, Address, RecipientRand, SigVerifier, Signature, SigningError, Ticket,
    ValidationError, Validator,
};

use crate::evaluator;

/// Production validator for tickets paid to `recipient`.
pub struct TicketValidator<V> {
    /// The address tickets must be made out to.
    recipient: Address,
    /// Verifies the sender's signature over the ticket hash.
    sig_verifier: V,
}

impl<V: SigVerifier> TicketValidator<V> {
    #[must_use]
    pub fn new(recipient: Address, sig_verifier: V) -> Self {
        Self {
            recipient,
            sig_verifier,
        }
    }

    /// The recipient address this validator accepts tickets for.
    #[must_use]
    pub fn recipient(&self) -> Address {
        self.recipient
    }
}

impl<V: SigVerifier> Validator for TicketValidator<V> {
    fn validate_ticket(
        &self,
        ticket: &Ticket,
        signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> Result<(), ValidationError> {
        // 1. Structure
        if ticket.sender.is_zero() {
            return Err(ValidationError::ZeroSender);
        }
        if ticket.recipient != self.recipient {
            return Err(ValidationError::WrongRecipient {
                expected: self.recipient.to_string(),
                actual: ticket.recipient.to_string(),
            });
        }
        if ticket.face_value.is_zero() || ticket.face_value.is_sign_negative() {
            return Err(ValidationError::NonPositiveFaceValue);
        }
        if ticket.win_prob.is_zero() {
            return Err(ValidationError::ZeroWinProb);
        }
        if ticket.expiration_round <= ticket.creation_round {
            return Err(ValidationError::BadRoundWindow {
                creation_round: ticket.creation_round,
                expiration_round: ticket.expiration_round,
            });
        }

        // 2. Commitment
        if !ticket.commitment_matches(recipient_rand) {
            return Err(ValidationError::CommitmentMismatch);
        }

        // 3. Signature over the canonical identity
        if !self
            .sig_verifier
            .verify(&ticket.sender, ticket.hash().as_bytes(), signature)
        {
            return Err(ValidationError::InvalidSignature);
        }

        Ok(())
    }

    fn is_winning_ticket(
        &self,
        ticket: &Ticket,
        _signature: &Signature,
        recipient_rand: &RecipientRand,
    ) -> bool {
        evaluator::is_winning(ticket, recipient_rand)
    }
}

// ---------------------------------------------------------------------------
// ed25519
// ---------------------------------------------------------------------------

/// Verifies ed25519 signatures; an [`Address`] is the public key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519SigVerifier;

impl SigVerifier for Ed25519SigVerifier {
    fn verify(&self, address: &Address, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(address.as_bytes()) else {
            return false;
        };
        let Ok(sig) = Ed25519Signature::from_slice(signature.as_bytes()) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

/// Holds an ed25519 signing key in process memory.
pub struct Ed25519AccountManager {
    key: SigningKey,
}

impl Ed25519AccountManager {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }
}

impl AccountManager for Ed25519AccountManager {
    fn sign(&self, message: &[u8]) -> Result<Signature, SigningError> {
        Ok(Signature(self.key.sign(message).to_bytes().to_vec()))
    }

    fn account(&self) -> Address {
        Address::from_pubkey(self.key.verifying_key().to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use micropay_types::{WinProb, testing::StubSigVerifier};
    use rust_decimal::Decimal;

    use super::*;

    struct Fixture {
        sender: Ed25519AccountManager,
        recipient: Address,
        rand: RecipientRand,
        ticket: Ticket,
    }

    fn fixture() -> Fixture {
        let sender = Ed25519AccountManager::from_secret_bytes(&[11u8; 32]);
        let recipient = Ed25519AccountManager::from_secret_bytes(&[22u8; 32]).account();
        let rand = RecipientRand([5u8; 32]);
        let ticket = Ticket::dummy(
            sender.account(),
            recipient,
            Decimal::new(100, 0),
            WinProb::ALWAYS,
            1,
            &rand,
        );
        Fixture {
            sender,
            recipient,
            rand,
            ticket,
        }
    }

    fn sign(am: &Ed25519AccountManager, ticket: &Ticket) -> Signature {
        am.sign(ticket.hash().as_bytes()).unwrap()
    }

    #[test]
    fn valid_ticket_passes() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let sig = sign(&f.sender, &f.ticket);
        assert!(v.validate_ticket(&f.ticket, &sig, &f.rand).is_ok());
    }

    #[test]
    fn wrong_secret_rejected_even_if_winning() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let sig = sign(&f.sender, &f.ticket);
        let other = RecipientRand([6u8; 32]);
        let err = v.validate_ticket(&f.ticket, &sig, &other).unwrap_err();
        assert_eq!(err, ValidationError::CommitmentMismatch);
    }

    #[test]
    fn wrong_secret_always_rejected() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, StubSigVerifier::new(true));
        for _ in 0..32 {
            let other = RecipientRand::random();
            assert!(v.validate_ticket(&f.ticket, &Signature(vec![]), &other).is_err());
        }
    }

    #[test]
    fn tampered_ticket_fails_signature() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let sig = sign(&f.sender, &f.ticket);
        let mut tampered = f.ticket.clone();
        tampered.face_value = Decimal::new(1_000_000, 0);
        let err = v.validate_ticket(&tampered, &sig, &f.rand).unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn signature_from_other_key_rejected() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let mallory = Ed25519AccountManager::from_secret_bytes(&[33u8; 32]);
        let sig = sign(&mallory, &f.ticket);
        assert_eq!(
            v.validate_ticket(&f.ticket, &sig, &f.rand).unwrap_err(),
            ValidationError::InvalidSignature
        );
    }

    #[test]
    fn garbage_signature_rejected() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let err = v
            .validate_ticket(&f.ticket, &Signature(vec![1, 2, 3]), &f.rand)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn wrong_recipient_rejected() {
        let f = fixture();
        let v = TicketValidator::new(Address([9u8; 32]), StubSigVerifier::new(true));
        let err = v
            .validate_ticket(&f.ticket, &Signature(vec![]), &f.rand)
            .unwrap_err();
        assert!(matches!(err, ValidationError::WrongRecipient { .. }));
    }

    #[test]
    fn structural_checks() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, StubSigVerifier::new(true));
        let sig = Signature(vec![]);

        let mut t = f.ticket.clone();
        t.sender = Address::ZERO;
        assert_eq!(
            v.validate_ticket(&t, &sig, &f.rand).unwrap_err(),
            ValidationError::ZeroSender
        );

        let mut t = f.ticket.clone();
        t.face_value = Decimal::ZERO;
        assert_eq!(
            v.validate_ticket(&t, &sig, &f.rand).unwrap_err(),
            ValidationError::NonPositiveFaceValue
        );

        let mut t = f.ticket.clone();
        t.win_prob = WinProb::NEVER;
        assert_eq!(
            v.validate_ticket(&t, &sig, &f.rand).unwrap_err(),
            ValidationError::ZeroWinProb
        );

        let mut t = f.ticket.clone();
        t.expiration_round = t.creation_round;
        assert!(matches!(
            v.validate_ticket(&t, &sig, &f.rand).unwrap_err(),
            ValidationError::BadRoundWindow { .. }
        ));
    }

    #[test]
    fn winning_delegates_to_evaluator() {
        let f = fixture();
        let v = TicketValidator::new(f.recipient, Ed25519SigVerifier);
        let sig = sign(&f.sender, &f.ticket);
        assert_eq!(
            v.is_winning_ticket(&f.ticket, &sig, &f.rand),
            evaluator::is_winning(&f.ticket, &f.rand)
        );
        let mut never = f.ticket.clone();
        never.win_prob = WinProb::NEVER;
        assert!(!v.is_winning_ticket(&never, &sig, &f.rand));
    }

    #[test]
    fn account_manager_roundtrip() {
        let am = Ed25519AccountManager::from_secret_bytes(&[44u8; 32]);
        let sig = am.sign(b"receipt").unwrap();
        assert!(Ed25519SigVerifier.verify(&am.account(), b"receipt", &sig));
        assert!(!Ed25519SigVerifier.verify(&am.account(), b"other", &sig));
    }
}

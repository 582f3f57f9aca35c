//! Simulated acquiring bank.
//!
//! Outcomes are a pure function of the card number so every flow is
//! reproducible in tests: PAN ending in 0 is declined, PAN ending in 9
//! demands a 3-D Secure challenge, anything else is approved. Calls carry a
//! synthetic processing delay derived from the PAN and run under the
//! configured timeout; exceeding it surfaces as a retryable network error.

use crate::errors::Error;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const CARD_DECLINED: &str = "CARD_DECLINED";

/// Card data posted back from the hosted form. Consumed during
/// authorization, never persisted anywhere.
#[derive(Clone)]
pub struct CardData {
    pub pan: String,
    pub exp_date: String,
    pub cvv: String,
    pub card_holder: Option<String>,
}

impl fmt::Debug for CardData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CardData")
            .field("pan", &mask_pan(&self.pan))
            .field("exp_date", &self.exp_date)
            .field("cvv", &"***")
            .field("card_holder", &self.card_holder)
            .finish()
    }
}

/// First-4/last-4 masking for logs and messages.
pub fn mask_pan(pan: &str) -> String {
    if pan.len() < 12 {
        return s!("****");
    }
    format!("{}********{}", &pan[..4], &pan[pan.len() - 4..])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankOutcome {
    Approved,
    Declined,
    ThreeDsRequired,
}

#[derive(Debug, Clone)]
pub struct BankResponse {
    pub outcome: BankOutcome,
    pub external_ref: String,
    pub response_code: String,
    pub response_message: String,
    pub delay_ms: u64,
    pub fraud_score: i32,
}

#[derive(Clone)]
pub struct BankSimulator {
    timeout: Duration,
}

impl BankSimulator {
    pub fn new(timeout: Duration) -> Self {
        BankSimulator { timeout }
    }

    fn digit_sum(pan: &str) -> u64 {
        pan.bytes()
            .filter(u8::is_ascii_digit)
            .map(|b| (b - b'0') as u64)
            .sum()
    }

    fn delay_for(pan: &str) -> Duration {
        Duration::from_millis((Self::digit_sum(pan) * 3).clamp(1, 250))
    }

    fn fraud_score_for(pan: &str) -> i32 {
        ((Self::digit_sum(pan) * 7) % 100) as i32
    }

    fn external_ref() -> String {
        format!("bank-{}", Uuid::new_v4().simple())
    }

    async fn respond(&self, pan: &str, outcome: BankOutcome) -> Result<BankResponse, Error> {
        let delay = Self::delay_for(pan);
        let work = async {
            tokio::time::sleep(delay).await;
            let (code, message) = match outcome {
                BankOutcome::Approved => ("00", "approved"),
                BankOutcome::Declined => ("05", "do not honor"),
                BankOutcome::ThreeDsRequired => ("3D", "3-D Secure challenge required"),
            };
            Ok(BankResponse {
                outcome,
                external_ref: Self::external_ref(),
                response_code: s!(code),
                response_message: s!(message),
                delay_ms: delay.as_millis() as u64,
                fraud_score: Self::fraud_score_for(pan),
            })
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| Error::Network(s!("bank call timed out")))?
    }

    pub async fn authorize(&self, card: &CardData, _amount: i64) -> Result<BankResponse, Error> {
        let outcome = match card.pan.bytes().last() {
            Some(b'0') => BankOutcome::Declined,
            Some(b'9') => BankOutcome::ThreeDsRequired,
            _ => BankOutcome::Approved,
        };
        self.respond(&card.pan, outcome).await
    }

    /// ACS completion after a 3-D Secure challenge.
    pub async fn complete_three_ds(&self, card: &CardData) -> Result<BankResponse, Error> {
        self.respond(&card.pan, BankOutcome::Approved).await
    }

    pub async fn capture(&self, external_ref: &str, _amount: i64) -> Result<BankResponse, Error> {
        self.respond(external_ref, BankOutcome::Approved).await
    }

    pub async fn refund(&self, external_ref: &str, _amount: i64) -> Result<BankResponse, Error> {
        self.respond(external_ref, BankOutcome::Approved).await
    }

    pub async fn reverse(&self, external_ref: &str, _amount: i64) -> Result<BankResponse, Error> {
        self.respond(external_ref, BankOutcome::Approved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(pan: &str) -> CardData {
        CardData {
            pan: s!(pan),
            exp_date: s!("12/39"),
            cvv: s!("123"),
            card_holder: None,
        }
    }

    fn simulator() -> BankSimulator {
        BankSimulator::new(Duration::from_secs(5))
    }

    #[actix_rt::test]
    async fn approves_ordinary_pans() {
        let resp = simulator()
            .authorize(&card("4111111111111111"), 100_000)
            .await
            .unwrap();
        assert_eq!(resp.outcome, BankOutcome::Approved);
        assert_eq!(resp.response_code, "00");
        assert!(!resp.external_ref.is_empty());
    }

    #[actix_rt::test]
    async fn declines_pans_ending_in_zero() {
        let resp = simulator()
            .authorize(&card("4000000000000000"), 100_000)
            .await
            .unwrap();
        assert_eq!(resp.outcome, BankOutcome::Declined);
        assert_eq!(resp.response_code, "05");
    }

    #[actix_rt::test]
    async fn challenges_pans_ending_in_nine() {
        let resp = simulator()
            .authorize(&card("4000000000000009"), 100_000)
            .await
            .unwrap();
        assert_eq!(resp.outcome, BankOutcome::ThreeDsRequired);
    }

    #[actix_rt::test]
    async fn outcome_is_deterministic() {
        let sim = simulator();
        let first = sim.authorize(&card("4276000000000015"), 5_000).await.unwrap();
        let second = sim.authorize(&card("4276000000000015"), 5_000).await.unwrap();
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.fraud_score, second.fraud_score);
        assert_eq!(first.delay_ms, second.delay_ms);
        // stream ids stay unique per call
        assert_ne!(first.external_ref, second.external_ref);
    }

    #[actix_rt::test]
    async fn zero_timeout_is_a_network_error() {
        let sim = BankSimulator::new(Duration::from_millis(0));
        match sim.authorize(&card("4111111111111111"), 1_000).await {
            Err(Error::Network(_)) => {}
            other => panic!("expected network error, got {:?}", other.map(|r| r.outcome)),
        }
    }

    #[test]
    fn pan_masking() {
        assert_eq!(mask_pan("4111111111111111"), "4111********1111");
        assert_eq!(mask_pan("4111"), "****");
    }
}

//! Webhook delivery.
//!
//! One notification row is one attempt stream: the sweep in `cron` hands
//! the head of each payment's queue to [`deliver`], which signs the exact
//! payload bytes and POSTs them to the merchant callback. Non-2xx and
//! transport errors retry on an exponential schedule; 4xx responses other
//! than 408/429 kill the stream.

use crate::models::Notification;
use crate::sign;
use awc::Client;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const MAX_DELIVERY_ATTEMPTS: i32 = 7;

/// Retries never stretch past this horizon.
const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct DeliveryFailure {
    pub permanent: bool,
    pub error: String,
}

/// True when an HTTP status terminates the attempt stream.
pub fn permanent_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

/// `base * 2^attempt` plus up to half a base of jitter, capped at 24 h.
pub fn next_backoff(attempt: i32, base: Duration) -> Duration {
    let shift = attempt.clamp(0, 20) as u32;
    let exponential = base.as_secs().saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=base.as_secs().max(2) / 2);
    Duration::from_secs(exponential.saturating_add(jitter)).min(BACKOFF_CEILING)
}

pub async fn deliver(
    client: &Client,
    notification: &Notification,
    secret: &str,
) -> Result<(), DeliveryFailure> {
    // serde_json orders object keys, so these bytes are stable across
    // retries and the signature always matches the body on the wire
    let body = notification.payload.to_string();
    let signature = sign::hmac_sha256_hex(secret.as_bytes(), body.as_bytes());

    let result = client
        .post(notification.callback_url.as_str())
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Webhook-Signature", signature))
        .insert_header(("X-Webhook-Event", notification.event.as_str()))
        .insert_header(("X-Webhook-Delivery", s!(notification.id)))
        .send_body(body)
        .await;

    match result {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(DeliveryFailure {
            permanent: permanent_status(response.status().as_u16()),
            error: format!("callback returned {}", response.status()),
        }),
        Err(e) => Err(DeliveryFailure {
            permanent: false,
            error: s!(e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent_except_retryable_ones() {
        assert!(permanent_status(400));
        assert!(permanent_status(403));
        assert!(permanent_status(404));
        assert!(permanent_status(410));
        assert!(!permanent_status(408));
        assert!(!permanent_status(429));
        assert!(!permanent_status(500));
        assert!(!permanent_status(502));
        assert!(!permanent_status(200));
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let base = Duration::from_secs(30);
        for attempt in 0..MAX_DELIVERY_ATTEMPTS {
            let exact = 30u64 << attempt as u32;
            let delay = next_backoff(attempt, base).as_secs();
            assert!(
                (exact..=exact + 15).contains(&delay),
                "attempt {}: {}s outside [{}, {}]",
                attempt,
                delay,
                exact,
                exact + 15
            );
        }
    }

    #[test]
    fn backoff_is_capped_at_a_day() {
        let delay = next_backoff(40, Duration::from_secs(30));
        assert_eq!(delay, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn whole_schedule_fits_the_24h_budget() {
        let base = Duration::from_secs(30);
        let total: u64 = (0..MAX_DELIVERY_ATTEMPTS)
            .map(|attempt| next_backoff(attempt, base).as_secs())
            .sum();
        assert!(total <= 24 * 60 * 60);
    }
}

//! Merchant resolution and request authentication.
//!
//! Lookup goes through a short-lived in-memory cache (the directory is
//! read-mostly); auth-outcome accounting always hits the store and drops
//! the cached entry so lockout state is never served stale.

use crate::db::{DbExecutor, GetMerchant, LockoutPolicy, RecordAuthOutcome};
use crate::errors::Error;
use crate::models::Merchant;
use crate::sign;
use crate::validators;
use actix::Addr;
use chrono::Utc;
use log::{debug, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MERCHANT_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct MerchantDirectory {
    db: Addr<DbExecutor>,
    cache: RwLock<HashMap<String, (Merchant, Instant)>>,
    policy: LockoutPolicy,
}

impl MerchantDirectory {
    pub fn new(db: Addr<DbExecutor>, policy: LockoutPolicy) -> Self {
        MerchantDirectory {
            db,
            cache: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub async fn lookup(&self, team_slug: &str) -> Result<Merchant, Error> {
        if let Some((merchant, cached_at)) = self.cache.read().get(team_slug) {
            if cached_at.elapsed() < MERCHANT_CACHE_TTL {
                return Ok(merchant.clone());
            }
        }
        let merchant = self
            .db
            .send(GetMerchant {
                team_slug: s!(team_slug),
            })
            .await??;
        self.cache
            .write()
            .insert(s!(team_slug), (merchant.clone(), Instant::now()));
        Ok(merchant)
    }

    fn invalidate(&self, team_slug: &str) {
        self.cache.write().remove(team_slug);
    }

    async fn record_outcome(&self, team_slug: &str, success: bool) {
        let result = self
            .db
            .send(RecordAuthOutcome {
                team_slug: s!(team_slug),
                success,
                policy: self.policy.clone(),
            })
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("cannot record auth outcome for {}: {}", team_slug, e),
            Err(e) => warn!("cannot record auth outcome for {}: {}", team_slug, e),
        }
        self.invalidate(team_slug);
    }

    /// Full request authentication: syntactic pre-check, slug lookup,
    /// lockout gate, constant-time token verification, outcome accounting.
    /// Nothing about the request is mutated or persisted before this
    /// returns `Ok`.
    pub async fn authenticate(&self, body: &Value) -> Result<Merchant, Error> {
        let params = match body.as_object() {
            Some(params) => params,
            None => return Err(Error::InvalidToken),
        };
        let team_slug = params.get("teamSlug").and_then(Value::as_str).unwrap_or("");
        let token = params.get("token").and_then(Value::as_str).unwrap_or("");
        if !validators::slug_ok(team_slug) || !validators::token_ok(token) {
            return Err(Error::InvalidToken);
        }

        let merchant = self.lookup(team_slug).await?;
        if merchant.is_locked(Utc::now().naive_utc()) {
            return Err(Error::MerchantLocked(s!(team_slug)));
        }

        if !sign::verify(params, token, &merchant.password) {
            debug!("token mismatch for merchant {}", team_slug);
            self.record_outcome(team_slug, false).await;
            return Err(Error::InvalidToken);
        }
        self.record_outcome(team_slug, true).await;
        Ok(merchant)
    }
}

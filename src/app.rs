use crate::auth::MerchantDirectory;
use crate::bank::BankSimulator;
use crate::cron::{Cron, CronConfig};
use crate::db::{DbExecutor, LockoutPolicy};
use crate::fsm::{Fsm, PaymentLocks};
use crate::handlers::{form, payment};
use crate::idempotency::IdempotencyCache;
use actix::prelude::*;
use actix_web::web;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppCfg {
    pub host: String,
    pub domain: String,
    pub database_url: String,
    pub csrf_key: String,
    pub bank_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub cron: CronConfig,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl AppCfg {
    /// All knobs come from the environment; only the database URL and the
    /// CSRF key have no workable default.
    pub fn from_env() -> Self {
        let mut cron = CronConfig::default();
        cron.reaper_interval = Duration::from_secs(env_u64("REAPER_INTERVAL_SECS", 30));
        cron.backoff_base = Duration::from_secs(env_u64("NOTIFY_BACKOFF_BASE_SECS", 30));
        cron.max_delivery_attempts = env_u64("NOTIFY_MAX_ATTEMPTS", 7) as i32;

        AppCfg {
            host: env::var("HOST").unwrap_or_else(|_| s!("0.0.0.0:3000")),
            domain: env::var("DOMAIN").unwrap_or_else(|_| s!("http://localhost:3000")),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            csrf_key: env::var("CSRF_KEY").expect("CSRF_KEY must be set"),
            bank_timeout: Duration::from_millis(env_u64("BANK_TIMEOUT_MS", 5_000)),
            idempotency_ttl: Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS", 24 * 60 * 60)),
            cron,
        }
    }
}

pub struct AppState {
    pub db: Addr<DbExecutor>,
    pub fsm: Addr<Fsm>,
    pub directory: MerchantDirectory,
    pub idempotency: IdempotencyCache,
    pub cfg: AppCfg,
}

impl AppState {
    /// Wires the actor topology: a pool of sync store executors, the
    /// orchestrator, and the cron sweeps. Must run inside an actix system.
    pub fn new(cfg: AppCfg, pool: Pool<ConnectionManager<PgConnection>>) -> Self {
        let db: Addr<DbExecutor> = {
            let pool = pool.clone();
            SyncArbiter::start(num_cpus::get(), move || DbExecutor(pool.clone()))
        };
        let bank = BankSimulator::new(cfg.bank_timeout);
        let fsm = Fsm {
            db: db.clone(),
            bank,
            locks: PaymentLocks::default(),
        }
        .start();
        let _cron = Cron::new(db.clone(), fsm.clone(), cfg.cron.clone()).start();
        let directory = MerchantDirectory::new(db.clone(), LockoutPolicy::default());
        AppState {
            db,
            fsm,
            directory,
            idempotency: IdempotencyCache::new(cfg.idempotency_ttl),
            cfg,
        }
    }
}

pub fn routing(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/paymentinit/init").route(web::post().to(payment::init)))
        .service(
            web::resource("/paymentform/process").route(web::post().to(form::process_form)),
        )
        .service(
            web::resource("/paymentform/{payment_id}").route(web::get().to(form::show_form)),
        )
        .service(web::resource("/paymentconfirm/confirm").route(web::post().to(payment::confirm)))
        .service(web::resource("/paymentcancel/cancel").route(web::post().to(payment::cancel)))
        .service(web::resource("/paymentcheck/check").route(web::post().to(payment::check)));
}

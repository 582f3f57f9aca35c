//! Database-backed test fixtures.
//!
//! Everything here keys off `TEST_DATABASE_URL`; when it is unset the
//! helpers return `None` and the callers skip themselves, so the suite
//! stays green on machines without Postgres.

use crate::db::{self, CreatePayment, NewMerchant};
use crate::models::{Merchant, PayType};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::MigrationHarness;
use std::env;

// advisory-lock key fencing parallel test binaries racing migrations
const MIGRATION_LOCK: i64 = 715_001;

pub fn test_pool() -> Option<Pool<ConnectionManager<PgConnection>>> {
    let database_url = env::var("TEST_DATABASE_URL").ok()?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .max_size(4)
        .build(manager)
        .expect("Failed to create test pool.");
    let mut conn = pool.get().expect("cannot check out a test connection");
    diesel::sql_query(format!("SELECT pg_advisory_lock({})", MIGRATION_LOCK))
        .execute(&mut conn)
        .expect("cannot take the migration lock");
    let outcome = conn.run_pending_migrations(db::MIGRATIONS).map(|_| ());
    diesel::sql_query(format!("SELECT pg_advisory_unlock({})", MIGRATION_LOCK))
        .execute(&mut conn)
        .expect("cannot release the migration lock");
    outcome.expect("cannot run migrations on the test database");
    Some(pool)
}

pub fn test_conn() -> Option<PooledConnection<ConnectionManager<PgConnection>>> {
    test_pool().map(|pool| pool.get().expect("cannot check out a test connection"))
}

/// Unique-ish merchant for one test; `test_transaction` rolls it back.
pub fn test_merchant(conn: &mut PgConnection, slug: &str) -> Merchant {
    db::create_merchant(
        NewMerchant {
            team_slug: s!(slug),
            password: s!("secret123"),
            supported_currencies: vec![s!("RUB"), s!("USD")],
            notification_url: Some(s!("https://merchant.example.com/webhook")),
        },
        conn,
    )
    .expect("cannot create test merchant")
}

pub fn new_payment_msg(merchant: &Merchant, order_id: &str, amount: i64) -> CreatePayment {
    CreatePayment {
        team_slug: merchant.team_slug.clone(),
        order_id: s!(order_id),
        amount,
        currency: s!("RUB"),
        pay_type: PayType::SingleStage,
        description: Some(s!("test payment")),
        customer_key: None,
        recurrent: false,
        language: s!("en"),
        success_url: None,
        fail_url: None,
        notification_url: merchant.notification_url.clone(),
        payment_expiry: 30,
        data: None,
    }
}

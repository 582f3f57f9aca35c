use crate::errors::Error;
use crate::fsm::guard_transition;
use crate::models::{
    BankTxStatus, BankTxType, Merchant, NewStateTransition, Notification, Payment, PaymentStatus,
    PayType, StateTransition, Transaction, DEFAULT_MAX_ATTEMPTS, MAX_PAYMENT_EXPIRY_MINUTES,
};
use actix::{Actor, Handler, Message, SyncContext};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{self, prelude::*};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use log::info;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// How many times a fresh payment id is rolled on the astronomically
/// unlikely primary-key collision.
const PAYMENT_ID_RETRIES: usize = 3;

pub struct DbExecutor(pub Pool<ConnectionManager<PgConnection>>);

impl Actor for DbExecutor {
    type Context = SyncContext<Self>;
}

pub fn generate_payment_id() -> String {
    let mut rng = thread_rng();
    let mut id = String::with_capacity(20);
    id.push(char::from(b'1' + rng.gen_range(0..9u8)));
    for _ in 1..20 {
        id.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    id
}

#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    pub max_failures: i32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        LockoutPolicy {
            max_failures: 5,
            window: Duration::minutes(15),
            cooldown: Duration::minutes(15),
        }
    }
}

#[derive(Debug)]
pub struct GetMerchant {
    pub team_slug: String,
}

impl Message for GetMerchant {
    type Result = Result<Merchant, Error>;
}

impl Handler<GetMerchant> for DbExecutor {
    type Result = Result<Merchant, Error>;

    fn handle(&mut self, msg: GetMerchant, _: &mut Self::Context) -> Self::Result {
        let conn = &mut self.0.get()?;
        get_merchant(&msg.team_slug, conn)
    }
}

pub fn get_merchant(slug: &str, conn: &mut PgConnection) -> Result<Merchant, Error> {
    use crate::schema::merchants::dsl::*;
    merchants
        .find(slug)
        .first(conn)
        .optional()?
        .ok_or_else(|| Error::MerchantNotFound(s!(slug)))
}

#[derive(Debug)]
pub struct RecordAuthOutcome {
    pub team_slug: String,
    pub success: bool,
    pub policy: LockoutPolicy,
}

impl Message for RecordAuthOutcome {
    type Result = Result<(), Error>;
}

impl Handler<RecordAuthOutcome> for DbExecutor {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: RecordAuthOutcome, _: &mut Self::Context) -> Self::Result {
        let conn = &mut self.0.get()?;
        record_auth_outcome(&msg, conn)
    }
}

pub fn record_auth_outcome(msg: &RecordAuthOutcome, conn: &mut PgConnection) -> Result<(), Error> {
    use crate::schema::merchants::dsl::*;
    let now = Utc::now().naive_utc();
    conn.transaction::<_, Error, _>(|conn| {
        let merchant: Merchant = merchants
            .find(&msg.team_slug)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| Error::MerchantNotFound(msg.team_slug.clone()))?;

        if msg.success {
            diesel::update(merchants.find(&merchant.team_slug))
                .set((
                    failed_auth_attempts.eq(0),
                    locked_until.eq(None::<NaiveDateTime>),
                    last_auth_at.eq(now),
                ))
                .execute(conn)?;
            return Ok(());
        }

        let within_window = merchant
            .last_auth_at
            .map(|at| now - at <= msg.policy.window)
            .unwrap_or(false);
        let failures = if within_window {
            merchant.failed_auth_attempts + 1
        } else {
            1
        };
        let lock = if failures >= msg.policy.max_failures {
            info!(
                "locking merchant {} after {} consecutive auth failures",
                merchant.team_slug, failures
            );
            Some(now + msg.policy.cooldown)
        } else {
            merchant.locked_until
        };
        diesel::update(merchants.find(&merchant.team_slug))
            .set((
                failed_auth_attempts.eq(failures),
                locked_until.eq(lock),
                last_auth_at.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    })
}

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub team_slug: String,
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub pay_type: PayType,
    pub description: Option<String>,
    pub customer_key: Option<String>,
    pub recurrent: bool,
    pub language: String,
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
    pub notification_url: Option<String>,
    pub payment_expiry: i32,
    pub data: Option<Value>,
}

impl Message for CreatePayment {
    type Result = Result<Payment, Error>;
}

impl Handler<CreatePayment> for DbExecutor {
    type Result = Result<Payment, Error>;

    fn handle(&mut self, msg: CreatePayment, _: &mut Self::Context) -> Self::Result {
        let conn = &mut self.0.get()?;
        create_payment(&msg, conn)
    }
}

pub fn create_payment(msg: &CreatePayment, conn: &mut PgConnection) -> Result<Payment, Error> {
    use crate::schema::payments;
    let now = Utc::now().naive_utc();

    for _ in 0..PAYMENT_ID_RETRIES {
        let payment = Payment {
            id: generate_payment_id(),
            team_slug: msg.team_slug.clone(),
            order_id: msg.order_id.clone(),
            amount: msg.amount,
            refunded_amount: 0,
            currency: msg.currency.clone(),
            pay_type: msg.pay_type,
            status: PaymentStatus::Init,
            description: msg.description.clone(),
            customer_key: msg.customer_key.clone(),
            recurrent: msg.recurrent,
            language: msg.language.clone(),
            success_url: msg.success_url.clone(),
            fail_url: msg.fail_url.clone(),
            notification_url: msg.notification_url.clone(),
            payment_expiry: msg.payment_expiry.clamp(1, MAX_PAYMENT_EXPIRY_MINUTES),
            expires_at: None,
            error_code: None,
            message: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            data: msg.data.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        match diesel::insert_into(payments::table)
            .values(&payment)
            .get_result::<Payment>(conn)
        {
            Ok(created) => return Ok(created),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, details)) => {
                if details.constraint_name() == Some("payments_pkey") {
                    continue;
                }
                return Err(Error::DuplicateOrderId(msg.order_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Internal(s!("cannot allocate a unique payment id")))
}

#[derive(Debug)]
pub struct GetPayment {
    pub payment_id: String,
}

impl Message for GetPayment {
    type Result = Result<Payment, Error>;
}

impl Handler<GetPayment> for DbExecutor {
    type Result = Result<Payment, Error>;

    fn handle(&mut self, msg: GetPayment, _: &mut Self::Context) -> Self::Result {
        use crate::schema::payments::dsl::*;
        let conn = &mut self.0.get()?;
        payments
            .find(&msg.payment_id)
            .first(conn)
            .optional()?
            .ok_or(Error::PaymentNotFound(msg.payment_id))
    }
}

#[derive(Debug)]
pub struct FindByOrderId {
    pub team_slug: String,
    pub order_id: String,
}

impl Message for FindByOrderId {
    type Result = Result<Payment, Error>;
}

impl Handler<FindByOrderId> for DbExecutor {
    type Result = Result<Payment, Error>;

    fn handle(&mut self, msg: FindByOrderId, _: &mut Self::Context) -> Self::Result {
        use crate::schema::payments::dsl::*;
        let conn = &mut self.0.get()?;
        payments
            .filter(team_slug.eq(&msg.team_slug))
            .filter(order_id.eq(&msg.order_id))
            .first(conn)
            .optional()?
            .ok_or(Error::PaymentNotFound(msg.order_id))
    }
}

/// Webhook body for one accepted transition. `serde_json` keeps object
/// keys sorted, so the serialized bytes are stable across retries and the
/// delivery signature always matches what went over the wire.
pub fn notification_payload(
    payment: &Payment,
    notification_id: Uuid,
    now: NaiveDateTime,
) -> Value {
    let timestamp = DateTime::<Utc>::from_naive_utc_and_offset(now, Utc).to_rfc3339();
    json!({
        "paymentId": payment.id,
        "orderId": payment.order_id,
        "status": s!(payment.status),
        "amount": payment.amount,
        "currency": payment.currency,
        "timestamp": timestamp,
        "attemptId": s!(notification_id),
    })
}

/// Field updates stamped by specific transitions.
#[derive(Debug, Default, Clone)]
pub struct TransitionChanges {
    /// `INIT -> NEW` stamps `expires_at = created_at + payment_expiry`.
    pub set_expires_at: bool,
    /// `FORM_SHOWED -> AUTHORIZING` burns one attempt.
    pub increment_attempt: bool,
    /// Partial capture shrinks the payment amount.
    pub new_amount: Option<i64>,
    /// Refund/reversal accumulates here.
    pub add_refunded: Option<i64>,
}

#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::payments)]
struct PaymentUpdate {
    status: PaymentStatus,
    version: i64,
    updated_at: NaiveDateTime,
    expires_at: Option<NaiveDateTime>,
    amount: Option<i64>,
    refunded_amount: Option<i64>,
    attempt_count: Option<i32>,
    error_code: Option<String>,
    message: Option<String>,
}

/// The serialized unit of work behind every state change:
/// load-for-update, guard, update with a version check, append history,
/// enqueue the merchant notification. Guard failure writes nothing.
#[derive(Debug, Clone)]
pub struct TransitionPayment {
    pub payment_id: String,
    pub expected_from: PaymentStatus,
    pub to: PaymentStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub changes: TransitionChanges,
}

impl TransitionPayment {
    pub fn new(payment: &Payment, to: PaymentStatus, actor: &str) -> Self {
        TransitionPayment {
            payment_id: payment.id.clone(),
            expected_from: payment.status,
            to,
            actor: s!(actor),
            reason: None,
            error_code: None,
            message: None,
            changes: TransitionChanges::default(),
        }
    }

    pub fn with_error(mut self, code: &str, message: String) -> Self {
        self.error_code = Some(s!(code));
        self.message = Some(message);
        self
    }

    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_changes(mut self, changes: TransitionChanges) -> Self {
        self.changes = changes;
        self
    }
}

impl Message for TransitionPayment {
    type Result = Result<Payment, Error>;
}

impl Handler<TransitionPayment> for DbExecutor {
    type Result = Result<Payment, Error>;

    fn handle(&mut self, msg: TransitionPayment, _: &mut Self::Context) -> Self::Result {
        let conn = &mut self.0.get()?;
        transition_payment(&msg, conn)
    }
}

pub fn transition_payment(
    msg: &TransitionPayment,
    conn: &mut PgConnection,
) -> Result<Payment, Error> {
    let now = Utc::now().naive_utc();

    conn.transaction::<Payment, Error, _>(|conn| {
        use crate::schema::payments;

        let payment: Payment = payments::table
            .find(&msg.payment_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| Error::PaymentNotFound(msg.payment_id.clone()))?;

        if payment.status != msg.expected_from {
            return Err(Error::StateConflict(payment.id));
        }
        guard_transition(&payment, msg.to, now)?;

        let update = PaymentUpdate {
            status: msg.to,
            version: payment.version + 1,
            updated_at: now,
            expires_at: if msg.changes.set_expires_at {
                Some(payment.created_at + Duration::minutes(payment.payment_expiry as i64))
            } else {
                None
            },
            amount: msg.changes.new_amount,
            refunded_amount: msg
                .changes
                .add_refunded
                .map(|added| payment.refunded_amount + added),
            attempt_count: if msg.changes.increment_attempt {
                Some(payment.attempt_count + 1)
            } else {
                None
            },
            error_code: msg.error_code.clone(),
            message: msg.message.clone(),
        };

        let updated: Payment = diesel::update(
            payments::table
                .find(&payment.id)
                .filter(payments::version.eq(payment.version)),
        )
        .set(&update)
        .get_result(conn)
        .optional()?
        .ok_or_else(|| Error::StateConflict(payment.id.clone()))?;

        diesel::insert_into(crate::schema::payment_state_transitions::table)
            .values(&NewStateTransition {
                payment_id: updated.id.clone(),
                from_status: msg.expected_from,
                to_status: msg.to,
                actor: msg.actor.clone(),
                reason: msg.reason.clone(),
                error_code: msg.error_code.clone(),
                message: msg.message.clone(),
                created_at: now,
            })
            .execute(conn)?;

        if let Some(callback_url) = updated.notification_url.clone() {
            let notification_id = Uuid::new_v4();
            let payload = notification_payload(&updated, notification_id, now);
            diesel::insert_into(crate::schema::notifications::table)
                .values(&Notification {
                    id: notification_id,
                    payment_id: updated.id.clone(),
                    team_slug: updated.team_slug.clone(),
                    event: s!(updated.status),
                    callback_url,
                    payload,
                    delivered: false,
                    attempts: 0,
                    next_attempt_at: None,
                    last_error: None,
                    delivered_at: None,
                    created_at: now,
                })
                .execute(conn)?;
        }

        Ok(updated)
    })
}

#[derive(Debug)]
pub struct CreateBankTransaction {
    pub payment_id: String,
    pub tx_type: BankTxType,
    pub status: BankTxStatus,
    pub amount: i64,
    pub external_ref: Option<String>,
    pub attempt_number: i32,
    pub fraud_score: Option<i32>,
}

impl Message for CreateBankTransaction {
    type Result = Result<Transaction, Error>;
}

impl Handler<CreateBankTransaction> for DbExecutor {
    type Result = Result<Transaction, Error>;

    fn handle(&mut self, msg: CreateBankTransaction, _: &mut Self::Context) -> Self::Result {
        use crate::schema::transactions;
        let conn = &mut self.0.get()?;
        diesel::insert_into(transactions::table)
            .values(&Transaction {
                id: Uuid::new_v4(),
                payment_id: msg.payment_id,
                tx_type: msg.tx_type,
                status: msg.status,
                amount: msg.amount,
                external_ref: msg.external_ref,
                attempt_number: msg.attempt_number,
                next_retry_at: None,
                fraud_score: msg.fraud_score,
                created_at: Utc::now().naive_utc(),
            })
            .get_result(conn)
            .map_err(|e| e.into())
    }
}

#[derive(Debug)]
pub struct GetTransitions {
    pub payment_id: String,
}

impl Message for GetTransitions {
    type Result = Result<Vec<StateTransition>, Error>;
}

impl Handler<GetTransitions> for DbExecutor {
    type Result = Result<Vec<StateTransition>, Error>;

    fn handle(&mut self, msg: GetTransitions, _: &mut Self::Context) -> Self::Result {
        use crate::schema::payment_state_transitions::dsl::*;
        let conn = &mut self.0.get()?;
        payment_state_transitions
            .filter(payment_id.eq(&msg.payment_id))
            .order(id.asc())
            .load(conn)
            .map_err(|e| e.into())
    }
}

/// Confirmed/refunded turnover and created-payment count for the merchant
/// since `since` (normally UTC midnight). Backs the daily-limit rules.
#[derive(Debug)]
pub struct DailyStats {
    pub team_slug: String,
    pub since: NaiveDateTime,
}

impl Message for DailyStats {
    type Result = Result<(i64, i64), Error>;
}

impl Handler<DailyStats> for DbExecutor {
    type Result = Result<(i64, i64), Error>;

    fn handle(&mut self, msg: DailyStats, _: &mut Self::Context) -> Self::Result {
        let conn = &mut self.0.get()?;
        daily_stats(&msg.team_slug, msg.since, conn)
    }
}

pub fn daily_stats(
    slug: &str,
    since: NaiveDateTime,
    conn: &mut PgConnection,
) -> Result<(i64, i64), Error> {
    use crate::schema::payments::dsl::*;
    use diesel::dsl::sql;
    use diesel::sql_types::BigInt;

    let total: i64 = payments
        .filter(team_slug.eq(slug))
        .filter(created_at.ge(since))
        .filter(status.eq_any([
            PaymentStatus::Confirmed,
            PaymentStatus::Refunded,
            PaymentStatus::PartialRefunded,
        ]))
        .select(sql::<BigInt>("COALESCE(SUM(amount), 0)::bigint"))
        .first(conn)?;

    let count: i64 = payments
        .filter(team_slug.eq(slug))
        .filter(created_at.ge(since))
        .count()
        .get_result(conn)?;

    Ok((total, count))
}

#[derive(Debug)]
pub struct ExpiredCandidates {
    pub limit: i64,
}

impl Message for ExpiredCandidates {
    type Result = Result<Vec<Payment>, Error>;
}

impl Handler<ExpiredCandidates> for DbExecutor {
    type Result = Result<Vec<Payment>, Error>;

    fn handle(&mut self, msg: ExpiredCandidates, _: &mut Self::Context) -> Self::Result {
        use crate::schema::payments::dsl::*;
        let conn = &mut self.0.get()?;
        payments
            .filter(status.eq_any([
                PaymentStatus::Init,
                PaymentStatus::New,
                PaymentStatus::FormShowed,
            ]))
            .filter(expires_at.le(Utc::now().naive_utc()))
            .order(expires_at.asc())
            .limit(msg.limit)
            .load(conn)
            .map_err(|e| e.into())
    }
}

/// Oldest undelivered, unabandoned notification per payment; the caller
/// filters for due `next_attempt_at`. Picking only the head of each
/// payment's queue is what preserves per-payment FIFO.
#[derive(Debug)]
pub struct DueNotifications {
    pub limit: i64,
    pub max_attempts: i32,
}

impl Message for DueNotifications {
    type Result = Result<Vec<Notification>, Error>;
}

impl Handler<DueNotifications> for DbExecutor {
    type Result = Result<Vec<Notification>, Error>;

    fn handle(&mut self, msg: DueNotifications, _: &mut Self::Context) -> Self::Result {
        use crate::schema::notifications::dsl::*;
        let conn = &mut self.0.get()?;
        notifications
            .filter(delivered.eq(false))
            .filter(attempts.lt(msg.max_attempts))
            .distinct_on(payment_id)
            .order((payment_id.asc(), created_at.asc()))
            .limit(msg.limit)
            .load(conn)
            .map_err(|e| e.into())
    }
}

#[derive(Debug)]
pub struct NotificationAttempt {
    pub notification_id: Uuid,
    pub error: String,
    pub next_attempt_at: Option<NaiveDateTime>,
    /// Permanent failures burn the whole attempt budget at once.
    pub abandon_at: Option<i32>,
}

impl Message for NotificationAttempt {
    type Result = Result<(), Error>;
}

impl Handler<NotificationAttempt> for DbExecutor {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: NotificationAttempt, _: &mut Self::Context) -> Self::Result {
        use crate::schema::notifications::dsl::*;
        let conn = &mut self.0.get()?;
        match msg.abandon_at {
            Some(ceiling) => diesel::update(notifications.find(msg.notification_id))
                .set((
                    attempts.eq(ceiling),
                    next_attempt_at.eq(None::<NaiveDateTime>),
                    last_error.eq(&msg.error),
                ))
                .execute(conn)?,
            None => diesel::update(notifications.find(msg.notification_id))
                .set((
                    attempts.eq(attempts + 1),
                    next_attempt_at.eq(msg.next_attempt_at),
                    last_error.eq(&msg.error),
                ))
                .execute(conn)?,
        };
        Ok(())
    }
}

#[derive(Debug)]
pub struct MarkNotificationDelivered {
    pub notification_id: Uuid,
}

impl Message for MarkNotificationDelivered {
    type Result = Result<(), Error>;
}

impl Handler<MarkNotificationDelivered> for DbExecutor {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: MarkNotificationDelivered, _: &mut Self::Context) -> Self::Result {
        use crate::schema::notifications::dsl::*;
        let conn = &mut self.0.get()?;
        diesel::update(notifications.find(msg.notification_id))
            .set((
                delivered.eq(true),
                attempts.eq(attempts + 1),
                delivered_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }
}

/// Merchant provisioning used by fixtures and ops tooling; the public
/// registration surface lives outside this service.
#[derive(Debug, Clone)]
pub struct NewMerchant {
    pub team_slug: String,
    pub password: String,
    pub supported_currencies: Vec<String>,
    pub notification_url: Option<String>,
}

pub fn create_merchant(params: NewMerchant, conn: &mut PgConnection) -> Result<Merchant, Error> {
    use crate::schema::merchants;
    let merchant = Merchant {
        team_slug: params.team_slug,
        password: params.password,
        is_active: true,
        supported_currencies: params.supported_currencies,
        min_per_payment: 1_000,
        max_per_payment: 50_000_000,
        daily_total: 500_000_000,
        daily_count: 10_000,
        min_expiry_minutes: 1,
        max_expiry_minutes: MAX_PAYMENT_EXPIRY_MINUTES,
        success_url: None,
        fail_url: None,
        notification_url: params.notification_url,
        failed_auth_attempts: 0,
        locked_until: None,
        last_auth_at: None,
        created_at: Utc::now().naive_utc(),
    };
    diesel::insert_into(merchants::table)
        .values(&merchant)
        .get_result(conn)
        .map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{new_payment_msg, test_conn, test_merchant};

    #[test]
    fn payment_id_is_twenty_digits() {
        for _ in 0..64 {
            let id = generate_payment_id();
            assert_eq!(id.len(), 20);
            assert!(id.bytes().all(|b| b.is_ascii_digit()));
            assert_ne!(id.as_bytes()[0], b'0');
        }
    }

    #[test]
    fn webhook_payload_shape() {
        let now = Utc::now().naive_utc();
        let payment = Payment {
            id: s!("40000000000000000001"),
            team_slug: s!("demo-team"),
            order_id: s!("O1"),
            amount: 100_000,
            refunded_amount: 0,
            currency: s!("RUB"),
            pay_type: PayType::SingleStage,
            status: PaymentStatus::Confirmed,
            description: None,
            customer_key: None,
            recurrent: false,
            language: s!("en"),
            success_url: None,
            fail_url: None,
            notification_url: None,
            payment_expiry: 30,
            expires_at: None,
            error_code: None,
            message: None,
            attempt_count: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            data: None,
            version: 5,
            created_at: now,
            updated_at: now,
        };
        let id = Uuid::new_v4();
        let payload = notification_payload(&payment, id, now);
        assert_eq!(payload["paymentId"], json!("40000000000000000001"));
        assert_eq!(payload["orderId"], json!("O1"));
        assert_eq!(payload["status"], json!("CONFIRMED"));
        assert_eq!(payload["amount"], json!(100_000));
        assert_eq!(payload["currency"], json!("RUB"));
        assert_eq!(payload["attemptId"], json!(id.to_string()));
        assert!(payload["timestamp"].as_str().unwrap().contains('T'));
        // stable bytes: two serializations agree
        assert_eq!(payload.to_string(), payload.to_string());
    }

    #[test]
    fn duplicate_order_id_is_rejected() {
        let Some(mut conn) = test_conn() else { return };
        conn.test_transaction::<_, Error, _>(|conn| {
            let merchant = test_merchant(conn, "dup-team");
            create_payment(&new_payment_msg(&merchant, "O1", 100_000), conn)?;
            match create_payment(&new_payment_msg(&merchant, "O1", 100_000), conn) {
                Err(Error::DuplicateOrderId(order)) => assert_eq!(order, "O1"),
                other => panic!("expected duplicate order error, got ok={}", other.is_ok()),
            }
            // a different order id is still fine
            create_payment(&new_payment_msg(&merchant, "O2", 100_000), conn)?;
            Ok(())
        });
    }

    #[test]
    fn transition_appends_history_and_stamps_expiry() {
        let Some(mut conn) = test_conn() else { return };
        conn.test_transaction::<_, Error, _>(|conn| {
            let merchant = test_merchant(conn, "hist-team");
            let payment = create_payment(&new_payment_msg(&merchant, "O1", 100_000), conn)?;
            assert_eq!(payment.status, PaymentStatus::Init);
            assert_eq!(payment.version, 1);
            assert!(payment.expires_at.is_none());

            let updated = transition_payment(
                &TransitionPayment::new(&payment, PaymentStatus::New, "merchant").with_changes(
                    TransitionChanges {
                        set_expires_at: true,
                        ..TransitionChanges::default()
                    },
                ),
                conn,
            )?;
            assert_eq!(updated.status, PaymentStatus::New);
            assert_eq!(updated.version, 2);
            assert_eq!(
                updated.expires_at,
                Some(payment.created_at + Duration::minutes(payment.payment_expiry as i64))
            );

            use crate::schema::payment_state_transitions::dsl::*;
            let history: Vec<StateTransition> = payment_state_transitions
                .filter(payment_id.eq(&payment.id))
                .order(id.asc())
                .load(conn)?;
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].from_status, PaymentStatus::Init);
            assert_eq!(history[0].to_status, PaymentStatus::New);

            // notification enqueued because the fixture merchant has a
            // callback URL
            use crate::schema::notifications::dsl as n;
            let queued: Vec<Notification> = n::notifications
                .filter(n::payment_id.eq(&payment.id))
                .load(conn)?;
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].event, "NEW");
            assert!(!queued[0].delivered);
            Ok(())
        });
    }

    #[test]
    fn stale_expected_status_is_a_conflict_and_writes_nothing() {
        let Some(mut conn) = test_conn() else { return };
        conn.test_transaction::<_, Error, _>(|conn| {
            let merchant = test_merchant(conn, "conflict-team");
            let payment = create_payment(&new_payment_msg(&merchant, "O1", 100_000), conn)?;
            let mut stale = TransitionPayment::new(&payment, PaymentStatus::New, "merchant");
            stale.expected_from = PaymentStatus::FormShowed;
            match transition_payment(&stale, conn) {
                Err(Error::StateConflict(other_id)) => assert_eq!(other_id, payment.id),
                other => panic!("expected state conflict, got ok={}", other.is_ok()),
            }

            use crate::schema::payment_state_transitions::dsl::*;
            let count: i64 = payment_state_transitions
                .filter(payment_id.eq(&payment.id))
                .count()
                .get_result(conn)?;
            assert_eq!(count, 0);
            Ok(())
        });
    }

    #[test]
    fn daily_stats_counts_only_confirmed_like_statuses() {
        let Some(mut conn) = test_conn() else { return };
        conn.test_transaction::<_, Error, _>(|conn| {
            let merchant = test_merchant(conn, "stats-team");
            let since = Utc::now().naive_utc() - Duration::hours(1);
            create_payment(&new_payment_msg(&merchant, "O1", 100_000), conn)?;
            let (total, count) = daily_stats(&merchant.team_slug, since, conn)?;
            assert_eq!(total, 0, "INIT payments do not count toward turnover");
            assert_eq!(count, 1);
            Ok(())
        });
    }

    #[test]
    fn lockout_after_consecutive_failures() {
        let Some(mut conn) = test_conn() else { return };
        conn.test_transaction::<_, Error, _>(|conn| {
            let merchant = test_merchant(conn, "lock-team");
            let policy = LockoutPolicy::default();
            for _ in 0..policy.max_failures {
                record_auth_outcome(
                    &RecordAuthOutcome {
                        team_slug: merchant.team_slug.clone(),
                        success: false,
                        policy: policy.clone(),
                    },
                    conn,
                )?;
            }
            let locked = get_merchant(&merchant.team_slug, conn)?;
            assert_eq!(locked.failed_auth_attempts, policy.max_failures);
            assert!(locked.is_locked(Utc::now().naive_utc()));

            record_auth_outcome(
                &RecordAuthOutcome {
                    team_slug: merchant.team_slug.clone(),
                    success: true,
                    policy,
                },
                conn,
            )?;
            let cleared = get_merchant(&merchant.team_slug, conn)?;
            assert_eq!(cleared.failed_auth_attempts, 0);
            assert!(!cleared.is_locked(Utc::now().naive_utc()));
            Ok(())
        });
    }
}

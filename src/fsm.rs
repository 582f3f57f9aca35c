//! Payment state machine and orchestrator.
//!
//! The top half is the pure machine: the edge table, the guard rules and
//! nothing else. The bottom half is the `Fsm` actor that drives whole
//! operations (Init, Form-Submit, Confirm, Cancel, Check, Expire) through
//! the store and the bank simulator. All read-modify-write of one payment
//! happens under that payment's keyed lock; the store additionally holds a
//! row lock and a version check inside each transition, so the same
//! invariants survive a second process.

use crate::bank::{BankOutcome, BankResponse, BankSimulator, CardData, CARD_DECLINED};
use crate::db::{
    CreateBankTransaction, CreatePayment, DailyStats, DbExecutor, FindByOrderId, GetPayment,
    GetTransitions, TransitionChanges, TransitionPayment,
};
use crate::errors::Error;
use crate::models::{
    BankTxStatus, BankTxType, Merchant, Payment, PaymentStatus, PayType, StateTransition,
};
use crate::validators::{CancelRequest, CheckRequest, ConfirmRequest, InitRequest};
use actix::{Actor, Addr, Context, Handler, Message, ResponseFuture};
use chrono::{NaiveDateTime, NaiveTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const ACTOR_MERCHANT: &str = "merchant";
pub const ACTOR_CUSTOMER: &str = "customer";
pub const ACTOR_BANK: &str = "bank";
pub const ACTOR_GATEWAY: &str = "gateway";
pub const ACTOR_REAPER: &str = "reaper";

/// Error code stamped on payments that failed because the bank never
/// answered within the attempt budget.
pub const BANK_UNAVAILABLE: &str = "999";

use PaymentStatus::*;

/// Every legal edge. `AUTH_FAIL -> FORM_SHOWED` is the retry edge; it is
/// fenced off by the terminal rule once the attempt budget is spent.
pub static TRANSITIONS: &[(PaymentStatus, PaymentStatus)] = &[
    (Init, New),
    (Init, DeadlineExpired),
    (New, FormShowed),
    (New, Cancelled),
    (New, DeadlineExpired),
    (FormShowed, Authorizing),
    (FormShowed, DeadlineExpired),
    (Authorizing, ThreeDsChecking),
    (Authorizing, Authorized),
    (Authorizing, AuthFail),
    (AuthFail, FormShowed),
    (ThreeDsChecking, ThreeDsChecked),
    (ThreeDsChecked, Authorized),
    (Authorized, Confirming),
    (Confirming, Confirmed),
    (Authorized, Reversing),
    (Reversing, Reversed),
    (Reversing, PartialReversed),
    (Confirmed, Refunding),
    (Refunding, Refunded),
    (Refunding, PartialRefunded),
];

pub fn edge_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    TRANSITIONS.contains(&(from, to))
}

/// Transition guards: terminal payments never move, the edge must exist,
/// `AUTHORIZING` respects the attempt budget, and an expired payment only
/// moves to its expiry terminal.
pub fn guard_transition(
    payment: &Payment,
    to: PaymentStatus,
    now: NaiveDateTime,
) -> Result<(), Error> {
    if payment.is_terminal() {
        return Err(Error::WrongPaymentStatus(s!(payment.status)));
    }
    if !edge_allowed(payment.status, to) {
        return Err(Error::WrongPaymentStatus(s!(payment.status)));
    }
    if to == Authorizing && payment.attempt_count >= payment.max_attempts {
        return Err(Error::WrongPaymentStatus(format!(
            "{} (attempts exhausted)",
            payment.status
        )));
    }
    if to != DeadlineExpired && payment.is_expired(now) {
        return Err(Error::WrongPaymentStatus(format!(
            "{} (payment expired)",
            payment.status
        )));
    }
    Ok(())
}

/// In-process keyed mutexes, one per active payment id.
#[derive(Clone, Default)]
pub struct PaymentLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

impl PaymentLocks {
    pub async fn acquire(&self, payment_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.0.lock();
            if map.len() > 4096 {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            map.entry(s!(payment_id)).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct Fsm {
    pub db: Addr<DbExecutor>,
    pub bank: BankSimulator,
    pub locks: PaymentLocks,
}

impl Actor for Fsm {
    type Context = Context<Self>;
}

async fn transition(db: &Addr<DbExecutor>, msg: TransitionPayment) -> Result<Payment, Error> {
    Ok(db.send(msg).await??)
}

async fn load_owned(
    db: &Addr<DbExecutor>,
    merchant_slug: &str,
    payment_id: &str,
) -> Result<Payment, Error> {
    let payment = db
        .send(GetPayment {
            payment_id: s!(payment_id),
        })
        .await??;
    // a foreign payment id is indistinguishable from an unknown one
    if payment.team_slug != merchant_slug {
        return Err(Error::PaymentNotFound(s!(payment_id)));
    }
    Ok(payment)
}

async fn record_bank_tx(
    db: &Addr<DbExecutor>,
    payment: &Payment,
    tx_type: BankTxType,
    amount: i64,
    resp: &BankResponse,
) {
    let status = match resp.outcome {
        BankOutcome::Approved | BankOutcome::ThreeDsRequired => BankTxStatus::Approved,
        BankOutcome::Declined => BankTxStatus::Declined,
    };
    let result = db
        .send(CreateBankTransaction {
            payment_id: payment.id.clone(),
            tx_type,
            status,
            amount,
            external_ref: Some(resp.external_ref.clone()),
            attempt_number: payment.attempt_count,
            fraud_score: Some(resp.fraud_score),
        })
        .await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("cannot record bank transaction for {}: {}", payment.id, e),
        Err(e) => warn!("cannot record bank transaction for {}: {}", payment.id, e),
    }
}

/// Capture previously authorized funds and finish on `CONFIRMED`.
async fn capture(
    db: Addr<DbExecutor>,
    bank: BankSimulator,
    payment: Payment,
    confirm_amount: i64,
    actor: &str,
) -> Result<Payment, Error> {
    let changes = TransitionChanges {
        new_amount: if confirm_amount != payment.amount {
            Some(confirm_amount)
        } else {
            None
        },
        ..TransitionChanges::default()
    };
    let confirming = transition(
        &db,
        TransitionPayment::new(&payment, Confirming, actor).with_changes(changes),
    )
    .await?;

    let resp = bank.capture(&confirming.id, confirm_amount).await?;
    record_bank_tx(&db, &confirming, BankTxType::Capture, confirm_amount, &resp).await;

    transition(
        &db,
        TransitionPayment::new(&confirming, Confirmed, ACTOR_BANK),
    )
    .await
}

pub struct InitPayment {
    pub merchant: Merchant,
    pub req: InitRequest,
}

impl Message for InitPayment {
    type Result = Result<Payment, Error>;
}

impl Handler<InitPayment> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: InitPayment, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        Box::pin(async move {
            let InitPayment { merchant, req } = msg;

            if !merchant.is_active {
                return Err(Error::TerminalInactive(merchant.team_slug));
            }
            if !merchant.supports_currency(&req.currency) {
                return Err(Error::UnsupportedCurrency(req.currency));
            }
            if req.amount < merchant.min_per_payment || req.amount > merchant.max_per_payment {
                return Err(Error::LimitExceeded(format!(
                    "amount is outside the {}..{} range allowed for this merchant",
                    merchant.min_per_payment, merchant.max_per_payment
                )));
            }

            let midnight = Utc::now().date_naive().and_time(NaiveTime::MIN);
            let (total, count) = db
                .send(DailyStats {
                    team_slug: merchant.team_slug.clone(),
                    since: midnight,
                })
                .await??;
            if total + req.amount > merchant.daily_total {
                return Err(Error::LimitExceeded(s!("daily turnover limit reached")));
            }
            if count >= merchant.daily_count as i64 {
                return Err(Error::LimitExceeded(s!("daily payment count reached")));
            }

            let created = db
                .send(CreatePayment {
                    team_slug: merchant.team_slug.clone(),
                    order_id: req.order_id.clone(),
                    amount: req.amount,
                    currency: req.currency.clone(),
                    pay_type: req.pay_type(),
                    description: req.description.clone(),
                    customer_key: req.customer_key.clone(),
                    recurrent: req.is_recurrent(),
                    language: req.language_code(),
                    success_url: req.success_url.clone().or(merchant.success_url),
                    fail_url: req.fail_url.clone().or(merchant.fail_url),
                    notification_url: req
                        .notification_url
                        .clone()
                        .or(merchant.notification_url),
                    payment_expiry: req.expiry_minutes(),
                    data: req.data.clone().map(serde_json::Value::Object),
                })
                .await??;
            debug!(
                "created payment {} for {} order {}",
                created.id, created.team_slug, created.order_id
            );

            transition(
                &db,
                TransitionPayment::new(&created, New, ACTOR_MERCHANT).with_changes(
                    TransitionChanges {
                        set_expires_at: true,
                        ..TransitionChanges::default()
                    },
                ),
            )
            .await
        })
    }
}

/// Customer opened the hosted form. Idempotent on reload; permitted again
/// after a failed attempt while the budget lasts.
pub struct LoadForm {
    pub payment_id: String,
}

impl Message for LoadForm {
    type Result = Result<Payment, Error>;
}

impl Handler<LoadForm> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: LoadForm, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        let locks = self.locks.clone();
        Box::pin(async move {
            let _guard = locks.acquire(&msg.payment_id).await;
            let payment = db
                .send(GetPayment {
                    payment_id: msg.payment_id,
                })
                .await??;
            match payment.status {
                FormShowed => Ok(payment),
                New => {
                    transition(
                        &db,
                        TransitionPayment::new(&payment, FormShowed, ACTOR_CUSTOMER),
                    )
                    .await
                }
                AuthFail if !payment.is_terminal() => {
                    transition(
                        &db,
                        TransitionPayment::new(&payment, FormShowed, ACTOR_CUSTOMER),
                    )
                    .await
                }
                other => Err(Error::WrongPaymentStatus(s!(other))),
            }
        })
    }
}

pub struct SubmitForm {
    pub payment_id: String,
    pub card: CardData,
}

impl Message for SubmitForm {
    type Result = Result<Payment, Error>;
}

impl Handler<SubmitForm> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: SubmitForm, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        let bank = self.bank.clone();
        let locks = self.locks.clone();
        Box::pin(async move {
            let _guard = locks.acquire(&msg.payment_id).await;
            let mut payment = db
                .send(GetPayment {
                    payment_id: msg.payment_id.clone(),
                })
                .await??;

            // direct POST without a prior form GET, or a retry after a
            // decline: pass through FORM_SHOWED first
            if payment.status == New || (payment.status == AuthFail && !payment.is_terminal()) {
                payment = transition(
                    &db,
                    TransitionPayment::new(&payment, FormShowed, ACTOR_CUSTOMER),
                )
                .await?;
            }
            if payment.status != FormShowed {
                return Err(Error::WrongPaymentStatus(s!(payment.status)));
            }

            let authorizing = transition(
                &db,
                TransitionPayment::new(&payment, Authorizing, ACTOR_CUSTOMER).with_changes(
                    TransitionChanges {
                        increment_attempt: true,
                        ..TransitionChanges::default()
                    },
                ),
            )
            .await?;

            // the in-flight authorization retries transport failures; the
            // customer-visible attempt is burned exactly once
            let mut last_network_error = None;
            let mut response = None;
            for _ in 0..authorizing.max_attempts {
                match bank.authorize(&msg.card, authorizing.amount).await {
                    Ok(resp) => {
                        response = Some(resp);
                        break;
                    }
                    Err(Error::Network(e)) => {
                        warn!("bank authorization attempt failed for {}: {}", authorizing.id, e);
                        last_network_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            let resp = match response {
                Some(resp) => resp,
                None => {
                    let reason = last_network_error.unwrap_or_else(|| s!("bank unreachable"));
                    return transition(
                        &db,
                        TransitionPayment::new(&authorizing, AuthFail, ACTOR_GATEWAY)
                            .with_error(BANK_UNAVAILABLE, reason),
                    )
                    .await;
                }
            };
            record_bank_tx(&db, &authorizing, BankTxType::Authorize, authorizing.amount, &resp)
                .await;

            let authorized = match resp.outcome {
                BankOutcome::Declined => {
                    return transition(
                        &db,
                        TransitionPayment::new(&authorizing, AuthFail, ACTOR_BANK)
                            .with_error(CARD_DECLINED, resp.response_message.clone()),
                    )
                    .await;
                }
                BankOutcome::ThreeDsRequired => {
                    let checking = transition(
                        &db,
                        TransitionPayment::new(&authorizing, ThreeDsChecking, ACTOR_BANK),
                    )
                    .await?;
                    let acs = bank.complete_three_ds(&msg.card).await?;
                    let checked = transition(
                        &db,
                        TransitionPayment::new(&checking, ThreeDsChecked, ACTOR_BANK),
                    )
                    .await?;
                    record_bank_tx(&db, &checked, BankTxType::Authorize, checked.amount, &acs)
                        .await;
                    transition(
                        &db,
                        TransitionPayment::new(&checked, Authorized, ACTOR_BANK),
                    )
                    .await?
                }
                BankOutcome::Approved => {
                    transition(
                        &db,
                        TransitionPayment::new(&authorizing, Authorized, ACTOR_BANK),
                    )
                    .await?
                }
            };

            match authorized.pay_type {
                PayType::SingleStage => {
                    let amount = authorized.amount;
                    capture(db, bank, authorized, amount, ACTOR_GATEWAY).await
                }
                PayType::TwoStage => Ok(authorized),
            }
        })
    }
}

pub struct Confirm {
    pub merchant: Merchant,
    pub req: ConfirmRequest,
}

impl Message for Confirm {
    type Result = Result<Payment, Error>;
}

impl Handler<Confirm> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: Confirm, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        let bank = self.bank.clone();
        let locks = self.locks.clone();
        Box::pin(async move {
            let _guard = locks.acquire(&msg.req.payment_id).await;
            let payment =
                load_owned(&db, &msg.merchant.team_slug, &msg.req.payment_id).await?;
            if payment.status != Authorized {
                return Err(Error::WrongPaymentStatus(s!(payment.status)));
            }
            let confirm_amount = msg.req.amount.unwrap_or(payment.amount);
            if confirm_amount > payment.amount {
                return Err(Error::AmountExceedsAuthorized(confirm_amount, payment.amount));
            }
            if confirm_amount < 1 {
                return Err(Error::AmountExceedsAuthorized(confirm_amount, payment.amount));
            }
            capture(db, bank, payment, confirm_amount, ACTOR_MERCHANT).await
        })
    }
}

pub struct Cancel {
    pub merchant: Merchant,
    pub req: CancelRequest,
}

impl Message for Cancel {
    type Result = Result<Payment, Error>;
}

impl Handler<Cancel> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: Cancel, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        let bank = self.bank.clone();
        let locks = self.locks.clone();
        Box::pin(async move {
            let _guard = locks.acquire(&msg.req.payment_id).await;
            let payment =
                load_owned(&db, &msg.merchant.team_slug, &msg.req.payment_id).await?;
            let reason = msg.req.reason.clone();

            match payment.status {
                New => {
                    let mut t = TransitionPayment::new(&payment, Cancelled, ACTOR_MERCHANT);
                    if let Some(reason) = reason {
                        t = t.with_reason(reason);
                    }
                    transition(&db, t).await
                }
                Authorized => {
                    let reverse_amount = msg.req.amount.unwrap_or(payment.amount);
                    if reverse_amount > payment.amount || reverse_amount < 1 {
                        return Err(Error::AmountExceedsAuthorized(
                            reverse_amount,
                            payment.amount,
                        ));
                    }
                    let mut t = TransitionPayment::new(&payment, Reversing, ACTOR_MERCHANT);
                    if let Some(reason) = reason {
                        t = t.with_reason(reason);
                    }
                    let reversing = transition(&db, t).await?;
                    let resp = bank.reverse(&reversing.id, reverse_amount).await?;
                    record_bank_tx(&db, &reversing, BankTxType::Reverse, reverse_amount, &resp)
                        .await;
                    let terminal = if reverse_amount == reversing.amount {
                        Reversed
                    } else {
                        PartialReversed
                    };
                    transition(
                        &db,
                        TransitionPayment::new(&reversing, terminal, ACTOR_BANK),
                    )
                    .await
                }
                Confirmed => {
                    let remaining = payment.remaining_refundable();
                    let refund_amount = msg.req.amount.unwrap_or(remaining);
                    if refund_amount > remaining || refund_amount < 1 {
                        return Err(Error::AmountExceedsAuthorized(refund_amount, remaining));
                    }
                    let mut t = TransitionPayment::new(&payment, Refunding, ACTOR_MERCHANT);
                    if let Some(reason) = reason {
                        t = t.with_reason(reason);
                    }
                    let refunding = transition(&db, t).await?;
                    let resp = bank.refund(&refunding.id, refund_amount).await?;
                    record_bank_tx(&db, &refunding, BankTxType::Refund, refund_amount, &resp)
                        .await;
                    let terminal = if refund_amount == remaining {
                        Refunded
                    } else {
                        PartialRefunded
                    };
                    transition(
                        &db,
                        TransitionPayment::new(&refunding, terminal, ACTOR_BANK).with_changes(
                            TransitionChanges {
                                add_refunded: Some(refund_amount),
                                ..TransitionChanges::default()
                            },
                        ),
                    )
                    .await
                }
                other => Err(Error::WrongPaymentStatus(s!(other))),
            }
        })
    }
}

pub struct Check {
    pub merchant: Merchant,
    pub req: CheckRequest,
}

impl Message for Check {
    type Result = Result<(Payment, Option<Vec<StateTransition>>), Error>;
}

impl Handler<Check> for Fsm {
    type Result = ResponseFuture<Result<(Payment, Option<Vec<StateTransition>>), Error>>;

    fn handle(&mut self, msg: Check, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        Box::pin(async move {
            let payment = match (msg.req.payment_id.clone(), msg.req.order_id.clone()) {
                (Some(payment_id), _) => {
                    load_owned(&db, &msg.merchant.team_slug, &payment_id).await?
                }
                (None, Some(order_id)) => {
                    db.send(FindByOrderId {
                        team_slug: msg.merchant.team_slug.clone(),
                        order_id,
                    })
                    .await??
                }
                (None, None) => return Err(Error::PaymentNotFound(s!(""))),
            };
            let transitions = if msg.req.include_transitions.unwrap_or(false) {
                Some(
                    db.send(GetTransitions {
                        payment_id: payment.id.clone(),
                    })
                    .await??,
                )
            } else {
                None
            };
            Ok((payment, transitions))
        })
    }
}

/// Reaper transition for one timed-out payment.
pub struct ExpirePayment {
    pub payment_id: String,
}

impl Message for ExpirePayment {
    type Result = Result<Payment, Error>;
}

impl Handler<ExpirePayment> for Fsm {
    type Result = ResponseFuture<Result<Payment, Error>>;

    fn handle(&mut self, msg: ExpirePayment, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        let locks = self.locks.clone();
        Box::pin(async move {
            let _guard = locks.acquire(&msg.payment_id).await;
            let payment = db
                .send(GetPayment {
                    payment_id: msg.payment_id,
                })
                .await??;
            transition(
                &db,
                TransitionPayment::new(&payment, DeadlineExpired, ACTOR_REAPER)
                    .with_reason(s!("payment deadline passed")),
            )
            .await
        })
    }
}

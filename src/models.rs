use crate::schema::{merchants, notifications, payment_state_transitions, payments, transactions};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Default number of authorization attempts a customer gets before the
/// payment is parked in `AUTH_FAIL` for good.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Hard ceiling on `payment_expiry`, minutes (30 days).
pub const MAX_PAYMENT_EXPIRY_MINUTES: i32 = 43_200;

#[derive(
    DbEnum,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[ExistingTypePath = "crate::schema::sql_types::PaymentStatus"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Init,
    New,
    FormShowed,
    Authorizing,
    ThreeDsChecking,
    ThreeDsChecked,
    Authorized,
    AuthFail,
    Confirming,
    Confirmed,
    Reversing,
    Reversed,
    PartialReversed,
    Refunding,
    Refunded,
    PartialRefunded,
    Cancelling,
    Cancelled,
    Rejected,
    Expired,
    DeadlineExpired,
}

impl PaymentStatus {
    /// Statuses with no outgoing edges at all. `AuthFail` is not listed:
    /// it becomes terminal only once the attempt budget is spent, which is
    /// a per-payment question (see [`Payment::is_terminal`]).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Cancelled
                | PaymentStatus::DeadlineExpired
                | PaymentStatus::Expired
                | PaymentStatus::Rejected
                | PaymentStatus::Reversed
                | PaymentStatus::PartialReversed
                | PaymentStatus::Refunded
                | PaymentStatus::PartialRefunded
        )
    }
}

#[derive(DbEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[ExistingTypePath = "crate::schema::sql_types::PayType"]
pub enum PayType {
    #[db_rename = "O"]
    #[serde(rename = "O")]
    SingleStage,
    #[db_rename = "T"]
    #[serde(rename = "T")]
    TwoStage,
}

impl fmt::Display for PayType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayType::SingleStage => write!(f, "O"),
            PayType::TwoStage => write!(f, "T"),
        }
    }
}

#[derive(DbEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[ExistingTypePath = "crate::schema::sql_types::BankTxType"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankTxType {
    Authorize,
    Capture,
    Refund,
    Reverse,
}

#[derive(DbEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[ExistingTypePath = "crate::schema::sql_types::BankTxStatus"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankTxStatus {
    Approved,
    Declined,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Identifiable)]
#[diesel(table_name = merchants, primary_key(team_slug))]
pub struct Merchant {
    pub team_slug: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub is_active: bool,
    pub supported_currencies: Vec<String>,
    pub min_per_payment: i64,
    pub max_per_payment: i64,
    pub daily_total: i64,
    pub daily_count: i32,
    pub min_expiry_minutes: i32,
    pub max_expiry_minutes: i32,
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
    pub notification_url: Option<String>,
    pub failed_auth_attempts: i32,
    pub locked_until: Option<NaiveDateTime>,
    pub last_auth_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl Merchant {
    pub fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies.iter().any(|c| c == currency)
    }

    pub fn is_locked(&self, now: NaiveDateTime) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Identifiable)]
#[diesel(table_name = payments)]
pub struct Payment {
    pub id: String,
    pub team_slug: String,
    pub order_id: String,
    pub amount: i64,
    pub refunded_amount: i64,
    pub currency: String,
    pub pay_type: PayType,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub customer_key: Option<String>,
    pub recurrent: bool,
    pub language: String,
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
    pub notification_url: Option<String>,
    pub payment_expiry: i32,
    pub expires_at: Option<NaiveDateTime>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub data: Option<Value>,
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Payment {
    /// Terminal payments never transition again. `AuthFail` counts once the
    /// attempt budget is exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            PaymentStatus::AuthFail => self.attempt_count >= self.max_attempts,
            s => s.is_terminal(),
        }
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn time_until_expired(&self, now: NaiveDateTime) -> Option<Duration> {
        self.expires_at.map(|at| at - now)
    }

    /// Hosted card-entry form URL handed back from Init.
    pub fn payment_url(&self, domain: &str) -> String {
        format!("{}/paymentform/{}", domain.trim_end_matches('/'), self.id)
    }

    pub fn remaining_refundable(&self) -> i64 {
        self.amount - self.refunded_amount
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Identifiable)]
#[diesel(table_name = transactions)]
pub struct Transaction {
    pub id: Uuid,
    pub payment_id: String,
    pub tx_type: BankTxType,
    pub status: BankTxStatus,
    pub amount: i64,
    pub external_ref: Option<String>,
    pub attempt_number: i32,
    pub next_retry_at: Option<NaiveDateTime>,
    pub fraud_score: Option<i32>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable)]
#[diesel(table_name = payment_state_transitions)]
pub struct StateTransition {
    pub id: i64,
    pub payment_id: String,
    pub from_status: PaymentStatus,
    pub to_status: PaymentStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = payment_state_transitions)]
pub struct NewStateTransition {
    pub payment_id: String,
    pub from_status: PaymentStatus,
    pub to_status: PaymentStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Identifiable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub payment_id: String,
    pub team_slug: String,
    pub event: String,
    pub callback_url: String,
    pub payload: Value,
    pub delivered: bool,
    pub attempts: i32,
    pub next_attempt_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub delivered_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

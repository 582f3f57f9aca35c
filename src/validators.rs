//! Field-level request validation.
//!
//! Every operation gets a list of field-scoped checks; failures accumulate
//! into a single [`ValidationErrors`] so the merchant sees all violations at
//! once, localized to the request language. Dispatch is by data (one
//! function per operation over plain rule helpers), not by type hierarchy.

use crate::bank::CardData;
use crate::errors::{Error, ValidationErrors};
use crate::models::{Merchant, PayType, MAX_PAYMENT_EXPIRY_MINUTES};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

pub const MIN_AMOUNT: i64 = 1_000;
pub const MAX_AMOUNT: i64 = 50_000_000;
pub const DEFAULT_PAYMENT_EXPIRY_MINUTES: i32 = 30;
const MAX_DATA_ENTRIES: usize = 20;
const MAX_URL_LENGTH: usize = 2_048;
const MAX_REDIRECT_DUE_DAYS: i64 = 90;

lazy_static! {
    static ref SLUG_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
    static ref TOKEN_RE: Regex = Regex::new(r"^[0-9a-fA-F]+$").unwrap();
    static ref PAYMENT_ID_RE: Regex = Regex::new(r"^[0-9]+$").unwrap();
    static ref CURRENCY_RE: Regex = Regex::new(r"^[A-Z]{3}$").unwrap();
    static ref PHONE_RE: Regex = Regex::new(r"^\+?[0-9]{7,20}$").unwrap();
    // RFC-5322 subset: dot-atom local part, LDH domain labels
    static ref EMAIL_RE: Regex = Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$"
    )
    .unwrap();
    static ref PAN_RE: Regex = Regex::new(r"^[0-9]{12,19}$").unwrap();
    static ref CVV_RE: Regex = Regex::new(r"^[0-9]{3,4}$").unwrap();
    static ref CARD_EXPIRY_RE: Regex = Regex::new(r"^(0[1-9]|1[0-2])/([0-9]{2})$").unwrap();
}

/// Response/message language. Unknown values fall back to Russian, the
/// gateway default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    Ru,
    En,
}

impl Lang {
    pub fn from_code(code: &str) -> Lang {
        match code {
            "en" => Lang::En,
            _ => Lang::Ru,
        }
    }
}

fn m(lang: Lang, en: &str, ru: &str) -> String {
    match lang {
        Lang::En => s!(en),
        Lang::Ru => s!(ru),
    }
}

/// Deserializes a JSON body into a typed request; a shape mismatch is a
/// validation failure, not a 500.
pub fn parse<T: DeserializeOwned>(body: &Value) -> Result<T, Error> {
    serde_json::from_value(body.clone()).map_err(|e| {
        let mut errors = ValidationErrors::default();
        errors.push("request", format!("malformed request: {}", e));
        Error::Validation(errors)
    })
}

// Syntactic pre-checks used by the authenticator before any lookup.

pub fn slug_ok(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 50 && SLUG_RE.is_match(slug)
}

pub fn token_ok(token: &str) -> bool {
    !token.is_empty() && token.len() <= 256 && TOKEN_RE.is_match(token)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub items: Option<Vec<ReceiptItem>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptItem {
    pub name: String,
    pub quantity: i64,
    pub price: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub team_slug: String,
    pub token: String,
    pub amount: i64,
    pub order_id: String,
    pub currency: String,
    pub pay_type: Option<String>,
    pub description: Option<String>,
    pub customer_key: Option<String>,
    pub recurrent: Option<String>,
    pub language: Option<String>,
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
    pub notification_url: Option<String>,
    pub payment_expiry: Option<i32>,
    pub redirect_due_date: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub receipt: Option<Receipt>,
}

impl InitRequest {
    pub fn lang(&self) -> Lang {
        Lang::from_code(self.language.as_deref().unwrap_or("ru"))
    }

    /// Only valid after [`validate_init`] has passed.
    pub fn pay_type(&self) -> PayType {
        match self.pay_type.as_deref() {
            Some("T") => PayType::TwoStage,
            _ => PayType::SingleStage,
        }
    }

    pub fn language_code(&self) -> String {
        s!(self.language.as_deref().unwrap_or("ru"))
    }

    pub fn expiry_minutes(&self) -> i32 {
        self.payment_expiry
            .unwrap_or(DEFAULT_PAYMENT_EXPIRY_MINUTES)
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrent.as_deref() == Some("Y")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub team_slug: String,
    pub token: String,
    pub payment_id: String,
    pub amount: Option<i64>,
    pub data: Option<Map<String, Value>>,
}

impl ConfirmRequest {
    pub fn idempotency_key(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get("idempotencyKey"))
            .and_then(|v| v.as_str())
            .map(|v| s!(v))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub team_slug: String,
    pub token: String,
    pub payment_id: String,
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub team_slug: String,
    pub token: String,
    pub payment_id: Option<String>,
    pub order_id: Option<String>,
    pub include_transitions: Option<bool>,
}

fn check_order_id(errors: &mut ValidationErrors, order_id: &str, lang: Lang) {
    if order_id.is_empty() {
        errors.push("orderId", m(lang, "is required", "обязательное поле"));
    } else if order_id.len() > 36 || !SLUG_RE.is_match(order_id) {
        errors.push(
            "orderId",
            m(
                lang,
                "must be up to 36 characters of [A-Za-z0-9_-]",
                "до 36 символов из [A-Za-z0-9_-]",
            ),
        );
    }
}

fn check_payment_id(errors: &mut ValidationErrors, payment_id: &str, lang: Lang) {
    if payment_id.is_empty() {
        errors.push("paymentId", m(lang, "is required", "обязательное поле"));
    } else if payment_id.len() > 20 || !PAYMENT_ID_RE.is_match(payment_id) {
        errors.push(
            "paymentId",
            m(lang, "must be up to 20 digits", "до 20 цифр"),
        );
    }
}

fn check_amount_bounds(errors: &mut ValidationErrors, amount: i64, lang: Lang) {
    if amount < MIN_AMOUNT {
        errors.push(
            "amount",
            m(
                lang,
                "must be at least 1000 minor units",
                "не менее 1000 минорных единиц",
            ),
        );
    } else if amount > MAX_AMOUNT {
        errors.push(
            "amount",
            m(
                lang,
                "must not exceed 50000000 minor units",
                "не более 50000000 минорных единиц",
            ),
        );
    }
}

fn check_url(errors: &mut ValidationErrors, field: &str, value: &str, lang: Lang) {
    let invalid = || {
        m(
            lang,
            "must be an absolute http(s) URL up to 2048 characters",
            "должен быть абсолютным http(s) URL до 2048 символов",
        )
    };
    if value.len() > MAX_URL_LENGTH {
        errors.push(field, invalid());
        return;
    }
    match Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        _ => errors.push(field, invalid()),
    }
}

fn check_email(errors: &mut ValidationErrors, field: &str, value: &str, lang: Lang) {
    if value.len() > 254 || !EMAIL_RE.is_match(value) {
        errors.push(
            field,
            m(lang, "is not a valid email", "некорректный email"),
        );
    }
}

fn check_phone(errors: &mut ValidationErrors, field: &str, value: &str, lang: Lang) {
    if !PHONE_RE.is_match(value) {
        errors.push(
            field,
            m(lang, "is not a valid phone number", "некорректный телефон"),
        );
    }
}

fn check_data_map(errors: &mut ValidationErrors, data: &Map<String, Value>, lang: Lang) {
    if data.len() > MAX_DATA_ENTRIES {
        errors.push(
            "data",
            m(
                lang,
                "must not exceed 20 entries",
                "не более 20 элементов",
            ),
        );
    }
    if let Some(phone) = data.get("Phone").and_then(|v| v.as_str()) {
        check_phone(errors, "data.Phone", phone, lang);
    }
    if let Some(account) = data.get("account").and_then(|v| v.as_str()) {
        if account.len() > 30 {
            errors.push(
                "data.account",
                m(lang, "must be up to 30 characters", "до 30 символов"),
            );
        }
    }
}

fn parse_due_date(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()
}

fn check_receipt(
    errors: &mut ValidationErrors,
    receipt: &Receipt,
    payment_amount: i64,
    customer_email: Option<&str>,
    customer_phone: Option<&str>,
    lang: Lang,
) {
    if let Some(email) = receipt.email.as_deref() {
        check_email(errors, "receipt.email", email, lang);
        if let Some(customer) = customer_email {
            if customer != email {
                errors.push(
                    "receipt.email",
                    m(
                        lang,
                        "must match the customer email",
                        "должен совпадать с email покупателя",
                    ),
                );
            }
        }
    }
    if let Some(phone) = receipt.phone.as_deref() {
        check_phone(errors, "receipt.phone", phone, lang);
        if let Some(customer) = customer_phone {
            if customer != phone {
                errors.push(
                    "receipt.phone",
                    m(
                        lang,
                        "must match the customer phone",
                        "должен совпадать с телефоном покупателя",
                    ),
                );
            }
        }
    }
    if let Some(items) = receipt.items.as_deref() {
        let mut total: i64 = 0;
        for (idx, item) in items.iter().enumerate() {
            if item.amount != item.quantity * item.price {
                errors.push(
                    &format!("receipt.items[{}].amount", idx),
                    m(
                        lang,
                        "must equal quantity * price",
                        "должна равняться quantity * price",
                    ),
                );
            }
            total += item.amount;
        }
        if total != payment_amount {
            errors.push(
                "receipt.items",
                m(
                    lang,
                    "item amounts must sum to the payment amount",
                    "сумма позиций должна равняться сумме платежа",
                ),
            );
        }
    }
}

pub fn validate_init(req: &InitRequest, merchant: &Merchant) -> Result<(), Error> {
    let lang = req.lang();
    let mut errors = ValidationErrors::default();

    check_order_id(&mut errors, &req.order_id, lang);
    check_amount_bounds(&mut errors, req.amount, lang);

    if !CURRENCY_RE.is_match(&req.currency) {
        errors.push(
            "currency",
            m(
                lang,
                "must be a 3-letter uppercase ISO-4217 code",
                "3 заглавные буквы кода ISO-4217",
            ),
        );
    }

    match req.pay_type.as_deref() {
        None | Some("O") | Some("T") => {}
        Some(_) => errors.push("payType", m(lang, "must be O or T", "допустимы O или T")),
    }

    if let Some(language) = req.language.as_deref() {
        if language != "ru" && language != "en" {
            errors.push(
                "language",
                m(lang, "must be ru or en", "допустимы ru или en"),
            );
        }
    }

    let expiry = req.expiry_minutes();
    if expiry < 1 || expiry > MAX_PAYMENT_EXPIRY_MINUTES {
        errors.push(
            "paymentExpiry",
            m(
                lang,
                "must be between 1 and 43200 minutes",
                "от 1 до 43200 минут",
            ),
        );
    } else if expiry < merchant.min_expiry_minutes || expiry > merchant.max_expiry_minutes {
        errors.push(
            "paymentExpiry",
            m(
                lang,
                "is outside the expiry range allowed for this merchant",
                "вне диапазона, разрешённого для мерчанта",
            ),
        );
    }

    if let Some(description) = req.description.as_deref() {
        if description.len() > 140 {
            errors.push(
                "description",
                m(lang, "must be up to 140 characters", "до 140 символов"),
            );
        }
    }

    if let Some(customer_key) = req.customer_key.as_deref() {
        if customer_key.len() > 36 {
            errors.push(
                "customerKey",
                m(lang, "must be up to 36 characters", "до 36 символов"),
            );
        }
    }

    match req.recurrent.as_deref() {
        None | Some("Y") | Some("N") => {}
        Some(_) => errors.push("recurrent", m(lang, "must be Y or N", "допустимы Y или N")),
    }
    if req.is_recurrent() && req.customer_key.as_deref().map_or(true, str::is_empty) {
        errors.push(
            "customerKey",
            m(
                lang,
                "is required for recurrent payments",
                "обязателен для рекуррентных платежей",
            ),
        );
    }

    let mut schemes: Vec<&str> = Vec::new();
    for (field, value) in [
        ("successUrl", req.success_url.as_deref()),
        ("failUrl", req.fail_url.as_deref()),
        ("notificationUrl", req.notification_url.as_deref()),
    ] {
        if let Some(value) = value {
            check_url(&mut errors, field, value, lang);
            if let Ok(url) = Url::parse(value) {
                if url.scheme() == "http" || url.scheme() == "https" {
                    schemes.push(if url.scheme() == "http" { "http" } else { "https" });
                }
            }
        }
    }
    if schemes.windows(2).any(|w| w[0] != w[1]) {
        errors.push(
            "successUrl",
            m(
                lang,
                "callback URLs must share one protocol",
                "URL обратных вызовов должны использовать один протокол",
            ),
        );
    }

    if let Some(email) = req.email.as_deref() {
        check_email(&mut errors, "email", email, lang);
    }
    if let Some(phone) = req.phone.as_deref() {
        check_phone(&mut errors, "phone", phone, lang);
    }

    if let Some(raw) = req.redirect_due_date.as_deref() {
        let now = Utc::now().naive_utc();
        match parse_due_date(raw) {
            Some(due) if due > now && due <= now + Duration::days(MAX_REDIRECT_DUE_DAYS) => {}
            Some(_) => errors.push(
                "redirectDueDate",
                m(
                    lang,
                    "must be in the future and at most 90 days ahead",
                    "должна быть в будущем и не далее 90 дней",
                ),
            ),
            None => errors.push(
                "redirectDueDate",
                m(lang, "is not a valid date", "некорректная дата"),
            ),
        }
    }

    if let Some(data) = req.data.as_ref() {
        check_data_map(&mut errors, data, lang);
    }

    if let Some(receipt) = req.receipt.as_ref() {
        check_receipt(
            &mut errors,
            receipt,
            req.amount,
            req.email.as_deref(),
            req.phone.as_deref(),
            lang,
        );
    }

    errors.into_result()
}

pub fn validate_confirm(req: &ConfirmRequest, lang: Lang) -> Result<(), Error> {
    let mut errors = ValidationErrors::default();
    check_payment_id(&mut errors, &req.payment_id, lang);
    if let Some(amount) = req.amount {
        if amount < 1 {
            errors.push("amount", m(lang, "must be positive", "должна быть положительной"));
        }
    }
    if let Some(data) = req.data.as_ref() {
        check_data_map(&mut errors, data, lang);
    }
    errors.into_result()
}

pub fn validate_cancel(req: &CancelRequest, lang: Lang) -> Result<(), Error> {
    let mut errors = ValidationErrors::default();
    check_payment_id(&mut errors, &req.payment_id, lang);
    if let Some(amount) = req.amount {
        if amount < 1 {
            errors.push("amount", m(lang, "must be positive", "должна быть положительной"));
        }
    }
    if let Some(reason) = req.reason.as_deref() {
        if reason.len() > 500 {
            errors.push(
                "reason",
                m(lang, "must be up to 500 characters", "до 500 символов"),
            );
        }
    }
    errors.into_result()
}

pub fn validate_check(req: &CheckRequest, lang: Lang) -> Result<(), Error> {
    let mut errors = ValidationErrors::default();
    match (req.payment_id.as_deref(), req.order_id.as_deref()) {
        (None, None) => errors.push(
            "paymentId",
            m(
                lang,
                "either paymentId or orderId is required",
                "нужен paymentId или orderId",
            ),
        ),
        (Some(payment_id), _) => check_payment_id(&mut errors, payment_id, lang),
        (None, Some(order_id)) => check_order_id(&mut errors, order_id, lang),
    }
    errors.into_result()
}

/// Card-entry form checks. PAN and CVV never leave this function in any
/// message: violations name the field only.
pub fn validate_card(card: &CardData, lang: Lang) -> Result<(), Error> {
    let mut errors = ValidationErrors::default();
    if !PAN_RE.is_match(&card.pan) {
        errors.push(
            "pan",
            m(lang, "must be 12 to 19 digits", "от 12 до 19 цифр"),
        );
    }
    if !CVV_RE.is_match(&card.cvv) {
        errors.push("cvv", m(lang, "must be 3 or 4 digits", "3 или 4 цифры"));
    }
    match CARD_EXPIRY_RE.captures(&card.exp_date) {
        None => errors.push(
            "expDate",
            m(lang, "must look like MM/YY", "в формате MM/YY"),
        ),
        Some(captures) => {
            let month: u32 = captures[1].parse().unwrap_or(1);
            let year: i32 = 2000 + captures[2].parse::<i32>().unwrap_or(0);
            let now = Utc::now().naive_utc().date();
            let expired = year < now.year() || (year == now.year() && month < now.month());
            if expired {
                errors.push("expDate", m(lang, "card has expired", "срок карты истёк"));
            }
        }
    }
    if card.card_holder.as_deref().map_or(false, |h| h.len() > 64) {
        errors.push(
            "cardHolder",
            m(lang, "must be up to 64 characters", "до 64 символов"),
        );
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::FormValidation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn merchant() -> Merchant {
        Merchant {
            team_slug: s!("demo-team"),
            password: s!("secret123"),
            is_active: true,
            supported_currencies: vec![s!("RUB"), s!("USD")],
            min_per_payment: 1_000,
            max_per_payment: 50_000_000,
            daily_total: 500_000_000,
            daily_count: 10_000,
            min_expiry_minutes: 1,
            max_expiry_minutes: MAX_PAYMENT_EXPIRY_MINUTES,
            success_url: None,
            fail_url: None,
            notification_url: None,
            failed_auth_attempts: 0,
            locked_until: None,
            last_auth_at: None,
            created_at: Utc::now().naive_utc(),
        }
    }

    fn init_request() -> InitRequest {
        InitRequest {
            team_slug: s!("demo-team"),
            token: s!("deadbeef"),
            amount: 100_000,
            order_id: s!("O1"),
            currency: s!("RUB"),
            pay_type: Some(s!("O")),
            description: None,
            customer_key: None,
            recurrent: None,
            language: Some(s!("en")),
            success_url: None,
            fail_url: None,
            notification_url: None,
            payment_expiry: Some(30),
            redirect_due_date: None,
            email: None,
            phone: None,
            data: None,
            receipt: None,
        }
    }

    fn fields(err: Error) -> Vec<String> {
        match err {
            Error::Validation(errors) | Error::FormValidation(errors) => {
                errors.0.into_iter().map(|e| e.field).collect()
            }
            other => panic!("expected validation error, got {}", other),
        }
    }

    #[test]
    fn valid_init_passes() {
        assert!(validate_init(&init_request(), &merchant()).is_ok());
    }

    #[test]
    fn amount_boundaries() {
        let mut req = init_request();
        req.amount = 999;
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["amount"]);
        req.amount = 1_000;
        assert!(validate_init(&req, &merchant()).is_ok());
        req.amount = MAX_AMOUNT;
        assert!(validate_init(&req, &merchant()).is_ok());
        req.amount = MAX_AMOUNT + 1;
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["amount"]);
    }

    #[test]
    fn payment_expiry_boundaries() {
        let mut req = init_request();
        req.payment_expiry = Some(0);
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["paymentExpiry"]
        );
        req.payment_expiry = Some(43_200);
        assert!(validate_init(&req, &merchant()).is_ok());
        req.payment_expiry = Some(43_201);
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["paymentExpiry"]
        );
    }

    #[test]
    fn order_id_length_boundary() {
        let mut req = init_request();
        req.order_id = "a".repeat(36);
        assert!(validate_init(&req, &merchant()).is_ok());
        req.order_id = "a".repeat(37);
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["orderId"]);
        req.order_id = s!("bad order!");
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["orderId"]);
    }

    #[test]
    fn currency_must_be_three_uppercase_letters() {
        let mut req = init_request();
        for bad in ["rub", "RU", "RUBL", "12A"] {
            req.currency = s!(bad);
            assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["currency"]);
        }
    }

    #[test]
    fn pay_type_and_language_enums() {
        let mut req = init_request();
        req.pay_type = Some(s!("X"));
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["payType"]);
        let mut req = init_request();
        req.language = Some(s!("de"));
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["language"]);
    }

    #[test]
    fn recurrent_requires_customer_key() {
        let mut req = init_request();
        req.recurrent = Some(s!("Y"));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["customerKey"]
        );
        req.customer_key = Some(s!("cust-1"));
        assert!(validate_init(&req, &merchant()).is_ok());
    }

    #[test]
    fn callback_urls_share_protocol() {
        let mut req = init_request();
        req.success_url = Some(s!("https://shop.example.com/ok"));
        req.fail_url = Some(s!("http://shop.example.com/fail"));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["successUrl"]
        );
        req.fail_url = Some(s!("https://shop.example.com/fail"));
        assert!(validate_init(&req, &merchant()).is_ok());
    }

    #[test]
    fn urls_must_be_absolute_http() {
        let mut req = init_request();
        req.notification_url = Some(s!("ftp://shop.example.com/hook"));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["notificationUrl"]
        );
        req.notification_url = Some(s!("/relative/path"));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["notificationUrl"]
        );
    }

    #[test]
    fn email_and_phone_rules() {
        let mut req = init_request();
        req.email = Some(s!("not-an-email"));
        req.phone = Some(s!("123"));
        let mut failed = fields(validate_init(&req, &merchant()).unwrap_err());
        failed.sort();
        assert_eq!(failed, ["email", "phone"]);
        req.email = Some(s!("buyer@example.com"));
        req.phone = Some(s!("+79001234567"));
        assert!(validate_init(&req, &merchant()).is_ok());
    }

    #[test]
    fn data_map_rules() {
        let mut data = Map::new();
        for i in 0..21 {
            data.insert(format!("k{}", i), Value::String(s!("v")));
        }
        let mut req = init_request();
        req.data = Some(data);
        assert_eq!(fields(validate_init(&req, &merchant()).unwrap_err()), ["data"]);

        let mut data = Map::new();
        data.insert(s!("Phone"), Value::String(s!("12")));
        data.insert(s!("account"), Value::String("x".repeat(31)));
        req.data = Some(data);
        let mut failed = fields(validate_init(&req, &merchant()).unwrap_err());
        failed.sort();
        assert_eq!(failed, ["data.Phone", "data.account"]);
    }

    #[test]
    fn receipt_item_math() {
        let mut req = init_request();
        req.amount = 5_000;
        req.receipt = Some(Receipt {
            email: None,
            phone: None,
            items: Some(vec![
                ReceiptItem {
                    name: s!("widget"),
                    quantity: 2,
                    price: 1_500,
                    amount: 3_000,
                },
                ReceiptItem {
                    name: s!("gadget"),
                    quantity: 1,
                    price: 2_000,
                    amount: 2_000,
                },
            ]),
        });
        assert!(validate_init(&req, &merchant()).is_ok());

        req.receipt.as_mut().unwrap().items.as_mut().unwrap()[0].amount = 2_999;
        let mut failed = fields(validate_init(&req, &merchant()).unwrap_err());
        failed.sort();
        assert_eq!(failed, ["receipt.items", "receipt.items[0].amount"]);
    }

    #[test]
    fn receipt_contacts_must_match_customer() {
        let mut req = init_request();
        req.email = Some(s!("buyer@example.com"));
        req.receipt = Some(Receipt {
            email: Some(s!("other@example.com")),
            phone: None,
            items: None,
        });
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["receipt.email"]
        );
    }

    #[test]
    fn redirect_due_date_window() {
        let mut req = init_request();
        req.redirect_due_date = Some(s!("2001-01-01T00:00:00"));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["redirectDueDate"]
        );
        let ok = (Utc::now() + Duration::days(10)).format("%Y-%m-%dT%H:%M:%S");
        req.redirect_due_date = Some(s!(ok));
        assert!(validate_init(&req, &merchant()).is_ok());
        let too_far = (Utc::now() + Duration::days(91)).format("%Y-%m-%dT%H:%M:%S");
        req.redirect_due_date = Some(s!(too_far));
        assert_eq!(
            fields(validate_init(&req, &merchant()).unwrap_err()),
            ["redirectDueDate"]
        );
    }

    #[test]
    fn check_requires_some_identifier() {
        let req = CheckRequest {
            team_slug: s!("demo-team"),
            token: s!("deadbeef"),
            payment_id: None,
            order_id: None,
            include_transitions: None,
        };
        assert_eq!(fields(validate_check(&req, Lang::En).unwrap_err()), ["paymentId"]);
    }

    #[test]
    fn payment_id_must_be_digits() {
        let req = ConfirmRequest {
            team_slug: s!("demo-team"),
            token: s!("deadbeef"),
            payment_id: s!("abc"),
            amount: None,
            data: None,
        };
        assert_eq!(fields(validate_confirm(&req, Lang::En).unwrap_err()), ["paymentId"]);
    }

    #[test]
    fn card_rules() {
        let card = CardData {
            pan: s!("4111111111111111"),
            exp_date: s!("12/39"),
            cvv: s!("123"),
            card_holder: Some(s!("IVAN IVANOV")),
        };
        assert!(validate_card(&card, Lang::En).is_ok());

        let bad = CardData {
            pan: s!("4111"),
            exp_date: s!("13/39"),
            cvv: s!("12"),
            card_holder: None,
        };
        let mut failed = fields(validate_card(&bad, Lang::En).unwrap_err());
        failed.sort();
        assert_eq!(failed, ["cvv", "expDate", "pan"]);

        let expired = CardData {
            pan: s!("4111111111111111"),
            exp_date: s!("01/20"),
            cvv: s!("123"),
            card_holder: None,
        };
        assert_eq!(fields(validate_card(&expired, Lang::En).unwrap_err()), ["expDate"]);
    }

    #[test]
    fn localization_switches_language() {
        let mut req = init_request();
        req.language = Some(s!("ru"));
        req.amount = 1;
        match validate_init(&req, &merchant()).unwrap_err() {
            Error::Validation(errors) => {
                assert!(errors.0[0].message.contains("не менее"));
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn auth_precheck_rules() {
        assert!(slug_ok("demo-team"));
        assert!(!slug_ok(""));
        assert!(!slug_ok(&"a".repeat(51)));
        assert!(!slug_ok("bad slug"));
        assert!(token_ok("deadBEEF00"));
        assert!(!token_ok("zz"));
        assert!(!token_ok(&"a".repeat(257)));
    }
}

//! Hosted card-entry form: the only customer-facing surface.
//!
//! The form is reachable by unguessable payment id alone; the POST back is
//! fenced with an HMAC CSRF token derived from the payment id. Card data
//! exists only inside the request scope.

use crate::app::AppState;
use crate::bank::CardData;
use crate::db::GetPayment;
use crate::errors::Error;
use crate::fsm::{LoadForm, SubmitForm};
use crate::models::{Payment, PaymentStatus};
use crate::sign;
use crate::validators::{self, Lang};
use actix_web::{web, HttpResponse};
use askama::Template;
use serde::{Deserialize, Serialize};

#[derive(Template)]
#[template(path = "payment_form.html")]
struct PaymentFormTemplate<'a> {
    payment: &'a Payment,
    amount_display: String,
    csrf: &'a str,
}

fn amount_display(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}

pub async fn show_form(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let payment_id = path.into_inner();
    if payment_id.len() > 20 || !payment_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::PaymentNotFound(payment_id));
    }

    let payment = state.fsm.send(LoadForm { payment_id }).await??;
    let csrf = sign::hmac_sha256_hex(state.cfg.csrf_key.as_bytes(), payment.id.as_bytes());
    let html = PaymentFormTemplate {
        payment: &payment,
        amount_display: amount_display(payment.amount),
        csrf: &csrf,
    }
    .render()?;
    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFormRequest {
    pub payment_id: String,
    pub pan: String,
    pub exp_date: String,
    pub cvv: String,
    pub card_holder: Option<String>,
    pub csrf: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFormResponse {
    pub success: bool,
    pub status: String,
    pub payment_id: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

pub async fn process_form(
    form: web::Form<ProcessFormRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let form = form.into_inner();
    if !sign::hmac_verify(
        state.cfg.csrf_key.as_bytes(),
        form.payment_id.as_bytes(),
        &form.csrf,
    ) {
        return Err(Error::CsrfMismatch);
    }

    // the payment's language drives form error messages
    let current = state
        .db
        .send(GetPayment {
            payment_id: form.payment_id.clone(),
        })
        .await??;
    let lang = Lang::from_code(&current.language);

    let card = CardData {
        pan: form.pan,
        exp_date: form.exp_date,
        cvv: form.cvv,
        card_holder: form.card_holder,
    };
    validators::validate_card(&card, lang)?;

    let payment = state
        .fsm
        .send(SubmitForm {
            payment_id: form.payment_id,
            card,
        })
        .await??;

    let succeeded = matches!(
        payment.status,
        PaymentStatus::Authorized | PaymentStatus::Confirmed
    );
    let redirect_url = if succeeded {
        payment.success_url.clone()
    } else {
        payment.fail_url.clone()
    };
    // error_code on the payment is "last error"; a successful outcome
    // must not echo a stale decline from an earlier attempt
    let error_code = if succeeded {
        s!("0")
    } else {
        payment.error_code.unwrap_or_else(|| s!("0"))
    };
    Ok(HttpResponse::Ok().json(ProcessFormResponse {
        success: succeeded,
        status: s!(payment.status),
        payment_id: payment.id,
        error_code,
        message: payment.message,
        redirect_url,
    }))
}

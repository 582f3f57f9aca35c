//! Server-to-server merchant operations: Init, Confirm, Cancel, Check.
//!
//! Every handler follows the same pipeline: authenticate the raw JSON body
//! (the token covers its scalar fields), parse and validate the typed
//! request, then hand the operation to the orchestrator.

use crate::app::AppState;
use crate::errors::Error;
use crate::fsm::{Cancel, Check, Confirm, InitPayment};
use crate::handlers::PaymentResponse;
use crate::validators::{self, CancelRequest, CheckRequest, ConfirmRequest, InitRequest, Lang};
use actix_web::{web, HttpResponse};
use serde_json::Value;

pub async fn init(
    body: web::Json<Value>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let merchant = state.directory.authenticate(&body).await?;
    let req: InitRequest = validators::parse(&body)?;
    validators::validate_init(&req, &merchant)?;

    let payment = state.fsm.send(InitPayment { merchant, req }).await??;
    let payment_url = payment.payment_url(&state.cfg.domain);
    Ok(HttpResponse::Ok()
        .json(PaymentResponse::from_payment(&payment).with_payment_url(payment_url)))
}

pub async fn confirm(
    body: web::Json<Value>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let merchant = state.directory.authenticate(&body).await?;
    let req: ConfirmRequest = validators::parse(&body)?;
    validators::validate_confirm(&req, Lang::Ru)?;

    let team_slug = merchant.team_slug.clone();
    let idempotency_key = req.idempotency_key();
    if let Some(key) = idempotency_key.as_deref() {
        if let Some(cached) = state.idempotency.get(&team_slug, key) {
            return Ok(HttpResponse::Ok()
                .content_type("application/json")
                .body(cached));
        }
    }

    let payment = state.fsm.send(Confirm { merchant, req }).await??;
    let body = serde_json::to_string(&PaymentResponse::from_payment(&payment))?;
    if let Some(key) = idempotency_key.as_deref() {
        state.idempotency.put(&team_slug, key, body.clone());
    }
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(body))
}

pub async fn cancel(
    body: web::Json<Value>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let merchant = state.directory.authenticate(&body).await?;
    let req: CancelRequest = validators::parse(&body)?;
    validators::validate_cancel(&req, Lang::Ru)?;

    let payment = state.fsm.send(Cancel { merchant, req }).await??;
    let refunded = payment.refunded_amount;
    let mut response = PaymentResponse::from_payment(&payment);
    if refunded > 0 {
        response = response.with_refunded_amount(refunded);
    }
    Ok(HttpResponse::Ok().json(response))
}

pub async fn check(
    body: web::Json<Value>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let merchant = state.directory.authenticate(&body).await?;
    let req: CheckRequest = validators::parse(&body)?;
    validators::validate_check(&req, Lang::Ru)?;

    let (payment, transitions) = state.fsm.send(Check { merchant, req }).await??;
    let mut response =
        PaymentResponse::from_payment(&payment).with_refunded_amount(payment.refunded_amount);
    if let Some(transitions) = transitions {
        response = response.with_transitions(transitions);
    }
    Ok(HttpResponse::Ok().json(response))
}

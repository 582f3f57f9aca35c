use crate::models::{Payment, StateTransition};
use serde::Serialize;

pub mod form;
pub mod payment;

pub const SUCCESS_CODE: &str = "0";

/// Common merchant-facing response envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub success: bool,
    pub status: String,
    pub payment_id: String,
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "paymentURL", skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitions: Option<Vec<TransitionView>>,
}

impl PaymentResponse {
    pub fn from_payment(payment: &Payment) -> Self {
        PaymentResponse {
            success: true,
            status: s!(payment.status),
            payment_id: payment.id.clone(),
            order_id: payment.order_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            error_code: s!(SUCCESS_CODE),
            message: payment.message.clone(),
            payment_url: None,
            refunded_amount: None,
            transitions: None,
        }
    }

    pub fn with_payment_url(mut self, url: String) -> Self {
        self.payment_url = Some(url);
        self
    }

    pub fn with_refunded_amount(mut self, refunded: i64) -> Self {
        self.refunded_amount = Some(refunded);
        self
    }

    pub fn with_transitions(mut self, transitions: Vec<StateTransition>) -> Self {
        self.transitions = Some(transitions.iter().map(TransitionView::from).collect());
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionView {
    pub from_status: String,
    pub to_status: String,
    pub actor: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&StateTransition> for TransitionView {
    fn from(t: &StateTransition) -> Self {
        TransitionView {
            from_status: s!(t.from_status),
            to_status: s!(t.to_status),
            actor: t.actor.clone(),
            timestamp: t.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            error_code: t.error_code.clone(),
            message: t.message.clone(),
        }
    }
}

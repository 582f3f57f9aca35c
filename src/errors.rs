use actix::MailboxError;
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use failure::Fail;
use log::error;
use serde::Serialize;
use std::fmt;

/// One field-scoped validation message, already localized to the request
/// language.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: &str, message: String) {
        self.0.push(FieldError {
            field: s!(field),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collapses the accumulated violations into a request-level error.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", joined)
    }
}

#[derive(Fail, Debug)]
pub enum Error {
    #[fail(display = "validation failed: {}", _0)]
    Validation(ValidationErrors),

    #[fail(display = "card data rejected: {}", _0)]
    FormValidation(ValidationErrors),

    #[fail(display = "unknown merchant {}", _0)]
    MerchantNotFound(String),

    #[fail(display = "invalid token")]
    InvalidToken,

    #[fail(display = "merchant {} is temporarily locked", _0)]
    MerchantLocked(String),

    #[fail(display = "terminal {} is inactive", _0)]
    TerminalInactive(String),

    #[fail(display = "order {} already has a payment", _0)]
    DuplicateOrderId(String),

    #[fail(display = "{}", _0)]
    LimitExceeded(String),

    #[fail(display = "unsupported currency {}", _0)]
    UnsupportedCurrency(String),

    #[fail(display = "payment {} not found", _0)]
    PaymentNotFound(String),

    #[fail(display = "amount {} exceeds available amount {}", _0, _1)]
    AmountExceedsAuthorized(i64, i64),

    #[fail(display = "operation is not allowed in status {}", _0)]
    WrongPaymentStatus(String),

    #[fail(display = "payment {} was modified concurrently", _0)]
    StateConflict(String),

    #[fail(display = "bank unreachable: {}", _0)]
    Network(String),

    #[fail(display = "csrf token mismatch")]
    CsrfMismatch,

    #[fail(display = "DB error: {}", _0)]
    Db(String),

    #[fail(display = "internal error: {}", _0)]
    Internal(String),
}

/// Coarse error taxonomy, mostly for log triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    BusinessRule,
    StateConflict,
    NotFound,
    Network,
    System,
}

impl Error {
    /// Stable gateway error code sent to merchants. "0" is reserved for
    /// success and never produced here.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "1100",
            Error::FormValidation(_) | Error::CsrfMismatch => "2100",
            Error::MerchantNotFound(_) | Error::InvalidToken | Error::MerchantLocked(_) => "204",
            Error::TerminalInactive(_) => "202",
            Error::DuplicateOrderId(_) => "335",
            Error::LimitExceeded(_) => "1013",
            Error::UnsupportedCurrency(_) => "1014",
            Error::PaymentNotFound(_) => "255",
            Error::AmountExceedsAuthorized(_, _) => "1007",
            Error::WrongPaymentStatus(_) => "1003",
            Error::StateConflict(_) => "2409",
            Error::Network(_) | Error::Db(_) | Error::Internal(_) => "999",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::FormValidation(_) => ErrorKind::Validation,
            Error::MerchantNotFound(_)
            | Error::InvalidToken
            | Error::MerchantLocked(_)
            | Error::CsrfMismatch => ErrorKind::Authentication,
            Error::TerminalInactive(_)
            | Error::DuplicateOrderId(_)
            | Error::LimitExceeded(_)
            | Error::UnsupportedCurrency(_)
            | Error::AmountExceedsAuthorized(_, _) => ErrorKind::BusinessRule,
            Error::WrongPaymentStatus(_) | Error::StateConflict(_) => ErrorKind::StateConflict,
            Error::PaymentNotFound(_) => ErrorKind::NotFound,
            Error::Network(_) => ErrorKind::Network,
            Error::Db(_) | Error::Internal(_) => ErrorKind::System,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            Error::Validation(errors) | Error::FormValidation(errors) => Some(errors.to_string()),
            _ => None,
        }
    }
}

impl From<MailboxError> for Error {
    fn from(error: MailboxError) -> Self {
        Error::Internal(s!(error))
    }
}

impl From<BlockingError> for Error {
    fn from(error: BlockingError) -> Self {
        Error::Internal(s!(error))
    }
}

impl From<diesel::result::Error> for Error {
    fn from(error: diesel::result::Error) -> Self {
        Error::Db(format!("{}", error))
    }
}

impl From<r2d2::Error> for Error {
    fn from(error: r2d2::Error) -> Self {
        Error::Db(format!("cannot get connection: {}", error))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Internal(format!("{}", error))
    }
}

impl From<askama::Error> for Error {
    fn from(error: askama::Error) -> Self {
        Error::Internal(format!("template error: {}", error))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    status: String,
    error_code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_)
            | Error::FormValidation(_)
            | Error::LimitExceeded(_)
            | Error::UnsupportedCurrency(_)
            | Error::AmountExceedsAuthorized(_, _) => StatusCode::BAD_REQUEST,
            Error::MerchantNotFound(_) | Error::InvalidToken | Error::MerchantLocked(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::TerminalInactive(_) | Error::CsrfMismatch => StatusCode::FORBIDDEN,
            Error::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateOrderId(_)
            | Error::WrongPaymentStatus(_)
            | Error::StateConflict(_) => StatusCode::CONFLICT,
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Db(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self.kind() {
            // merchant mistakes are expected traffic, keep them quiet
            ErrorKind::System | ErrorKind::Network => error!("{:?}: {}", self.kind(), self),
            _ => log::debug!("{:?}: {}", self.kind(), self),
        }
        let message = match self {
            // never leak store internals to merchants
            Error::Db(_) | Error::Internal(_) => s!("internal error"),
            e => s!(e),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            success: false,
            status: String::new(),
            error_code: s!(self.code()),
            message,
            details: self.details(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::InvalidToken.code(), "204");
        assert_eq!(Error::TerminalInactive(s!("demo")).code(), "202");
        assert_eq!(Error::PaymentNotFound(s!("1")).code(), "255");
        assert_eq!(Error::DuplicateOrderId(s!("O1")).code(), "335");
        assert_eq!(Error::WrongPaymentStatus(s!("NEW")).code(), "1003");
        assert_eq!(Error::AmountExceedsAuthorized(2, 1).code(), "1007");
        assert_eq!(Error::Validation(ValidationErrors::default()).code(), "1100");
        assert_eq!(Error::StateConflict(s!("1")).code(), "2409");
        assert_eq!(Error::Internal(s!("boom")).code(), "999");
    }

    #[test]
    fn validation_errors_join_into_details() {
        let mut errors = ValidationErrors::default();
        errors.push("amount", s!("must be at least 1000"));
        errors.push("orderId", s!("is required"));
        assert_eq!(
            errors.to_string(),
            "amount: must be at least 1000; orderId: is required"
        );
        assert!(errors.clone().into_result().is_err());
        assert!(ValidationErrors::default().into_result().is_ok());
    }
}

#[macro_use]
mod macros;

pub mod app;
pub mod auth;
pub mod bank;
pub mod cron;
pub mod db;
pub mod errors;
pub mod fsm;
pub mod handlers;
pub mod idempotency;
pub mod models;
pub mod notifier;
#[allow(unused_imports)]
pub mod schema;
pub mod sign;
pub mod test_utils;
pub mod validators;

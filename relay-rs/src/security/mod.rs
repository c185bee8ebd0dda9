//! Security-related helpers
//!
//! - [`auth`]: SASL PLAIN / LOGIN decoding for SMTP AUTH

pub mod auth;

pub use auth::{decode_login, decode_plain, AuthMechanism};

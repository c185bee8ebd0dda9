//! relay-rs: SMTP submission relay for cloud email APIs
//!
//! Accepts mail over plain SMTP from local applications and hands each
//! message, unchanged, to a cloud sending API (AWS SES `SendRawEmail`).
//! The relay keeps no queue: the provider's answer becomes the SMTP reply.
//!
//! # Layout
//!
//! - [`smtp`]: TCP acceptor and per-connection protocol engine
//! - [`session`]: transaction envelope, delivery, diagnostic log context
//! - [`relay`]: outbound providers behind the [`relay::RelayClient`] trait
//! - [`security`]: SMTP AUTH credential decoding
//! - [`config`]: TOML configuration with environment overrides
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::config::Config;
//! use relay_rs::relay::MockRelay;
//! use relay_rs::session::{DiagnosticContext, SessionFactory};
//! use relay_rs::smtp::SmtpServer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let factory = SessionFactory::new(Arc::new(MockRelay::new()), DiagnosticContext::new());
//!     SmtpServer::new(&config, Arc::new(factory)).run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod relay;
pub mod security;
pub mod session;
pub mod smtp;

pub use error::{RelayRsError, Result};

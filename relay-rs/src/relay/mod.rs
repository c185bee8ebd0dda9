//! Outbound relay providers
//!
//! A [`RelayClient`] accepts a raw message plus its envelope and hands back
//! the provider's delivery identifier. One client instance is shared by all
//! SMTP sessions, so implementations must be safe for concurrent use.
//!
//! - [`ses`]: AWS SES `SendRawEmail`
//! - [`mock`]: dry-run provider for local development and tests
//! - [`provider`]: AWS credential chain used by the SES client

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

pub mod credentials;
pub mod mock;
pub mod provider;
pub mod ses;
mod sigv4;

pub use credentials::AwsCredentials;
pub use mock::MockRelay;
pub use provider::{CredentialSource, CredentialsProvider};
pub use ses::SesClient;

/// Message handed to the provider: envelope plus unmodified body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub source: String,
    /// Envelope recipients in the order they were received, duplicates kept
    pub destinations: Vec<String>,
    pub raw_message: Bytes,
}

/// Opaque identifier the provider assigns to an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryId(String);

impl DeliveryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Network failure before a provider answer was received
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider asked us to slow down or is temporarily unavailable
    #[error("{code}: {message}")]
    Throttled { code: String, message: String },

    /// Provider refused the request (auth, validation, rejected content)
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    /// Provider answered with something we could not interpret
    #[error("unexpected provider response: {0}")]
    Provider(String),
}

impl RelayError {
    /// Whether a client retrying the same transaction later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::Throttled { .. })
    }
}

/// Outbound email-sending service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Send one message; called exactly once per completed SMTP transaction
    async fn send(&self, request: &RelayRequest) -> Result<DeliveryId, RelayError>;
}

//! Mock relay for local development and testing
//!
//! Records every request and answers with either a scripted outcome or a
//! freshly generated delivery id. Nothing leaves the process.

use super::{DeliveryId, RelayClient, RelayError, RelayRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Mock relay implementation
#[derive(Default)]
pub struct MockRelay {
    requests: Mutex<Vec<RelayRequest>>,
    outcomes: Mutex<VecDeque<Result<DeliveryId, RelayError>>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next sends with these ids, in order
    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let relay = Self::new();
        for id in ids {
            relay.push_outcome(Ok(DeliveryId::new(id)));
        }
        relay
    }

    /// Fail the next send with `err`
    pub fn failing(err: RelayError) -> Self {
        let relay = Self::new();
        relay.push_outcome(Err(err));
        relay
    }

    /// Queue the outcome of a future send
    pub fn push_outcome(&self, outcome: Result<DeliveryId, RelayError>) {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(outcome);
    }

    /// Every request received so far, oldest first
    pub fn requests(&self) -> Vec<RelayRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn send_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn send(&self, request: &RelayRequest) -> Result<DeliveryId, RelayError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let scripted = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        let outcome =
            scripted.unwrap_or_else(|| Ok(DeliveryId::new(uuid::Uuid::new_v4().to_string())));

        info!(
            "MockRelay: {} -> {:?} ({} bytes): {:?}",
            request.source,
            request.destinations,
            request.raw_message.len(),
            outcome
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request() -> RelayRequest {
        RelayRequest {
            source: "a@x.com".to_string(),
            destinations: vec!["b@y.com".to_string()],
            raw_message: Bytes::from_static(b"hello"),
        }
    }

    #[tokio::test]
    async fn test_mock_relay_generates_ids() {
        let relay = MockRelay::new();

        let first = relay.send(&request()).await.unwrap();
        let second = relay.send(&request()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(relay.send_count(), 2);
        assert_eq!(relay.requests()[0], request());
    }

    #[tokio::test]
    async fn test_mock_relay_scripted_outcomes() {
        let relay = MockRelay::with_ids(["MSG1"]);
        relay.push_outcome(Err(RelayError::Transport("down".to_string())));

        assert_eq!(relay.send(&request()).await.unwrap().as_str(), "MSG1");
        assert_eq!(
            relay.send(&request()).await.unwrap_err(),
            RelayError::Transport("down".to_string())
        );
        // Script exhausted: back to generated ids
        assert!(relay.send(&request()).await.is_ok());
    }
}

//! Session creation at connection accept time

use super::context::fields;
use super::{DiagnosticContext, RelaySession, SessionHooks};
use crate::relay::RelayClient;
use std::net::SocketAddr;
use std::sync::Arc;

/// Source of per-connection sessions for the protocol engine
///
/// Each session is moved into its own spawned task, so it has to be
/// shareable across threads.
pub trait SessionBackend: Send + Sync + 'static {
    type Session: SessionHooks + Sync + 'static;

    fn new_session(&self, peer: SocketAddr) -> Self::Session;
}

/// Binds the shared relay client and base log fields into new sessions
#[derive(Clone)]
pub struct SessionFactory {
    relay: Arc<dyn RelayClient>,
    base_context: DiagnosticContext,
}

impl SessionFactory {
    pub fn new(relay: Arc<dyn RelayClient>, base_context: DiagnosticContext) -> Self {
        Self {
            relay,
            base_context,
        }
    }

    /// New session for a connection from `peer`, with an empty transaction
    pub fn create(&self, peer: SocketAddr) -> RelaySession {
        let context = self
            .base_context
            .clone()
            .with_base(fields::CLIENT_IP, peer.ip().to_string())
            .with_base(fields::CLIENT_PORT, peer.port().to_string());

        RelaySession::new(peer, Arc::clone(&self.relay), context)
    }
}

impl SessionBackend for SessionFactory {
    type Session = RelaySession;

    fn new_session(&self, peer: SocketAddr) -> RelaySession {
        self.create(peer)
    }
}

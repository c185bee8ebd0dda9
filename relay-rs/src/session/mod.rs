//! Relay session: one per accepted SMTP connection
//!
//! The protocol engine ([`crate::smtp::SmtpConnection`]) drives a session
//! through the [`SessionHooks`] capability trait. [`RelaySession`] tracks the
//! transaction envelope, hands the finished message to the shared
//! [`RelayClient`] exactly once per DATA, and maps the outcome onto an
//! SMTP reply.
//!
//! # Transaction states
//!
//! ```text
//! Idle --MAIL--> HasSender --RCPT--> HasRecipients
//!   ^                |                    |
//!   +---- RSET / successful DATA ---------+
//! ```
//!
//! A failed DATA (body read or relay error) leaves the envelope in place so
//! the client can retry or reset.

use crate::relay::{RelayClient, RelayError, RelayRequest};
use crate::smtp::reply::{EnhancedCode, SmtpReply};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod context;
pub mod factory;

pub use context::{DiagnosticContext, FieldValue};
pub use factory::{SessionBackend, SessionFactory};

use context::fields;

/// Log event carrying every diagnostic field under its own key
macro_rules! session_event {
    ($level:ident, $ctx:expr, $($rest:tt)+) => {{
        let ctx: &DiagnosticContext = &$ctx;
        tracing::$level!(
            service = ctx.text(fields::SERVICE),
            client_ip = ctx.text(fields::CLIENT_IP),
            client_port = ctx.text(fields::CLIENT_PORT),
            client_username = ctx.text(fields::CLIENT_USERNAME),
            from = ctx.text(fields::FROM),
            recipients = ctx.text(fields::RECIPIENTS),
            delivery_id = ctx.text(fields::DELIVERY_ID),
            $($rest)+
        )
    }};
}

/// Failures surfaced to the client as SMTP replies
#[derive(Error, Debug)]
pub enum SessionError {
    /// The message stream could not be read to the end
    #[error("Error reading message body: {0}")]
    BodyRead(#[source] std::io::Error),

    /// The relay provider refused or could not be reached
    #[error("Error: transaction failed: {0}")]
    Relay(#[from] RelayError),

    /// Envelope command outside an open transaction
    #[error("Need MAIL command")]
    NoSender,
}

impl SessionError {
    pub fn to_reply(&self) -> SmtpReply {
        let message = self.to_string();
        match self {
            SessionError::BodyRead(_) => SmtpReply::new(451, Some(EnhancedCode(4, 3, 0)), message),
            SessionError::Relay(err) if err.is_transient() => {
                SmtpReply::new(451, Some(EnhancedCode(4, 3, 0)), message)
            }
            SessionError::Relay(_) => SmtpReply::new(554, Some(EnhancedCode(5, 0, 0)), message),
            SessionError::NoSender => SmtpReply::bad_sequence(message),
        }
    }
}

/// Observable transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HasSender,
    HasRecipients,
}

/// Operations a protocol engine invokes on a session
///
/// The engine serialises calls per connection; implementations never see
/// two operations at once.
#[async_trait]
pub trait SessionHooks: Send {
    /// AUTH: record the identity; any credential is accepted
    fn authenticate(&mut self, identity: &str, credential: &str) -> Result<(), SessionError>;

    /// MAIL FROM
    fn set_sender(&mut self, address: &str) -> Result<(), SessionError>;

    /// RCPT TO
    fn add_recipient(&mut self, address: &str) -> Result<(), SessionError>;

    /// DATA: consume the message and return the final reply
    async fn receive_body(
        &mut self,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<SmtpReply, SessionError>;

    /// RSET
    fn reset(&mut self);

    /// Connection is going away
    fn logout(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Envelope {
    Idle,
    Open {
        sender: String,
        recipients: Vec<String>,
    },
}

pub struct RelaySession {
    peer: SocketAddr,
    authenticated: Option<String>,
    envelope: Envelope,
    context: DiagnosticContext,
    relay: Arc<dyn RelayClient>,
}

impl RelaySession {
    /// Sessions are normally created by [`SessionFactory::create`]
    pub(crate) fn new(
        peer: SocketAddr,
        relay: Arc<dyn RelayClient>,
        context: DiagnosticContext,
    ) -> Self {
        Self {
            peer,
            authenticated: None,
            envelope: Envelope::Idle,
            context,
            relay,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn authenticated_identity(&self) -> Option<&str> {
        self.authenticated.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Idle => None,
            Envelope::Open { sender, .. } => Some(sender),
        }
    }

    pub fn recipients(&self) -> &[String] {
        match &self.envelope {
            Envelope::Idle => &[],
            Envelope::Open { recipients, .. } => recipients,
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.envelope {
            Envelope::Idle => SessionState::Idle,
            Envelope::Open { recipients, .. } if recipients.is_empty() => SessionState::HasSender,
            Envelope::Open { .. } => SessionState::HasRecipients,
        }
    }

    pub fn context(&self) -> &DiagnosticContext {
        &self.context
    }
}

#[async_trait]
impl SessionHooks for RelaySession {
    fn authenticate(&mut self, identity: &str, _credential: &str) -> Result<(), SessionError> {
        self.authenticated = Some(identity.to_string());
        self.context.set_base(fields::CLIENT_USERNAME, identity);
        session_event!(debug, self.context, "AUTH accepted");
        Ok(())
    }

    fn set_sender(&mut self, address: &str) -> Result<(), SessionError> {
        session_event!(debug, self.context, "MAIL FROM: {}", address);

        // A repeated MAIL replaces the sender and keeps the recipients gathered so far
        match self.envelope {
            Envelope::Open { ref mut sender, .. } => *sender = address.to_string(),
            Envelope::Idle => {
                self.envelope = Envelope::Open {
                    sender: address.to_string(),
                    recipients: Vec::new(),
                }
            }
        }
        self.context.set(fields::FROM, address);
        Ok(())
    }

    fn add_recipient(&mut self, address: &str) -> Result<(), SessionError> {
        let recipients = match &mut self.envelope {
            Envelope::Idle => return Err(SessionError::NoSender),
            Envelope::Open { recipients, .. } => recipients,
        };
        recipients.push(address.to_string());
        let snapshot = recipients.clone();

        self.context.set(fields::RECIPIENTS, snapshot);
        session_event!(debug, self.context, "RCPT TO: {}", address);
        Ok(())
    }

    async fn receive_body(
        &mut self,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<SmtpReply, SessionError> {
        let (source, destinations) = match &self.envelope {
            Envelope::Idle => return Err(SessionError::NoSender),
            Envelope::Open { sender, recipients } => (sender.clone(), recipients.clone()),
        };

        let mut message = Vec::new();
        if let Err(e) = body.read_to_end(&mut message).await {
            session_event!(error, self.context, "reading message body: {}", e);
            return Err(SessionError::BodyRead(e));
        }

        let request = RelayRequest {
            source,
            destinations,
            raw_message: Bytes::from(message),
        };

        let delivery_id = match self.relay.send(&request).await {
            Ok(id) => id,
            Err(e) => {
                session_event!(error, self.context, "relay send failed: {}", e);
                return Err(SessionError::Relay(e));
            }
        };

        self.context.set(fields::DELIVERY_ID, delivery_id.as_str());
        session_event!(
            info,
            self.context,
            bytes = request.raw_message.len(),
            "Sent email"
        );

        let reply = SmtpReply::new(
            250,
            Some(EnhancedCode(2, 0, 0)),
            format!("OK: queued as {}", delivery_id),
        );
        self.reset();
        Ok(reply)
    }

    fn reset(&mut self) {
        self.envelope = Envelope::Idle;
        self.context.clear_transaction();
    }

    fn logout(&mut self) {
        session_event!(debug, self.context, "session closed");
    }
}

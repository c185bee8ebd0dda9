//! SMTP submission front end (RFC 5321)
//!
//! - [`server`]: TCP acceptor spawning one task per connection
//! - [`connection`]: per-connection protocol engine driving the session hooks
//! - [`commands`]: SMTP command parsing
//! - [`reply`]: reply codes and wire formatting

pub mod commands;
pub mod connection;
pub mod reply;
pub mod server;

pub use commands::SmtpCommand;
pub use connection::{ConnectionSettings, SmtpConnection};
pub use reply::{EnhancedCode, SmtpReply};
pub use server::SmtpServer;

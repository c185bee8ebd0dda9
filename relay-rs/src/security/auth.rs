//! SMTP AUTH credential decoding
//!
//! The relay accepts any credential, so this module only decodes what the
//! client sends; there is no user database.
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)

use crate::error::{RelayRsError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Parse mechanism from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    /// Get mechanism name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Decode PLAIN authentication data into `(identity, password)`
///
/// Format: base64(`authzid \0 authcid \0 password`)
pub fn decode_plain(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| RelayRsError::CredentialEncoding(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| RelayRsError::CredentialEncoding(format!("Invalid UTF-8: {}", e)))?;
    let parts: Vec<&str> = text.split('\0').collect();

    if parts.len() != 3 {
        return Err(RelayRsError::CredentialEncoding(
            "Invalid PLAIN auth format".to_string(),
        ));
    }

    // parts[0] is the authorization identity (often empty), parts[1] the
    // authentication identity
    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one LOGIN step (username or password)
pub fn decode_login(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| RelayRsError::CredentialEncoding(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| RelayRsError::CredentialEncoding(format!("Invalid UTF-8: {}", e)))
}

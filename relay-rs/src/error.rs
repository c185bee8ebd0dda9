use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayRsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing relay credentials: {0}")]
    Credentials(String),

    #[error("Invalid credential encoding: {0}")]
    CredentialEncoding(String),
}

pub type Result<T> = std::result::Result<T, RelayRsError>;

use crate::error::{RelayRsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RelayRsError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(RelayRsError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(RelayRsError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "AUTH" => {
                let mut auth_parts = args.split_whitespace();
                let mechanism = auth_parts
                    .next()
                    .ok_or_else(|| RelayRsError::SmtpProtocol("AUTH requires mechanism".to_string()))?;
                let initial = auth_parts.next().map(str::to_string);
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial))
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_path(args, "TO:")?)),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<path> [params]` / `TO:<path> [params]`; ESMTP parameters are dropped
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        let matches_keyword = args
            .get(..keyword.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(keyword))
            .unwrap_or(false);
        if !matches_keyword {
            return Err(RelayRsError::SmtpProtocol(format!(
                "Invalid syntax, expected {}<address>",
                keyword
            )));
        }

        let rest = args[keyword.len()..].trim_start();
        let address = if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>').ok_or_else(|| {
                RelayRsError::SmtpProtocol("Unterminated address".to_string())
            })?;
            &stripped[..end]
        } else {
            rest.split_whitespace().next().unwrap_or("")
        };

        Ok(address.to_string())
    }
}

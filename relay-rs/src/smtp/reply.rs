//! SMTP replies (RFC 5321 reply codes, RFC 3463 enhanced status codes)

use std::fmt;

/// Enhanced status code `class.subject.detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub enhanced: Option<EnhancedCode>,
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, enhanced: Option<EnhancedCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(250, Some(EnhancedCode(2, 0, 0)), "OK")
    }

    pub fn bad_sequence(message: impl Into<String>) -> Self {
        Self::new(503, Some(EnhancedCode(5, 5, 1)), message)
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::new(501, Some(EnhancedCode(5, 5, 2)), message)
    }

    pub fn service_closing(message: impl Into<String>) -> Self {
        Self::new(421, Some(EnhancedCode(4, 4, 2)), message)
    }

    /// 2xx and 3xx
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// 4xx: the client may retry later
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// 5xx
    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Wire form, terminated by CRLF. Multi-line messages use `code-` continuation lines.
    pub fn to_wire(&self) -> String {
        let lines: Vec<&str> = if self.message.is_empty() {
            vec![""]
        } else {
            self.message.lines().collect()
        };
        let last = lines.len() - 1;

        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            match self.enhanced {
                Some(enhanced) => out.push_str(&format!("{}{}{} {}\r\n", self.code, sep, enhanced, line)),
                None => out.push_str(&format!("{}{}{}\r\n", self.code, sep, line)),
            }
        }
        out
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enhanced {
            Some(enhanced) => write!(f, "{} {} {}", self.code, enhanced, self.message),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_reply() {
        let reply = SmtpReply::new(250, Some(EnhancedCode(2, 0, 0)), "OK: queued as MSG123");
        assert_eq!(reply.to_wire(), "250 2.0.0 OK: queued as MSG123\r\n");
        assert!(reply.is_positive());
    }

    #[test]
    fn test_reply_without_enhanced_code() {
        let reply = SmtpReply::new(354, None, "Start mail input; end with <CRLF>.<CRLF>");
        assert_eq!(reply.to_wire(), "354 Start mail input; end with <CRLF>.<CRLF>\r\n");
    }

    #[test]
    fn test_multi_line_reply() {
        let reply = SmtpReply::new(250, None, "localhost Hello client\n8BITMIME\nAUTH PLAIN LOGIN");
        assert_eq!(
            reply.to_wire(),
            "250-localhost Hello client\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN\r\n"
        );
    }

    #[test]
    fn test_reply_classes() {
        assert!(SmtpReply::new(451, Some(EnhancedCode(4, 3, 0)), "later").is_transient());
        assert!(SmtpReply::new(554, Some(EnhancedCode(5, 0, 0)), "no").is_permanent());
        assert!(!SmtpReply::bad_sequence("Need MAIL command").is_transient());
    }
}

//! SMTP command parsing (RFC 5321 plus the CHUNKING and AUTH extensions).

use crate::error::{Result, RobinError};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// LMTP-flavored greeting, accepted alongside HELO/EHLO.
    Lhlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// BDAT chunk: declared byte count and LAST marker (RFC 3030).
    Bdat(u64, bool),
    Rset,
    Quit,
    Noop,
    Starttls,
    /// AUTH mechanism with optional initial response.
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RobinError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => Ok(SmtpCommand::Helo(Self::require_domain(args, "HELO")?)),
            "EHLO" => Ok(SmtpCommand::Ehlo(Self::require_domain(args, "EHLO")?)),
            "LHLO" => Ok(SmtpCommand::Lhlo(Self::require_domain(args, "LHLO")?)),
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_path(args, "TO:")?)),
            "DATA" => Ok(SmtpCommand::Data),
            "BDAT" => Self::parse_bdat(args),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(RobinError::SmtpProtocol(
                        "AUTH requires mechanism".to_string(),
                    ));
                }
                let auth_parts: Vec<&str> = args.splitn(2, ' ').collect();
                let mechanism = auth_parts[0].to_string();
                let initial_response = auth_parts.get(1).map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism, initial_response))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    fn require_domain(args: &str, verb: &str) -> Result<String> {
        if args.is_empty() {
            return Err(RobinError::SmtpProtocol(format!(
                "{} requires domain",
                verb
            )));
        }
        Ok(args.to_string())
    }

    /// Parses `FROM:<addr>` / `TO:<addr>`, tolerating missing brackets and
    /// ignoring trailing ESMTP parameters (SIZE=, BODY=).
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        if !args.to_uppercase().starts_with(prefix) {
            return Err(RobinError::SmtpProtocol(format!(
                "Invalid {} syntax",
                prefix.trim_end_matches(':')
            )));
        }

        let rest = args[prefix.len()..].trim();
        let path = rest.split_whitespace().next().unwrap_or("");
        let email = if path.starts_with('<') && path.ends_with('>') {
            &path[1..path.len() - 1]
        } else {
            path
        };

        Ok(email.to_string())
    }

    fn parse_bdat(args: &str) -> Result<Self> {
        let mut words = args.split_whitespace();
        let size: u64 = words
            .next()
            .ok_or_else(|| RobinError::SmtpProtocol("BDAT requires chunk size".to_string()))?
            .parse()
            .map_err(|_| RobinError::SmtpProtocol("Invalid BDAT chunk size".to_string()))?;

        let last = match words.next() {
            None => false,
            Some(word) if word.eq_ignore_ascii_case("LAST") => true,
            Some(other) => {
                return Err(RobinError::SmtpProtocol(format!(
                    "Unexpected BDAT argument: {}",
                    other
                )))
            }
        };

        Ok(SmtpCommand::Bdat(size, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_lhlo() {
        let cmd = SmtpCommand::parse("LHLO lmtp.example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Lhlo("lmtp.example.com".to_string()));
    }

    #[test]
    fn test_parse_mail_from() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn test_parse_mail_from_with_size_param() {
        let cmd = SmtpCommand::parse("MAIL FROM:<a@b> SIZE=1024").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("a@b".to_string()));
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = SmtpCommand::parse("rcpt to:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
    }

    #[test]
    fn test_parse_bdat() {
        assert_eq!(SmtpCommand::parse("BDAT 1024").unwrap(), SmtpCommand::Bdat(1024, false));
        assert_eq!(SmtpCommand::parse("BDAT 5 LAST").unwrap(), SmtpCommand::Bdat(5, true));
        assert_eq!(SmtpCommand::parse("BDAT 0 last").unwrap(), SmtpCommand::Bdat(0, true));
    }

    #[test]
    fn test_parse_bdat_rejects_garbage() {
        assert!(SmtpCommand::parse("BDAT").is_err());
        assert!(SmtpCommand::parse("BDAT ten").is_err());
        assert!(SmtpCommand::parse("BDAT 10 EXTRA").is_err());
    }

    #[test]
    fn test_parse_auth_with_initial_response() {
        let cmd = SmtpCommand::parse("AUTH PLAIN AGFsaWNlAHMzY3JldA==").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::Auth(
                "PLAIN".to_string(),
                Some("AGFsaWNlAHMzY3JldA==".to_string())
            )
        );
    }

    #[test]
    fn test_parse_auth_without_initial_response() {
        let cmd = SmtpCommand::parse("AUTH LOGIN").unwrap();
        assert_eq!(cmd, SmtpCommand::Auth("LOGIN".to_string(), None));
    }

    #[test]
    fn test_unknown_command() {
        let cmd = SmtpCommand::parse("FROB widget").unwrap();
        assert_eq!(cmd, SmtpCommand::Unknown("FROB".to_string()));
    }

    #[test]
    fn test_empty_command_is_error() {
        assert!(SmtpCommand::parse("   ").is_err());
    }
}

//! Wire-level transaction record, the backbone of assertion-based tests.

/// SMTP verbs as they appear in the transaction log. `Smtp` is the
/// banner pseudo-verb recorded when the server greets the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpVerb {
    Smtp,
    Helo,
    Ehlo,
    Lhlo,
    Starttls,
    Auth,
    Mail,
    Rcpt,
    Data,
    Bdat,
    Rset,
    Noop,
    Quit,
    Other,
}

impl SmtpVerb {
    /// Verbs whose every occurrence is recorded. All other verbs are
    /// recorded only on first sight.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, SmtpVerb::Smtp | SmtpVerb::Rcpt | SmtpVerb::Bdat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SmtpVerb::Smtp => "SMTP",
            SmtpVerb::Helo => "HELO",
            SmtpVerb::Ehlo => "EHLO",
            SmtpVerb::Lhlo => "LHLO",
            SmtpVerb::Starttls => "STARTTLS",
            SmtpVerb::Auth => "AUTH",
            SmtpVerb::Mail => "MAIL",
            SmtpVerb::Rcpt => "RCPT",
            SmtpVerb::Data => "DATA",
            SmtpVerb::Bdat => "BDAT",
            SmtpVerb::Rset => "RSET",
            SmtpVerb::Noop => "NOOP",
            SmtpVerb::Quit => "QUIT",
            SmtpVerb::Other => "OTHER",
        }
    }
}

/// Immutable record of one exchange: what the peer sent beyond the verb,
/// what the server replied, and whether the reply was a 4xx/5xx.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub verb: SmtpVerb,
    pub payload: Option<String>,
    pub response: String,
    pub error: bool,
    /// Normalized mailbox for RCPT records.
    pub address: Option<String>,
}

/// Append-only, insertion-ordered log of [`Transaction`]s with duplicate
/// suppression for non-repeatable verbs.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    entries: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record. For verbs outside the repeatable set, a second
    /// add with the same verb is silently dropped.
    pub fn add(
        &mut self,
        verb: SmtpVerb,
        payload: Option<String>,
        response: &str,
        address: Option<String>,
    ) {
        if !verb.is_repeatable() && self.entries.iter().any(|t| t.verb == verb) {
            return;
        }
        let error = response.starts_with('4') || response.starts_with('5');
        self.entries.push(Transaction {
            verb,
            payload,
            response: response.to_string(),
            error,
            address,
        });
    }

    pub fn all(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn by_verb(&self, verb: SmtpVerb) -> Vec<&Transaction> {
        self.entries.iter().filter(|t| t.verb == verb).collect()
    }

    pub fn errors(&self) -> Vec<&Transaction> {
        self.entries.iter().filter(|t| t.error).collect()
    }

    /// Addresses of all RCPT records, wire order.
    pub fn recipients(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|t| t.verb == SmtpVerb::Rcpt)
            .filter_map(|t| t.address.clone())
            .collect()
    }

    /// Addresses of RCPT records the server rejected.
    pub fn failed_recipients(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|t| t.verb == SmtpVerb::Rcpt && t.error)
            .filter_map(|t| t.address.clone())
            .collect()
    }

    pub fn has_data_error(&self) -> bool {
        self.entries
            .iter()
            .any(|t| matches!(t.verb, SmtpVerb::Data | SmtpVerb::Bdat) && t.error)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Smtp, None, "220 ready", None);
        log.add(SmtpVerb::Helo, Some("mx.test".to_string()), "250 ok", None);
        log.add(SmtpVerb::Mail, Some("a@b".to_string()), "250 ok", None);

        let verbs: Vec<SmtpVerb> = log.all().iter().map(|t| t.verb).collect();
        assert_eq!(verbs, vec![SmtpVerb::Smtp, SmtpVerb::Helo, SmtpVerb::Mail]);
    }

    #[test]
    fn test_duplicate_non_repeatable_dropped() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Helo, Some("one".to_string()), "250 ok", None);
        log.add(SmtpVerb::Helo, Some("two".to_string()), "250 ok", None);
        let helos = log.by_verb(SmtpVerb::Helo);
        assert_eq!(helos.len(), 1);
        assert_eq!(helos[0].payload.as_deref(), Some("one"));
    }

    #[test]
    fn test_repeatable_verbs_all_recorded() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Rcpt, None, "250 ok", Some("a@b".to_string()));
        log.add(SmtpVerb::Rcpt, None, "250 ok", Some("c@d".to_string()));
        log.add(SmtpVerb::Bdat, Some("10".to_string()), "250 ok", None);
        log.add(SmtpVerb::Bdat, Some("5 LAST".to_string()), "250 ok", None);
        assert_eq!(log.by_verb(SmtpVerb::Rcpt).len(), 2);
        assert_eq!(log.by_verb(SmtpVerb::Bdat).len(), 2);
    }

    #[test]
    fn test_starttls_not_repeatable() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Starttls, None, "220 go ahead", None);
        log.add(SmtpVerb::Starttls, None, "220 go ahead", None);
        assert_eq!(log.by_verb(SmtpVerb::Starttls).len(), 1);
    }

    #[test]
    fn test_error_flag_from_response_code() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Rcpt, None, "550 Blocked", Some("c@d".to_string()));
        log.add(SmtpVerb::Rcpt, None, "250 ok", Some("e@f".to_string()));
        log.add(SmtpVerb::Mail, None, "451 later", None);

        assert_eq!(log.errors().len(), 2);
        assert_eq!(log.failed_recipients(), vec!["c@d".to_string()]);
        assert_eq!(
            log.recipients(),
            vec!["c@d".to_string(), "e@f".to_string()]
        );
    }

    #[test]
    fn test_has_data_error() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Data, None, "354 go", None);
        assert!(!log.has_data_error());

        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Bdat, Some("10".to_string()), "503 bad", None);
        assert!(log.has_data_error());
    }

    #[test]
    fn test_clear() {
        let mut log = TransactionLog::new();
        log.add(SmtpVerb::Smtp, None, "220 ready", None);
        log.clear();
        assert!(log.is_empty());
    }
}

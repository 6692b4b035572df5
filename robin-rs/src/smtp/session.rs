//! Per-connection SMTP session: state, envelopes, and the command
//! dispatcher driving the server-side dialog.
//!
//! A session is owned by exactly one worker task; the dialog within a
//! connection is strictly sequential, so no internal locking is needed.

use crate::config::{ScenarioConfig, SmtpConfig};
use crate::error::{Result, RobinError};
use crate::mime::MimeParser;
use crate::security::{AuthFlow, AuthMechanism, AuthOutcome, CredentialStore, TlsContext};
use crate::smtp::client::RelayClient;
use crate::smtp::commands::SmtpCommand;
use crate::smtp::scenario::{rcpt_override, render, ScenarioMatcher};
use crate::smtp::transaction::{SmtpVerb, TransactionLog};
use crate::storage::MessageStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum accepted command line length (RFC 5321).
const MAX_LINE_LENGTH: usize = 1000;

/// Upper bound for a single BDAT chunk regardless of the size limit.
const MAX_BDAT_CHUNK: u64 = 16 * 1024 * 1024;

/// Process-wide monotonic session UID source.
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Which listener accepted this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    ImplicitTls,
    Submission,
}

/// Unified stream type so STARTTLS can swap the transport mid-session.
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state during the STARTTLS swap, never observable.
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => panic!("I/O during STARTTLS upgrade"),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => panic!("I/O during STARTTLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => panic!("I/O during STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => panic!("I/O during STARTTLS upgrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Greeted,
    MailIn,
    RcptIn,
    BdatChunks,
}

enum SessionResult {
    /// Restart command processing (after a STARTTLS upgrade).
    Continue,
    Quit,
}

/// One mail transaction inside a session.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub message_id: Option<String>,
    pub stored_path: Option<PathBuf>,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    fn new(sender: String) -> Self {
        Self {
            sender,
            recipients: Vec::new(),
            message_id: None,
            stored_path: None,
            received_at: Utc::now(),
        }
    }

    /// Appends a recipient, keeping the list ordered and unique.
    fn add_recipient(&mut self, address: &str) {
        if !self.recipients.iter().any(|r| r == address) {
            self.recipients.push(address.to_string());
        }
    }
}

/// What remains of a session once its connection closed, kept for
/// assertion-based inspection.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub uid: u64,
    pub identity: Option<(SmtpVerb, String)>,
    pub authenticated_user: Option<String>,
    pub starttls_used: bool,
    pub chunking_used: bool,
    pub log: TransactionLog,
    pub envelopes: Vec<Envelope>,
}

/// Shared collection of finished-session records, wire order per session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    records: Arc<std::sync::Mutex<Vec<SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: SessionRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn find(&self, uid: u64) -> Option<SessionRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.uid == uid)
            .cloned()
    }
}

/// Immutable per-listener wiring shared by all its sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub hostname: String,
    pub config: Arc<SmtpConfig>,
    pub kind: ListenerKind,
    pub tls: Option<TlsContext>,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub scenarios: ScenarioMatcher,
    pub store: Arc<MessageStore>,
    pub registry: SessionRegistry,
}

pub struct SmtpSession {
    uid: u64,
    ctx: SessionContext,
    state: SessionState,
    identity: Option<(SmtpVerb, String)>,
    scenario: Option<ScenarioConfig>,
    authenticated_user: Option<String>,
    is_encrypted: bool,
    starttls_used: bool,
    chunking_used: bool,
    envelopes: Vec<Envelope>,
    bdat_buffer: Vec<u8>,
    magic: HashMap<String, String>,
    error_count: usize,
    transaction_count: usize,
    log: TransactionLog,
}

impl SmtpSession {
    pub fn new(ctx: SessionContext) -> Self {
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        let mut magic = HashMap::new();
        magic.insert("uid".to_string(), uid.to_string());
        Self {
            uid,
            ctx,
            state: SessionState::Connected,
            identity: None,
            scenario: None,
            authenticated_user: None,
            is_encrypted: false,
            starttls_used: false,
            chunking_used: false,
            envelopes: Vec::new(),
            bdat_buffer: Vec::new(),
            magic,
            error_count: 0,
            transaction_count: 0,
            log: TransactionLog::new(),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn put_magic(&mut self, key: &str, value: &str) {
        self.magic.insert(key.to_string(), value.to_string());
    }

    pub fn get_magic(&self, key: &str) -> Option<&str> {
        self.magic.get(key).map(|s| s.as_str())
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// The most recently opened envelope, created on demand.
    pub fn current_envelope(&mut self) -> &mut Envelope {
        if self.envelopes.is_empty() {
            self.envelopes.push(Envelope::new(String::new()));
        }
        self.envelopes.last_mut().unwrap()
    }

    /// Starts a new envelope. Authentication is sticky across RSET.
    pub fn reset(&mut self) {
        self.bdat_buffer.clear();
        if self
            .envelopes
            .last()
            .map(|e| e.stored_path.is_none())
            .unwrap_or(false)
        {
            self.envelopes.pop();
        }
    }

    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    pub fn starttls_used(&self) -> bool {
        self.starttls_used
    }

    pub fn chunking_used(&self) -> bool {
        self.chunking_used
    }

    /// Drives a plaintext connection (ports 25 and 587).
    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        if let Ok(peer) = stream.peer_addr() {
            debug!(uid = self.uid, "Session from {}", peer);
        }
        let mut smtp_stream = SmtpStream::Plain(stream);
        let result = self.run(&mut smtp_stream).await;
        self.archive();
        result
    }

    /// Drives an implicit-TLS connection: the socket was wrapped at accept
    /// before any bytes were read (port 465).
    pub async fn handle_encrypted(mut self, stream: TlsStream<TcpStream>) -> Result<()> {
        self.is_encrypted = true;
        let mut smtp_stream = SmtpStream::Tls(Box::new(stream));
        let result = self.run(&mut smtp_stream).await;
        self.archive();
        result
    }

    /// Records what the session saw, including after I/O failures:
    /// already-written transactions remain visible.
    fn archive(self) {
        let registry = self.ctx.registry.clone();
        registry.push(SessionRecord {
            uid: self.uid,
            identity: self.identity,
            authenticated_user: self.authenticated_user,
            starttls_used: self.starttls_used,
            chunking_used: self.chunking_used,
            log: self.log,
            envelopes: self.envelopes,
        });
    }

    async fn run(&mut self, smtp_stream: &mut SmtpStream) -> Result<()> {
        let banner = format!("220 {} ESMTP Robin ready", self.ctx.hostname);
        self.log.add(SmtpVerb::Smtp, None, &banner, None);
        write_reply(smtp_stream, &banner).await?;

        loop {
            match self.process_commands(smtp_stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        // The reader borrows the stream; it must be dropped before a
        // STARTTLS upgrade can take the stream back.
        let mut buf_reader = BufReader::new(&mut *stream);
        let read_timeout = Duration::from_secs(self.ctx.config.read_timeout_secs);

        loop {
            let mut line = String::new();
            let n = match timeout(read_timeout, buf_reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    info!(uid = self.uid, "Read failed: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(uid = self.uid, "Read timeout, disconnecting");
                    write_reply(&mut buf_reader, "421 4.4.2 Timeout, closing connection").await?;
                    return Ok(SessionResult::Quit);
                }
            };

            if n == 0 {
                debug!(uid = self.uid, "Peer disconnected");
                return Ok(SessionResult::Quit);
            }

            self.transaction_count += 1;
            if self.transaction_count > self.ctx.config.transactions_limit {
                warn!(uid = self.uid, "Transaction limit exceeded");
                write_reply(&mut buf_reader, "421 4.7.0 Too many transactions").await?;
                return Ok(SessionResult::Quit);
            }

            if line.len() > MAX_LINE_LENGTH {
                if self.count_error() {
                    write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                    return Ok(SessionResult::Quit);
                }
                write_reply(&mut buf_reader, "500 5.5.2 Line too long").await?;
                continue;
            }

            let line_trimmed = line.trim_end_matches(['\r', '\n']);
            debug!(uid = self.uid, "C: {}", line_trimmed);

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!(uid = self.uid, "Unparseable command: {}", e);
                    let reply = "500 5.5.2 Syntax error";
                    self.log
                        .add(SmtpVerb::Other, Some(line_trimmed.to_string()), reply, None);
                    if self.count_error() {
                        write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                        return Ok(SessionResult::Quit);
                    }
                    write_reply(&mut buf_reader, reply).await?;
                    continue;
                }
            };

            match cmd {
                SmtpCommand::Starttls => {
                    drop(buf_reader);
                    match self.handle_starttls(stream).await? {
                        true => return Ok(SessionResult::Continue),
                        false => {
                            buf_reader = BufReader::new(&mut *stream);
                            continue;
                        }
                    }
                }
                SmtpCommand::Auth(mechanism, initial) => {
                    if self.handle_auth(&mechanism, initial, &mut buf_reader).await? {
                        write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                        return Ok(SessionResult::Quit);
                    }
                }
                SmtpCommand::Data => {
                    if self.handle_data(&mut buf_reader).await? {
                        write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                        return Ok(SessionResult::Quit);
                    }
                }
                SmtpCommand::Bdat(size, last) => {
                    if self.handle_bdat(size, last, &mut buf_reader).await? {
                        write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                        return Ok(SessionResult::Quit);
                    }
                }
                SmtpCommand::Quit => {
                    let reply = format!("221 2.0.0 {} closing connection", self.ctx.hostname);
                    self.log.add(SmtpVerb::Quit, None, &reply, None);
                    write_reply(&mut buf_reader, &reply).await?;
                    return Ok(SessionResult::Quit);
                }
                other => {
                    let (verb, payload, address, reply, counted) = self.handle_command(other);
                    self.log.add(verb, payload, &reply, address);
                    if counted && self.count_error() {
                        write_reply(&mut buf_reader, "421 4.7.0 Too many errors").await?;
                        return Ok(SessionResult::Quit);
                    }
                    write_reply(&mut buf_reader, &reply).await?;
                }
            }
        }
    }

    /// Dispatches the simple (single-reply) verbs. Returns the verb and
    /// payload for the log, the reply text, and whether a 4xx/5xx reply
    /// counts against the error limit (scenario-injected ones do not).
    fn handle_command(
        &mut self,
        cmd: SmtpCommand,
    ) -> (SmtpVerb, Option<String>, Option<String>, String, bool) {
        match cmd {
            SmtpCommand::Helo(domain) => self.handle_greeting(SmtpVerb::Helo, domain),
            SmtpCommand::Ehlo(domain) => self.handle_greeting(SmtpVerb::Ehlo, domain),
            SmtpCommand::Lhlo(domain) => self.handle_greeting(SmtpVerb::Lhlo, domain),
            SmtpCommand::MailFrom(sender) => self.handle_mail(sender),
            SmtpCommand::RcptTo(address) => self.handle_rcpt(address),
            SmtpCommand::Rset => {
                self.reset();
                if self.state != SessionState::Connected {
                    self.state = SessionState::Greeted;
                }
                (SmtpVerb::Rset, None, None, "250 2.0.0 OK".to_string(), false)
            }
            SmtpCommand::Noop => (SmtpVerb::Noop, None, None, "250 2.0.0 OK".to_string(), false),
            SmtpCommand::Unknown(verb) => (
                SmtpVerb::Other,
                Some(verb),
                None,
                "500 5.5.2 Syntax error, command unrecognized".to_string(),
                true,
            ),
            // STARTTLS, AUTH, DATA, BDAT and QUIT are handled upstream.
            _ => (
                SmtpVerb::Other,
                None,
                None,
                "503 5.5.1 Bad sequence of commands".to_string(),
                true,
            ),
        }
    }

    fn handle_greeting(
        &mut self,
        verb: SmtpVerb,
        domain: String,
    ) -> (SmtpVerb, Option<String>, Option<String>, String, bool) {
        if !matches!(self.state, SessionState::Connected | SessionState::Greeted) {
            return (
                verb,
                Some(domain),
                None,
                "503 5.5.1 Bad sequence of commands".to_string(),
                true,
            );
        }

        self.identity = Some((verb, domain.clone()));
        self.scenario = self.ctx.scenarios.select(verb, &domain).cloned();
        if self.scenario.is_some() {
            info!(uid = self.uid, identity = %domain, "Scenario bound");
        }
        let key = match verb {
            SmtpVerb::Ehlo => "ehlo",
            SmtpVerb::Lhlo => "lhlo",
            _ => "helo",
        };
        self.put_magic(key, &domain);
        self.state = SessionState::Greeted;

        let reply = if verb == SmtpVerb::Helo {
            format!("250 {} Hello {}", self.ctx.hostname, domain)
        } else {
            self.extensions_reply(&domain)
        };
        (verb, Some(domain), None, reply, false)
    }

    /// Multi-line EHLO/LHLO reply advertising the negotiated extension set.
    fn extensions_reply(&self, domain: &str) -> String {
        let mut lines = vec![format!("{} Hello {}", self.ctx.hostname, domain)];

        if self.ctx.config.starttls && self.ctx.tls.is_some() && !self.is_encrypted {
            lines.push("STARTTLS".to_string());
        }
        if self.ctx.config.auth && self.ctx.credentials.is_some() {
            lines.push(format!("AUTH {}", AuthMechanism::advertised()));
        }
        if self.ctx.config.chunking {
            lines.push("CHUNKING".to_string());
        }
        if let Some(limit) = self.ctx.config.size_limit {
            lines.push(format!("SIZE {}", limit));
        }
        lines.push("8BITMIME".to_string());
        lines.push("PIPELINING".to_string());
        lines.push("ENHANCEDSTATUSCODES".to_string());

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, l)| {
                if i == last {
                    format!("250 {}", l)
                } else {
                    format!("250-{}", l)
                }
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    fn handle_mail(
        &mut self,
        sender: String,
    ) -> (SmtpVerb, Option<String>, Option<String>, String, bool) {
        if self.state != SessionState::Greeted {
            return (
                SmtpVerb::Mail,
                Some(sender),
                None,
                "503 5.5.1 Bad sequence of commands".to_string(),
                true,
            );
        }
        // The submission listener requires prior authentication.
        if self.ctx.kind == ListenerKind::Submission
            && self.ctx.config.auth
            && self.authenticated_user.is_none()
        {
            return (
                SmtpVerb::Mail,
                Some(sender),
                None,
                "530 5.7.0 Authentication required".to_string(),
                true,
            );
        }

        self.put_magic("mail.from", &sender);
        if let Some(canned) = self.scenario.as_ref().and_then(|s| s.mail.clone()) {
            let reply = render(&canned, &self.magic);
            if !reply.starts_with('2') {
                // Scenario-injected failure: no envelope, no error count.
                return (SmtpVerb::Mail, Some(sender), None, reply, false);
            }
            self.open_envelope(sender.clone());
            self.state = SessionState::MailIn;
            return (SmtpVerb::Mail, Some(sender), None, reply, false);
        }

        self.open_envelope(sender.clone());
        self.state = SessionState::MailIn;
        (
            SmtpVerb::Mail,
            Some(sender),
            None,
            "250 2.1.0 OK".to_string(),
            false,
        )
    }

    fn open_envelope(&mut self, sender: String) {
        self.reset();
        self.envelopes.push(Envelope::new(sender));
    }

    fn handle_rcpt(
        &mut self,
        address: String,
    ) -> (SmtpVerb, Option<String>, Option<String>, String, bool) {
        if !matches!(self.state, SessionState::MailIn | SessionState::RcptIn) {
            return (
                SmtpVerb::Rcpt,
                Some(address.clone()),
                Some(address),
                "503 5.5.1 Bad sequence of commands".to_string(),
                true,
            );
        }

        self.put_magic("rcpt", &address);
        if let Some(canned) = self
            .scenario
            .as_ref()
            .and_then(|s| rcpt_override(s, &address))
            .map(|r| r.to_string())
        {
            let reply = render(&canned, &self.magic);
            if !reply.starts_with('2') {
                return (
                    SmtpVerb::Rcpt,
                    Some(address.clone()),
                    Some(address),
                    reply,
                    false,
                );
            }
            self.current_envelope().add_recipient(&address);
            self.state = SessionState::RcptIn;
            return (
                SmtpVerb::Rcpt,
                Some(address.clone()),
                Some(address),
                reply,
                false,
            );
        }

        self.current_envelope().add_recipient(&address);
        self.state = SessionState::RcptIn;
        (
            SmtpVerb::Rcpt,
            Some(address.clone()),
            Some(address),
            "250 2.1.5 OK".to_string(),
            false,
        )
    }

    /// STARTTLS: returns Ok(true) when the stream was upgraded and command
    /// processing must restart on the new transport.
    async fn handle_starttls(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        if self.state != SessionState::Greeted || self.is_encrypted || !self.ctx.config.starttls {
            let reply = "503 5.5.1 Bad sequence of commands";
            self.log.add(SmtpVerb::Starttls, None, reply, None);
            self.error_count += 1;
            if self.error_count > self.ctx.config.error_limit {
                write_reply(stream, "421 4.7.0 Too many errors").await?;
                return Err(RobinError::SmtpProtocol("Error limit exceeded".to_string()));
            }
            write_reply(stream, reply).await?;
            return Ok(false);
        }

        let Some(tls) = self.ctx.tls.clone() else {
            let reply = "454 4.7.0 TLS not available";
            self.log.add(SmtpVerb::Starttls, None, reply, None);
            write_reply(stream, reply).await?;
            return Ok(false);
        };

        // A scenario may replace the go-ahead; a non-2xx reply skips the
        // handshake entirely.
        let reply = match self.scenario.as_ref().and_then(|s| s.starttls.clone()) {
            Some(canned) => render(&canned, &self.magic),
            None => "220 2.0.0 Ready to start TLS".to_string(),
        };
        self.log.add(SmtpVerb::Starttls, None, &reply, None);
        write_reply(stream, &reply).await?;
        if !reply.starts_with('2') {
            return Ok(false);
        }

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(RobinError::Tls("Stream state mismatch".to_string()));
            }
        };

        debug!(uid = self.uid, "Performing STARTTLS handshake");
        let tls_stream = tls.acceptor().accept(tcp_stream).await.map_err(|e| {
            error!(uid = self.uid, "TLS handshake failed: {}", e);
            RobinError::Tls(format!("Handshake failed: {}", e))
        })?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.is_encrypted = true;
        self.starttls_used = true;

        // The peer must greet again on the upgraded transport.
        self.state = SessionState::Connected;
        self.identity = None;
        self.scenario = None;
        self.reset();

        info!(uid = self.uid, "STARTTLS upgrade completed");
        Ok(true)
    }

    /// AUTH sub-dialog. Returns true when the error limit was crossed.
    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.ctx.config.auth || self.ctx.credentials.is_none() {
            let reply = "502 5.5.1 AUTH not available";
            self.log.add(SmtpVerb::Auth, Some(mechanism.to_string()), reply, None);
            write_reply(buf_reader, reply).await?;
            return Ok(false);
        }
        if self.authenticated_user.is_some() {
            let reply = "503 5.5.1 Already authenticated";
            self.log.add(SmtpVerb::Auth, Some(mechanism.to_string()), reply, None);
            write_reply(buf_reader, reply).await?;
            return Ok(self.count_error());
        }
        if self.state != SessionState::Greeted {
            let reply = "503 5.5.1 Bad sequence of commands";
            self.log.add(SmtpVerb::Auth, Some(mechanism.to_string()), reply, None);
            write_reply(buf_reader, reply).await?;
            return Ok(self.count_error());
        }

        let Some(mech) = AuthMechanism::from_name(mechanism) else {
            let reply = "504 5.5.4 Mechanism not supported";
            self.log.add(SmtpVerb::Auth, Some(mechanism.to_string()), reply, None);
            write_reply(buf_reader, reply).await?;
            return Ok(self.count_error());
        };

        let store = self.ctx.credentials.as_ref().unwrap().clone();
        let mut flow = AuthFlow::new(mech, &self.ctx.hostname);
        let read_timeout = Duration::from_secs(self.ctx.config.read_timeout_secs);

        let mut input = match initial {
            Some(initial) => initial,
            None => {
                write_reply(buf_reader, &format!("334 {}", flow.initial_challenge())).await?;
                read_client_line(buf_reader, read_timeout).await?
            }
        };

        let outcome = loop {
            match flow.step(&input, store.as_ref()).await {
                Ok(AuthOutcome::Challenge(challenge)) => {
                    write_reply(buf_reader, &format!("334 {}", challenge)).await?;
                    input = read_client_line(buf_reader, read_timeout).await?;
                }
                Ok(other) => break other,
                Err(_) => break AuthOutcome::Failure,
            }
        };

        match outcome {
            AuthOutcome::Success(user) => {
                info!(uid = self.uid, user = %user, "Authentication successful");
                let reply = "235 2.7.0 Authentication successful";
                self.log
                    .add(SmtpVerb::Auth, Some(format!("{} {}", mech.name(), user)), reply, None);
                self.authenticated_user = Some(user);
                write_reply(buf_reader, reply).await?;
                Ok(false)
            }
            _ => {
                warn!(uid = self.uid, mechanism = mech.name(), "Authentication failed");
                let reply = "535 5.7.8 Authentication failed";
                self.log
                    .add(SmtpVerb::Auth, Some(mech.name().to_string()), reply, None);
                let close = self.count_error();
                if !close {
                    write_reply(buf_reader, reply).await?;
                }
                Ok(close)
            }
        }
    }

    /// DATA body reception. Returns true when the error limit was crossed.
    async fn handle_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::RcptIn
            || self.envelopes.last().map(|e| e.recipients.is_empty()).unwrap_or(true)
        {
            let reply = "503 5.5.1 Bad sequence of commands";
            self.log.add(SmtpVerb::Data, None, reply, None);
            let close = self.count_error();
            if !close {
                write_reply(buf_reader, reply).await?;
            }
            return Ok(close);
        }

        write_reply(buf_reader, "354 Start mail input; end with <CRLF>.<CRLF>").await?;

        let body = match self.read_data_body(buf_reader).await {
            Ok(body) => body,
            Err(e) => {
                // Interrupted mid-body: record the failed transaction and
                // surface the I/O error to close the connection.
                self.log
                    .add(SmtpVerb::Data, None, "451 4.3.0 Aborted during message input", None);
                return Err(e);
            }
        };

        if let Some(limit) = self.ctx.config.size_limit {
            if body.len() > limit {
                let reply = format!("552 5.3.4 Message exceeds {} bytes", limit);
                self.log.add(SmtpVerb::Data, None, &reply, None);
                let close = self.count_error();
                if !close {
                    write_reply(buf_reader, &reply).await?;
                    self.state = SessionState::Greeted;
                }
                return Ok(close);
            }
        }

        let reply = match self.scenario.as_ref().and_then(|s| s.data.clone()) {
            Some(canned) => render(&canned, &self.magic),
            None => "250 2.0.0 OK message accepted".to_string(),
        };

        if reply.starts_with('2') {
            self.finish_envelope(&body).await;
        }
        self.log.add(SmtpVerb::Data, None, &reply, None);
        write_reply(buf_reader, &reply).await?;
        self.state = SessionState::Greeted;
        Ok(false)
    }

    /// Reads DATA lines until the bare-dot terminator, stripping
    /// dot-stuffing and tolerating bare LF.
    async fn read_data_body<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = Duration::from_secs(self.ctx.config.read_timeout_secs);
        let mut body: Vec<u8> = Vec::new();

        loop {
            let mut line = Vec::new();
            let n = timeout(read_timeout, buf_reader.read_until(b'\n', &mut line))
                .await
                .map_err(|_| {
                    RobinError::SmtpProtocol("Timeout during message input".to_string())
                })??;

            if n == 0 {
                return Err(RobinError::SmtpProtocol(
                    "Connection closed during message input".to_string(),
                ));
            }

            let content = trim_line_ending(&line);
            if content == b"." {
                debug!(uid = self.uid, "End of DATA, {} bytes", body.len());
                return Ok(body);
            }

            if content.starts_with(b".") {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
        }
    }

    /// BDAT chunk reception. Returns true when the error limit was crossed.
    async fn handle_bdat<S>(
        &mut self,
        size: u64,
        last: bool,
        buf_reader: &mut BufReader<S>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let payload = if last {
            format!("{} LAST", size)
        } else {
            size.to_string()
        };

        if !self.ctx.config.chunking {
            let reply = "500 5.5.1 CHUNKING not enabled";
            self.log.add(SmtpVerb::Bdat, Some(payload), reply, None);
            let close = self.count_error();
            if !close {
                write_reply(buf_reader, reply).await?;
            }
            return Ok(close);
        }

        let in_sequence = matches!(self.state, SessionState::RcptIn | SessionState::BdatChunks)
            && self.envelopes.last().map(|e| !e.recipients.is_empty()).unwrap_or(false);

        if size > MAX_BDAT_CHUNK {
            let reply = format!("552 5.3.4 Chunk exceeds {} bytes", MAX_BDAT_CHUNK);
            self.log.add(SmtpVerb::Bdat, Some(payload), &reply, None);
            write_reply(buf_reader, &reply).await?;
            // The dialog cannot stay aligned without consuming the chunk.
            return Err(RobinError::SmtpProtocol("Oversized BDAT chunk".to_string()));
        }

        // The declared chunk bytes are consumed even when the command is
        // rejected, so the dialog stays aligned.
        let mut chunk = vec![0u8; size as usize];
        let read_timeout = Duration::from_secs(self.ctx.config.read_timeout_secs);
        timeout(read_timeout, buf_reader.read_exact(&mut chunk))
            .await
            .map_err(|_| RobinError::SmtpProtocol("Timeout during BDAT chunk".to_string()))??;

        if !in_sequence {
            let reply = "503 5.5.1 Bad sequence of commands";
            self.log.add(SmtpVerb::Bdat, Some(payload), reply, None);
            let close = self.count_error();
            if !close {
                write_reply(buf_reader, reply).await?;
            }
            return Ok(close);
        }

        self.chunking_used = true;
        self.state = SessionState::BdatChunks;
        self.bdat_buffer.extend_from_slice(&chunk);

        if let Some(limit) = self.ctx.config.size_limit {
            if self.bdat_buffer.len() > limit {
                let reply = format!("552 5.3.4 Message exceeds {} bytes", limit);
                self.log.add(SmtpVerb::Bdat, Some(payload), &reply, None);
                self.bdat_buffer.clear();
                self.state = SessionState::Greeted;
                let close = self.count_error();
                if !close {
                    write_reply(buf_reader, &reply).await?;
                }
                return Ok(close);
            }
        }

        let reply = if last {
            let body = std::mem::take(&mut self.bdat_buffer);
            let reply = format!("250 2.0.0 OK {} bytes received", body.len());
            self.finish_envelope(&body).await;
            self.state = SessionState::Greeted;
            reply
        } else {
            format!("250 2.0.0 {} bytes received", size)
        };

        self.log.add(SmtpVerb::Bdat, Some(payload), &reply, None);
        write_reply(buf_reader, &reply).await?;
        Ok(false)
    }

    /// Completes the current envelope: parse, persist, optional rename and
    /// relay. MIME trouble never fails the transaction.
    async fn finish_envelope(&mut self, body: &[u8]) {
        let parsed = match MimeParser::parse(body) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(uid = self.uid, "MIME parse failed: {}", e);
                None
            }
        };

        let message_id = parsed
            .as_ref()
            .and_then(|p| p.message_id().map(|s| s.to_string()));
        let requested_name = parsed
            .as_ref()
            .and_then(|p| p.headers.value("X-Robin-Filename").map(|s| s.to_string()));
        let relay_requested = parsed
            .as_ref()
            .and_then(|p| p.headers.value("X-Robin-Relay"))
            .is_some();

        let uid = self.uid;
        let store = self.ctx.store.clone();
        let envelope = self.current_envelope();
        envelope.message_id = message_id;
        envelope.received_at = Utc::now();

        let Some(first_recipient) = envelope.recipients.first().cloned() else {
            return;
        };

        match store.store(&first_recipient, uid, body).await {
            Ok(mut path) => {
                if let Some(name) = requested_name {
                    match store.rename(&path, &name).await {
                        Ok(renamed) => path = renamed,
                        Err(e) => warn!(uid, "Rename failed: {}", e),
                    }
                }
                envelope.stored_path = Some(path);
            }
            Err(e) => {
                error!(uid, "Storage failed: {}", e);
            }
        }

        if relay_requested || self.ctx.config.relay {
            self.relay_envelope(body).await;
        }
    }

    /// Post-receipt relay: runs on the connection task, only after the
    /// message was acknowledged.
    async fn relay_envelope(&mut self, body: &[u8]) {
        let Some(relay_host) = self.ctx.config.relay_host.clone() else {
            warn!(uid = self.uid, "Relay requested but no relay host configured");
            return;
        };
        let Some(envelope) = self.envelopes.last() else {
            return;
        };

        let client = RelayClient::new(relay_host);
        if let Err(e) = client
            .send_mail(&envelope.sender, &envelope.recipients, body)
            .await
        {
            warn!(uid = self.uid, "Relay failed: {}", e);
        }
    }

    /// Bumps the error count; true means the limit was crossed and the
    /// session must be torn down with a 421.
    fn count_error(&mut self) -> bool {
        self.error_count += 1;
        self.error_count > self.ctx.config.error_limit
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

async fn write_reply<W>(writer: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("S: {}", reply);
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_client_line<S>(
    buf_reader: &mut BufReader<S>,
    read_timeout: Duration,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = timeout(read_timeout, buf_reader.read_line(&mut line))
        .await
        .map_err(|_| RobinError::SmtpProtocol("Timeout awaiting client line".to_string()))??;
    if n == 0 {
        return Err(RobinError::SmtpProtocol(
            "Connection closed mid-dialog".to_string(),
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

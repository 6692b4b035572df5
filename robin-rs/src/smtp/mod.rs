//! SMTP protocol implementation: command parsing, per-connection sessions,
//! listeners, the outbound relay client, the transaction log and the
//! scenario engine.

pub mod client;
pub mod commands;
pub mod scenario;
pub mod server;
pub mod session;
pub mod transaction;

pub use client::RelayClient;
pub use commands::SmtpCommand;
pub use scenario::{render, ScenarioMatcher};
pub use server::SmtpServer;
pub use session::{Envelope, ListenerKind, SessionContext, SessionRecord, SessionRegistry, SmtpSession};
pub use transaction::{SmtpVerb, Transaction, TransactionLog};

//! robin-rs: programmable SMTP server and client toolkit.
//!
//! A testing MTA: concurrent listeners feed per-connection sessions whose
//! dialog is recorded in a transaction log, received bodies are run through
//! a MIME parser with per-part digests, and canned-response scenarios make
//! the server's behavior scriptable from configuration.
//!
//! # Example
//!
//! ```no_run
//! use robin_rs::config::Config;
//! use robin_rs::smtp::SmtpServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = SmtpServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration structs and TOML loading
//! - [`error`]: Error types and handling
//! - [`smtp`]: Protocol engine, listeners, relay client
//! - [`mime`]: Message parsing and per-part digests
//! - [`security`]: TLS and SASL authentication
//! - [`storage`]: Received-message store

pub mod config;
pub mod error;
pub mod mime;
pub mod security;
pub mod smtp;
pub mod storage;

pub use config::Config;
pub use error::{Result, RobinError};

//! TLS and authentication.

pub mod auth;
pub mod tls;

pub use auth::{AuthFlow, AuthMechanism, AuthOutcome, CredentialStore, DovecotAuth, StaticUsers};
pub use tls::{resolve_secret, TlsContext};

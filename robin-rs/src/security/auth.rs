//! SMTP AUTH engine: PLAIN, LOGIN, CRAM-MD5 and DIGEST-MD5 dialogues over
//! an injectable credential backend.
//!
//! Every mechanism is a small state machine stepped with the client's last
//! response line; the session layer turns `Challenge` into a 334 reply,
//! `Success` into 235 and `Failure` into 535.

use crate::config::UserConfig;
use crate::error::{Result, RobinError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

type HmacMd5 = Hmac<Md5>;

/// Supported AUTH mechanisms, in EHLO advertisement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
    CramMd5,
    DigestMd5,
}

impl AuthMechanism {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "DIGEST-MD5" => Some(Self::DigestMd5),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::DigestMd5 => "DIGEST-MD5",
        }
    }

    /// The EHLO keyword line payload.
    pub fn advertised() -> &'static str {
        "PLAIN LOGIN CRAM-MD5 DIGEST-MD5"
    }
}

/// Outcome of one mechanism step.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Send `334 <text>` and feed the next client line back in.
    Challenge(String),
    /// Authenticated as the contained user.
    Success(String),
    Failure,
}

/// Credential backend. The default is the configured user list; an
/// alternative speaks the Dovecot auth protocol over a Unix socket.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Result<bool>;

    /// Plaintext password lookup, needed by the digest mechanisms. Backends
    /// that cannot reveal passwords return `None`, which fails those
    /// mechanisms.
    async fn password(&self, username: &str) -> Result<Option<String>>;
}

/// Immutable snapshot of the configured user table.
pub struct StaticUsers {
    users: Vec<UserConfig>,
}

impl StaticUsers {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl CredentialStore for StaticUsers {
    async fn verify(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self
            .users
            .iter()
            .any(|u| u.name == username && u.password == password))
    }

    async fn password(&self, username: &str) -> Result<Option<String>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.name == username)
            .map(|u| u.password.clone()))
    }
}

/// Credential backend speaking the Dovecot auth protocol (PLAIN path) over
/// a Unix-domain socket.
pub struct DovecotAuth {
    socket_path: String,
}

impl DovecotAuth {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl CredentialStore for DovecotAuth {
    async fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let handshake = format!("VERSION\t1\t1\nCPID\t{}\n", std::process::id());
        write_half.write_all(handshake.as_bytes()).await?;

        // Server handshake ends with DONE.
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(RobinError::AuthenticationFailed);
            }
            if line.trim_end() == "DONE" {
                break;
            }
        }

        let resp = BASE64.encode(format!("\0{}\0{}", username, password));
        let request = format!("AUTH\t1\tPLAIN\tservice=smtp\tresp={}\n", resp);
        write_half.write_all(request.as_bytes()).await?;

        line.clear();
        reader.read_line(&mut line).await?;
        debug!("Dovecot auth reply: {}", line.trim_end());
        Ok(line.starts_with("OK\t"))
    }

    async fn password(&self, _username: &str) -> Result<Option<String>> {
        // Dovecot never reveals passwords; digest mechanisms cannot be
        // served from this backend.
        Ok(None)
    }
}

/// 16 random bytes from the OS entropy source, hex-encoded.
fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum FlowState {
    PlainStart,
    LoginUsername,
    LoginPassword { username: String },
    CramSent { challenge: String },
    DigestSent { nonce: String },
    DigestConfirm { username: String },
    Done,
}

/// One in-progress AUTH dialogue.
pub struct AuthFlow {
    mechanism: AuthMechanism,
    hostname: String,
    state: FlowState,
}

impl AuthFlow {
    pub fn new(mechanism: AuthMechanism, hostname: &str) -> Self {
        let state = match mechanism {
            AuthMechanism::Plain => FlowState::PlainStart,
            AuthMechanism::Login => FlowState::LoginUsername,
            AuthMechanism::CramMd5 => FlowState::CramSent {
                challenge: format!("<{}@{}>", fresh_nonce(), hostname),
            },
            AuthMechanism::DigestMd5 => FlowState::DigestSent {
                nonce: fresh_nonce(),
            },
        };
        Self {
            mechanism,
            hostname: hostname.to_string(),
            state,
        }
    }

    /// The challenge to send before any client input, when the client did
    /// not supply an initial response.
    pub fn initial_challenge(&self) -> String {
        match &self.state {
            FlowState::PlainStart => String::new(),
            FlowState::LoginUsername => BASE64.encode("Username:"),
            FlowState::CramSent { challenge } => BASE64.encode(challenge),
            FlowState::DigestSent { nonce } => {
                let challenge = format!(
                    "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    self.hostname, nonce
                );
                BASE64.encode(challenge)
            }
            _ => String::new(),
        }
    }

    /// Advances the dialogue with one client response line.
    pub async fn step(&mut self, input: &str, store: &dyn CredentialStore) -> Result<AuthOutcome> {
        let input = input.trim();
        if input == "*" {
            self.state = FlowState::Done;
            return Ok(AuthOutcome::Failure);
        }

        match std::mem::replace(&mut self.state, FlowState::Done) {
            FlowState::PlainStart => {
                let Ok((username, password)) = decode_plain(input) else {
                    return Ok(AuthOutcome::Failure);
                };
                self.finish(store.verify(&username, &password).await?, username)
            }
            FlowState::LoginUsername => {
                let Ok(username) = decode_base64_utf8(input) else {
                    return Ok(AuthOutcome::Failure);
                };
                self.state = FlowState::LoginPassword { username };
                Ok(AuthOutcome::Challenge(BASE64.encode("Password:")))
            }
            FlowState::LoginPassword { username } => {
                let Ok(password) = decode_base64_utf8(input) else {
                    return Ok(AuthOutcome::Failure);
                };
                self.finish(store.verify(&username, &password).await?, username)
            }
            FlowState::CramSent { challenge } => {
                let Ok(decoded) = decode_base64_utf8(input) else {
                    return Ok(AuthOutcome::Failure);
                };
                let Some((username, digest)) = decoded.rsplit_once(' ') else {
                    return Ok(AuthOutcome::Failure);
                };
                let Some(password) = store.password(username).await? else {
                    warn!("CRAM-MD5 unavailable for {}: no password lookup", username);
                    return Ok(AuthOutcome::Failure);
                };
                let ok = cram_md5_digest(&challenge, &password) == digest;
                self.finish(ok, username.to_string())
            }
            FlowState::DigestSent { nonce } => {
                let Ok(decoded) = decode_base64_utf8(input) else {
                    return Ok(AuthOutcome::Failure);
                };
                let fields = parse_digest_fields(&decoded);
                let (Some(username), Some(cnonce), Some(nc), Some(uri), Some(response)) = (
                    fields.get("username"),
                    fields.get("cnonce"),
                    fields.get("nc"),
                    fields.get("digest-uri"),
                    fields.get("response"),
                ) else {
                    return Ok(AuthOutcome::Failure);
                };
                if fields.get("nonce").map(|n| n.as_str()) != Some(nonce.as_str()) {
                    return Ok(AuthOutcome::Failure);
                }
                let realm = fields
                    .get("realm")
                    .cloned()
                    .unwrap_or_else(|| self.hostname.clone());

                let Some(password) = store.password(username).await? else {
                    warn!("DIGEST-MD5 unavailable for {}: no password lookup", username);
                    return Ok(AuthOutcome::Failure);
                };

                let expected =
                    digest_md5_response(username, &realm, &password, &nonce, cnonce, nc, uri, true);
                if &expected != response {
                    return Ok(AuthOutcome::Failure);
                }

                let rspauth =
                    digest_md5_response(username, &realm, &password, &nonce, cnonce, nc, uri, false);
                self.state = FlowState::DigestConfirm {
                    username: username.clone(),
                };
                Ok(AuthOutcome::Challenge(
                    BASE64.encode(format!("rspauth={}", rspauth)),
                ))
            }
            FlowState::DigestConfirm { username } => self.finish(true, username),
            FlowState::Done => Ok(AuthOutcome::Failure),
        }
    }

    pub fn mechanism(&self) -> AuthMechanism {
        self.mechanism
    }

    fn finish(&mut self, ok: bool, username: String) -> Result<AuthOutcome> {
        self.state = FlowState::Done;
        if ok {
            Ok(AuthOutcome::Success(username))
        } else {
            Ok(AuthOutcome::Failure)
        }
    }
}

/// Decodes the PLAIN initial response: base64 of `authzid NUL authcid NUL
/// password`.
pub fn decode_plain(input: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(input)
        .map_err(|e| RobinError::SmtpProtocol(format!("Invalid base64: {}", e)))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| RobinError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?;

    let parts: Vec<&str> = text.split('\0').collect();
    if parts.len() != 3 {
        return Err(RobinError::SmtpProtocol(
            "Invalid PLAIN response format".to_string(),
        ));
    }
    Ok((parts[1].to_string(), parts[2].to_string()))
}

fn decode_base64_utf8(input: &str) -> Result<String> {
    let decoded = BASE64
        .decode(input)
        .map_err(|e| RobinError::SmtpProtocol(format!("Invalid base64: {}", e)))?;
    String::from_utf8(decoded).map_err(|e| RobinError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
}

/// RFC 2195: lowercase hex of HMAC-MD5 over the challenge, keyed by the
/// password.
pub fn cram_md5_digest(challenge: &str, password: &str) -> String {
    let mut mac = HmacMd5::new_from_slice(password.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// RFC 2831 response computation (qop=auth, algorithm=md5-sess). With
/// `with_method` the A2 prefix is `AUTHENTICATE` (client response);
/// without it the prefix is empty (server rspauth).
#[allow(clippy::too_many_arguments)]
pub fn digest_md5_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    with_method: bool,
) -> String {
    let a1_inner = Md5::digest(format!("{}:{}:{}", username, realm, password));
    let mut a1 = a1_inner.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = md5_hex(&a1);

    let method = if with_method { "AUTHENTICATE" } else { "" };
    let ha2 = md5_hex(format!("{}:{}", method, digest_uri).as_bytes());

    md5_hex(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2).as_bytes())
}

/// Splits `key="value",key=value` pairs, tolerating quoted commas-free
/// values. Unknown keys are kept; malformed segments are skipped.
fn parse_digest_fields(input: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for segment in input.split(',') {
        if let Some(eq) = segment.find('=') {
            let key = segment[..eq].trim().to_lowercase();
            let value = segment[eq + 1..].trim().trim_matches('"').to_string();
            if !key.is_empty() {
                fields.insert(key, value);
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StaticUsers {
        StaticUsers::new(vec![UserConfig {
            name: "alice".to_string(),
            password: "s3cret".to_string(),
        }])
    }

    #[tokio::test]
    async fn test_plain_success() {
        let mut flow = AuthFlow::new(AuthMechanism::Plain, "robin.test");
        let input = BASE64.encode("\0alice\0s3cret");
        let outcome = flow.step(&input, &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Success("alice".to_string()));
    }

    #[tokio::test]
    async fn test_plain_wrong_password() {
        let mut flow = AuthFlow::new(AuthMechanism::Plain, "robin.test");
        let input = BASE64.encode("\0alice\0wrong");
        let outcome = flow.step(&input, &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Failure);
    }

    #[tokio::test]
    async fn test_plain_garbage_base64_fails() {
        let mut flow = AuthFlow::new(AuthMechanism::Plain, "robin.test");
        let outcome = flow.step("!!!not-base64!!!", &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Failure);
    }

    #[tokio::test]
    async fn test_login_two_prompts() {
        let mut flow = AuthFlow::new(AuthMechanism::Login, "robin.test");
        assert_eq!(flow.initial_challenge(), BASE64.encode("Username:"));

        let outcome = flow
            .step(&BASE64.encode("alice"), &store())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::Challenge(BASE64.encode("Password:")));

        let outcome = flow
            .step(&BASE64.encode("s3cret"), &store())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::Success("alice".to_string()));
    }

    #[tokio::test]
    async fn test_cram_md5_round_trip() {
        let mut flow = AuthFlow::new(AuthMechanism::CramMd5, "robin.test");
        let challenge_b64 = flow.initial_challenge();
        let challenge = String::from_utf8(BASE64.decode(challenge_b64).unwrap()).unwrap();
        assert!(challenge.starts_with('<') && challenge.ends_with("@robin.test>"));

        let digest = cram_md5_digest(&challenge, "s3cret");
        let response = BASE64.encode(format!("alice {}", digest));
        let outcome = flow.step(&response, &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Success("alice".to_string()));
    }

    #[tokio::test]
    async fn test_cram_md5_bad_digest() {
        let mut flow = AuthFlow::new(AuthMechanism::CramMd5, "robin.test");
        let response = BASE64.encode("alice 00000000000000000000000000000000");
        let outcome = flow.step(&response, &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Failure);
    }

    #[test]
    fn test_cram_md5_known_vector() {
        // RFC 2195 example: user "tim", password "tanstaaftanstaaf".
        let digest = cram_md5_digest(
            "<1896.697170952@postoffice.reston.mci.net>",
            "tanstaaftanstaaf",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[tokio::test]
    async fn test_digest_md5_round_trip() {
        let mut flow = AuthFlow::new(AuthMechanism::DigestMd5, "robin.test");
        let challenge =
            String::from_utf8(BASE64.decode(flow.initial_challenge()).unwrap()).unwrap();
        let fields = parse_digest_fields(&challenge);
        let nonce = fields.get("nonce").unwrap().clone();
        assert_eq!(fields.get("qop").map(|s| s.as_str()), Some("auth"));

        let cnonce = "deadbeefcafef00d";
        let nc = "00000001";
        let uri = "smtp/robin.test";
        let response = digest_md5_response(
            "alice",
            "robin.test",
            "s3cret",
            &nonce,
            cnonce,
            nc,
            uri,
            true,
        );
        let client = format!(
            "username=\"alice\",realm=\"robin.test\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,digest-uri=\"{}\",response={}",
            nonce, cnonce, nc, uri, response
        );

        let outcome = flow.step(&BASE64.encode(client), &store()).await.unwrap();
        let AuthOutcome::Challenge(rspauth_b64) = outcome else {
            panic!("expected rspauth challenge, got {:?}", outcome);
        };
        let rspauth = String::from_utf8(BASE64.decode(rspauth_b64).unwrap()).unwrap();
        assert!(rspauth.starts_with("rspauth="));

        let outcome = flow.step("", &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Success("alice".to_string()));
    }

    #[tokio::test]
    async fn test_digest_md5_stale_nonce_rejected() {
        let mut flow = AuthFlow::new(AuthMechanism::DigestMd5, "robin.test");
        let client = "username=\"alice\",realm=\"robin.test\",nonce=\"forged\",cnonce=\"x\",nc=00000001,qop=auth,digest-uri=\"smtp/robin.test\",response=0";
        let outcome = flow.step(&BASE64.encode(client), &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Failure);
    }

    #[tokio::test]
    async fn test_abort_line() {
        let mut flow = AuthFlow::new(AuthMechanism::Login, "robin.test");
        let outcome = flow.step("*", &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Failure);
    }

    #[test]
    fn test_mechanism_names() {
        assert_eq!(AuthMechanism::from_name("cram-md5"), Some(AuthMechanism::CramMd5));
        assert_eq!(AuthMechanism::from_name("DIGEST-MD5"), Some(AuthMechanism::DigestMd5));
        assert_eq!(AuthMechanism::from_name("SCRAM-SHA-1"), None);
        assert_eq!(AuthMechanism::advertised(), "PLAIN LOGIN CRAM-MD5 DIGEST-MD5");
    }

    #[test]
    fn test_fresh_nonce_shape() {
        let a = fresh_nonce();
        let b = fresh_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! TLS for SMTP listeners: STARTTLS upgrades and implicit-TLS accept.
//!
//! The keystore is loaded once at startup into an explicit [`TlsContext`]
//! value threaded into each listener; there is no process-global TLS state.

use crate::error::{Result, RobinError};
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Server-side TLS material shared by every listener.
#[derive(Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Loads a combined PEM keystore: certificate chain plus private key in
    /// one file. The keystore password follows the file-or-literal rule
    /// (see [`resolve_secret`]); PEM material itself is stored unencrypted.
    pub fn from_keystore<P: AsRef<Path>>(keystore: P, password: Option<&str>) -> Result<Self> {
        if let Some(password) = password {
            let resolved = resolve_secret(password);
            if resolved.is_empty() {
                return Err(RobinError::Tls("Empty keystore password".to_string()));
            }
            debug!("Keystore password resolved ({} bytes)", resolved.len());
        }

        info!("Loading keystore from {:?}", keystore.as_ref());

        let file = File::open(keystore.as_ref())
            .map_err(|e| RobinError::Tls(format!("Failed to open keystore: {}", e)))?;
        let mut reader = BufReader::new(file);

        let items = rustls_pemfile::read_all(&mut reader)
            .map_err(|e| RobinError::Tls(format!("Failed to read keystore: {}", e)))?;

        let mut certs = Vec::new();
        let mut key = None;
        for item in items {
            match item {
                Item::X509Certificate(der) => certs.push(rustls::Certificate(der)),
                Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                    if key.is_none() {
                        key = Some(rustls::PrivateKey(der));
                    }
                }
                _ => {}
            }
        }

        if certs.is_empty() {
            return Err(RobinError::Tls("No certificates in keystore".to_string()));
        }
        let key = key.ok_or_else(|| RobinError::Tls("No private key in keystore".to_string()))?;

        debug!("Loaded {} certificate(s) from keystore", certs.len());

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RobinError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Acceptor used both for STARTTLS upgrades and implicit-TLS listeners.
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Resolves a configured secret: if the value names an existing file, the
/// secret is that file's contents (trimmed); otherwise the value itself.
pub fn resolve_secret(value: &str) -> String {
    let path = Path::new(value);
    if path.is_file() {
        match std::fs::read_to_string(path) {
            Ok(contents) => return contents.trim().to_string(),
            Err(e) => {
                tracing::warn!("Failed to read secret file {:?}: {}", path, e);
            }
        }
    }
    value.to_string()
}

/// Generates a self-signed keystore for development and tests: certificate
/// and key concatenated into one PEM file.
pub fn generate_self_signed_keystore(domain: &str, keystore_output: &Path) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    info!("Generating self-signed keystore for {}", domain);

    let mut params = CertificateParams::new(vec![domain.to_string()]);
    params.distinguished_name = DistinguishedName::new();

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| RobinError::Tls(format!("Failed to generate certificate: {}", e)))?;

    let pem = cert
        .serialize_pem()
        .map_err(|e| RobinError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    let bundle = format!("{}\n{}", pem, cert.serialize_private_key_pem());

    std::fs::write(keystore_output, bundle)
        .map_err(|e| RobinError::Tls(format!("Failed to write keystore: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_generate_and_load_keystore() {
        let keystore = NamedTempFile::new().unwrap();
        generate_self_signed_keystore("test.local", keystore.path()).unwrap();

        let contents = std::fs::read_to_string(keystore.path()).unwrap();
        assert!(contents.contains("BEGIN CERTIFICATE"));
        assert!(contents.contains("PRIVATE KEY"));

        let context = TlsContext::from_keystore(keystore.path(), None).unwrap();
        assert!(Arc::strong_count(&context.server_config) >= 1);
    }

    #[test]
    fn test_missing_keystore_is_error() {
        let result = TlsContext::from_keystore("/nonexistent/keystore.pem", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_secret_literal() {
        assert_eq!(resolve_secret("hunter2"), "hunter2");
    }

    #[test]
    fn test_resolve_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-password").unwrap();
        let resolved = resolve_secret(file.path().to_str().unwrap());
        assert_eq!(resolved, "file-password");
    }
}

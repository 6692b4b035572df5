use robin_rs::config::Config;
use robin_rs::smtp::{ListenerKind, SessionRecord, SessionRegistry, SmtpServer};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// An in-process server bound to ephemeral ports, plus everything a test
/// needs to drive and inspect it.
pub struct TestServer {
    pub server: SmtpServer,
    pub plain: SocketAddr,
    pub secure: Option<SocketAddr>,
    pub submission: SocketAddr,
    pub registry: SessionRegistry,
    pub storage: TempDir,
}

impl TestServer {
    /// Starts a server with test defaults; `adjust` tweaks the config
    /// before startup.
    pub async fn start(adjust: impl FnOnce(&mut Config)) -> Self {
        let storage = TempDir::new().expect("temp storage dir");

        let mut config = Config::default();
        config.server.hostname = "robin.test".to_string();
        config.server.bind = "127.0.0.1".to_string();
        config.smtp.smtp_port = 0;
        config.smtp.secure_port = 0;
        config.smtp.submission_port = 0;
        config.storage.path = storage.path().to_string_lossy().to_string();
        adjust(&mut config);

        let server = SmtpServer::new(config).expect("server wiring");
        let registry = server.registry();
        let bound = server.start().await.expect("server startup");

        let mut plain = None;
        let mut secure = None;
        let mut submission = None;
        for (kind, addr) in bound {
            match kind {
                ListenerKind::Plain => plain = Some(addr),
                ListenerKind::ImplicitTls => secure = Some(addr),
                ListenerKind::Submission => submission = Some(addr),
            }
        }

        Self {
            server,
            plain: plain.expect("plain listener"),
            secure,
            submission: submission.expect("submission listener"),
            registry,
            storage,
        }
    }

    /// Waits for a finished-session record matching the predicate. Records
    /// are archived when the connection closes, shortly after QUIT.
    pub async fn wait_for_record(
        &self,
        predicate: impl Fn(&SessionRecord) -> bool,
    ) -> SessionRecord {
        for _ in 0..100 {
            if let Some(record) = self.registry.snapshot().into_iter().find(|r| predicate(r)) {
                return record;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no matching session record appeared");
    }
}

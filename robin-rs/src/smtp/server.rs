//! Listener setup and the accept loops.
//!
//! One task per accepted connection, drawn from a semaphore-bounded pool.
//! Shutdown is cooperative: stop accepting, drain in-flight sessions for a
//! bounded interval, then force-close whatever remains.

use crate::config::Config;
use crate::error::{Result, RobinError};
use crate::security::{CredentialStore, DovecotAuth, StaticUsers, TlsContext};
use crate::smtp::scenario::ScenarioMatcher;
use crate::smtp::session::{ListenerKind, SessionContext, SessionRegistry, SmtpSession};
use crate::storage::MessageStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Bounded drain interval before in-flight sessions are force-closed.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub struct SmtpServer {
    config: Config,
    tls: Option<TlsContext>,
    credentials: Option<Arc<dyn CredentialStore>>,
    store: Arc<MessageStore>,
    scenarios: ScenarioMatcher,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
}

impl SmtpServer {
    /// Builds the server wiring. Keystore problems are unrecoverable and
    /// surface to the startup caller.
    pub fn new(config: Config) -> Result<Self> {
        let tls = match &config.smtp.keystore {
            Some(keystore) => Some(TlsContext::from_keystore(
                keystore,
                config.smtp.keystore_password.as_deref(),
            )?),
            None => {
                if config.smtp.starttls {
                    warn!("STARTTLS enabled but no keystore configured");
                }
                None
            }
        };

        let credentials: Option<Arc<dyn CredentialStore>> = if config.smtp.auth {
            match &config.smtp.auth_socket {
                Some(socket) => {
                    info!("Using Dovecot auth backend at {}", socket);
                    Some(Arc::new(DovecotAuth::new(socket.clone())))
                }
                None => Some(Arc::new(StaticUsers::new(config.smtp.users.clone()))),
            }
        } else {
            None
        };

        let scenarios = ScenarioMatcher::new(&config.smtp.scenarios);
        if !scenarios.is_empty() {
            info!("Loaded response scenarios");
        }
        let store = Arc::new(MessageStore::new(config.storage.path.clone()));

        Ok(Self {
            config,
            tls,
            credentials,
            store,
            scenarios,
            registry: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
            force_close: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Finished-session records for assertion-based inspection.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Binds all configured listeners and spawns their accept loops.
    /// Returns the bound addresses (useful with port 0).
    pub async fn start(&self) -> Result<Vec<(ListenerKind, SocketAddr)>> {
        let mut bound = Vec::new();

        let plain = self
            .spawn_listener(ListenerKind::Plain, self.config.smtp.smtp_port)
            .await?;
        bound.push((ListenerKind::Plain, plain));

        if self.tls.is_some() {
            let secure = self
                .spawn_listener(ListenerKind::ImplicitTls, self.config.smtp.secure_port)
                .await?;
            bound.push((ListenerKind::ImplicitTls, secure));
        }

        let submission = self
            .spawn_listener(ListenerKind::Submission, self.config.smtp.submission_port)
            .await?;
        bound.push((ListenerKind::Submission, submission));

        Ok(bound)
    }

    /// Runs until interrupted, then drains.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| RobinError::Io(e))?;
        info!("Interrupt received, shutting down");
        self.stop().await;
        Ok(())
    }

    /// Cooperative shutdown: close listeners, drain for at most
    /// [`SHUTDOWN_DRAIN`], then force-close remaining sessions.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(SHUTDOWN_DRAIN, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Drain interval elapsed, force-closing remaining sessions");
            self.force_close.cancel();
            self.tracker.wait().await;
        }
        info!("Shutdown complete");
    }

    async fn spawn_listener(&self, kind: ListenerKind, port: u16) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.bind, port)
            .parse()
            .map_err(|e| RobinError::Config(format!("Invalid bind address: {}", e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.config.smtp.backlog)?;
        let local_addr = listener.local_addr()?;
        info!("{:?} listener on {}", kind, local_addr);

        let context = SessionContext {
            hostname: self.config.server.hostname.clone(),
            config: Arc::new(self.config.smtp.clone()),
            kind,
            tls: self.tls.clone(),
            credentials: self.credentials.clone(),
            scenarios: self.scenarios.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
        };

        let shutdown = self.shutdown.clone();
        let force_close = self.force_close.clone();
        let tracker = self.tracker.clone();
        let pool = Arc::new(Semaphore::new(self.config.smtp.maximum_pool_size));

        self.tracker.spawn(accept_loop(
            listener, context, shutdown, force_close, tracker, pool,
        ));

        Ok(local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: SessionContext,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
    pool: Arc<Semaphore>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("{:?} accept loop stopping", context.kind);
                return;
            }
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };
        info!("Connection from {} on {:?} listener", peer, context.kind);

        match pool.clone().try_acquire_owned() {
            Ok(permit) => {
                let context = context.clone();
                let force_close = force_close.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = force_close.cancelled() => {
                            info!("Force-closing session from {}", peer);
                        }
                        result = run_session(context, socket) => {
                            if let Err(e) = result {
                                info!("Session from {} ended: {}", peer, e);
                            }
                        }
                    }
                });
            }
            Err(_) => {
                // Pool saturated; refuse beyond the OS backlog.
                tracker.spawn(reject_busy(socket, peer));
            }
        }
    }
}

async fn run_session(context: SessionContext, socket: TcpStream) -> Result<()> {
    match context.kind {
        ListenerKind::ImplicitTls => {
            let tls = context
                .tls
                .clone()
                .ok_or_else(|| RobinError::Tls("Implicit TLS without keystore".to_string()))?;
            // Wrap before any bytes are read; failures close without reply.
            let stream = tls.acceptor().accept(socket).await.map_err(|e| {
                info!("Implicit TLS handshake failed: {}", e);
                RobinError::Tls(format!("Handshake failed: {}", e))
            })?;
            SmtpSession::new(context).handle_encrypted(stream).await
        }
        _ => SmtpSession::new(context).handle(socket).await,
    }
}

async fn reject_busy(mut socket: TcpStream, peer: SocketAddr) {
    warn!("Worker pool saturated, refusing {}", peer);
    let _ = socket
        .write_all(b"421 4.3.2 Too many concurrent sessions\r\n")
        .await;
    let _ = socket.shutdown().await;
}

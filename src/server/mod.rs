use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config;
use crate::connector::{ConnectorRegistry, SessionHandler};
use crate::logging::{LogLevel, Logger};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    TlsNotSupportedYet,
    Accept {
        source: io::Error,
    },
    SpawnFailed {
        source: io::Error,
    },
    JoinFailed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::TlsNotSupportedYet => {
                write!(f, "TLS is enabled in config but TLS transport is not implemented yet")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::SpawnFailed { source } => write!(f, "failed to spawn accept loop: {source}"),
            Self::JoinFailed => write!(f, "accept loop thread join failed"),
        }
    }
}

impl std::error::Error for ServerError {}

pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub fn bind(config: &config::ServerConfig) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupportedYet);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, ServerError> {
        match self.listener.accept() {
            Ok(accepted) => Ok(Some(accepted)),
            Err(source)
                if matches!(
                    source.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(source) => Err(ServerError::Accept { source }),
        }
    }
}

/// Accept loop thread handing every new socket to the connector registry.
pub struct Listener {
    server: Arc<TcpServer>,
    registry: Arc<ConnectorRegistry>,
    handler: Arc<dyn SessionHandler>,
    logger: Arc<Logger>,
    stopping: Arc<AtomicBool>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(
        server: TcpServer,
        registry: Arc<ConnectorRegistry>,
        handler: Arc<dyn SessionHandler>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            server: Arc::new(server),
            registry,
            handler,
            logger,
            stopping: Arc::new(AtomicBool::new(false)),
            accept_loop: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Starts accepting; a second call while running is a no-op.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut accept_loop = self
            .accept_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if accept_loop.is_some() {
            return Ok(());
        }

        self.stopping.store(false, Ordering::SeqCst);
        let server = Arc::clone(&self.server);
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let logger = Arc::clone(&self.logger);
        let stopping = Arc::clone(&self.stopping);
        let handle = thread::Builder::new()
            .name("reportd-accept".to_owned())
            .spawn(move || accept_loop_body(&server, &registry, handler, &logger, &stopping))
            .map_err(|source| ServerError::SpawnFailed { source })?;
        *accept_loop = Some(handle);
        Ok(())
    }

    /// Stops accepting new connections. Existing connectors stay with the
    /// registry.
    pub fn stop(&self) -> Result<(), ServerError> {
        self.stopping.store(true, Ordering::SeqCst);
        let handle = self
            .accept_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match handle {
            Some(handle) => handle.join().map_err(|_| ServerError::JoinFailed),
            None => Ok(()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn accept_loop_body(
    server: &TcpServer,
    registry: &ConnectorRegistry,
    handler: Arc<dyn SessionHandler>,
    logger: &Logger,
    stopping: &AtomicBool,
) {
    while !stopping.load(Ordering::SeqCst) {
        match server.try_accept() {
            Ok(Some((stream, peer_addr))) => {
                if let Err(error) = registry.open(stream, peer_addr, Arc::clone(&handler)) {
                    logger.log(
                        LogLevel::Warn,
                        Some("server::accept"),
                        "Accepted connection could not be started",
                        Some(json!({
                            "peer_addr": peer_addr.to_string(),
                            "error": error.to_string(),
                        })),
                    );
                }
                continue;
            }
            Ok(None) => {}
            Err(error) => {
                logger.log(
                    LogLevel::Warn,
                    Some("server::accept"),
                    "Accept failed",
                    Some(json!({ "error": error.to_string() })),
                );
            }
        }

        let reaped = registry.reap();
        if reaped > 0 {
            logger.log(
                LogLevel::Debug,
                Some("server::accept"),
                "Closed connections reaped",
                Some(json!({ "reaped": reaped, "open": registry.open_connections() })),
            );
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }
}

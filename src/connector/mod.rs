use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config::WireConfig;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{CodecError, FieldError, FrameBuffer, WireCodec};
use crate::wire::message::Message;
use crate::wire::protocol::{
    command_name, CMD_REQUEST_COMPLETED, CMD_RS_NOTIFY, PUSH_CORRELATION_ID, RCC_INTERNAL_ERROR,
    VID_NOTIFICATION_CODE, VID_RCC,
};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Socket timeouts of every client connection. The read timeout bounds how
/// long a stop request goes unnoticed; the write timeout bounds how long a
/// peer that stopped reading can hold a writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl SocketTimeouts {
    pub fn from_wire_config(config: &WireConfig) -> Self {
        Self {
            read: Duration::from_millis(config.read_timeout_ms.max(1)),
            write: Duration::from_millis(config.write_timeout_ms.max(1)),
        }
    }
}

/// Server-initiated pushes to every listening client.
pub trait Broadcaster: Send + Sync {
    fn send_broadcast(&self, message: &Message);

    fn notify(&self, code: u32) {
        self.send_broadcast(
            &Message::new(CMD_RS_NOTIFY, PUSH_CORRELATION_ID).with(VID_NOTIFICATION_CODE, code),
        );
    }
}

/// Receives every decoded request of a connection, plus the problems the
/// read loop survived or died of.
pub trait SessionHandler: Send + Sync {
    fn dispatch(&self, request: &Message) -> Message;
    fn transport_error(&self, connection_id: u64, error: &ConnectorError);
}

#[derive(Debug)]
pub enum ConnectorError {
    Configure { source: io::Error },
    StreamClone { source: io::Error },
    SpawnFailed { source: io::Error },
    Closed { connection_id: u64 },
    Field(FieldError),
    Codec(CodecError),
    Encode(CodecError),
    Read { source: io::Error },
    Write { source: io::Error },
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configure { source } => write!(f, "failed to configure connection socket: {source}"),
            Self::StreamClone { source } => {
                write!(f, "failed to clone connection socket for full duplex IO: {source}")
            }
            Self::SpawnFailed { source } => write!(f, "failed to spawn connection reader: {source}"),
            Self::Closed { connection_id } => write!(f, "connection {connection_id} is closed"),
            Self::Field(source) => write!(f, "field decode error: {source}"),
            Self::Codec(source) => write!(f, "frame decode error: {source}"),
            Self::Encode(source) => write!(f, "message encode error: {source}"),
            Self::Read { source } => write!(f, "socket read error: {source}"),
            Self::Write { source } => write!(f, "socket write error: {source}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

struct ConnectorShared {
    id: u64,
    peer_addr: SocketAddr,
    codec: WireCodec,
    writer: Mutex<TcpStream>,
    // Shuts the socket down without waiting for the writer lock.
    control: TcpStream,
    handler: Arc<dyn SessionHandler>,
    logger: Arc<Logger>,
    stopping: AtomicBool,
    closed: AtomicBool,
}

impl ConnectorShared {
    // Replies and pushes share the writer lock, so frames never interleave.
    // A failed or timed-out write may leave half a frame on the wire, so the
    // connection is closed.
    fn write(&self, message: &Message) -> Result<(), ConnectorError> {
        let closed = || ConnectorError::Closed {
            connection_id: self.id,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed());
        }

        let frame = self.codec.encode(message).map_err(ConnectorError::Encode)?;
        let mut writer = lock(&self.writer);
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed());
        }
        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(|source| {
                self.close_socket();
                ConnectorError::Write { source }
            })
    }

    // Returns whether this call closed the connection.
    fn close_socket(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        let _ = self.control.shutdown(Shutdown::Both);
        !was_closed
    }

    fn report(&self, error: &ConnectorError) {
        self.handler.transport_error(self.id, error);
    }
}

/// Owns one client socket: a read loop thread that dispatches decoded
/// requests inline and a writer shared with broadcasts.
pub struct Connector {
    shared: Arc<ConnectorShared>,
    reader: Mutex<Option<TcpStream>>,
    timeouts: SocketTimeouts,
    started: AtomicBool,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        codec: WireCodec,
        timeouts: SocketTimeouts,
        handler: Arc<dyn SessionHandler>,
        logger: Arc<Logger>,
    ) -> Result<Self, ConnectorError> {
        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_nodelay(true))
            .and_then(|()| stream.set_read_timeout(Some(timeouts.read)))
            .and_then(|()| stream.set_write_timeout(Some(timeouts.write)))
            .map_err(|source| ConnectorError::Configure { source })?;
        let clone = || {
            stream
                .try_clone()
                .map_err(|source| ConnectorError::StreamClone { source })
        };
        let writer = clone()?;
        let control = clone()?;

        Ok(Self {
            shared: Arc::new(ConnectorShared {
                id,
                peer_addr,
                codec,
                writer: Mutex::new(writer),
                control,
                handler,
                logger,
                stopping: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(stream)),
            timeouts,
            started: AtomicBool::new(false),
            read_loop: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Starts the read loop. Later and concurrent calls are no-ops.
    pub fn start(&self) -> Result<(), ConnectorError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let Some(stream) = lock(&self.reader).take() else {
            return Err(ConnectorError::Closed {
                connection_id: self.shared.id,
            });
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("connector-{}", self.shared.id))
            .spawn(move || read_loop(&shared, stream))
            .map_err(|source| {
                self.shared.closed.store(true, Ordering::SeqCst);
                ConnectorError::SpawnFailed { source }
            })?;
        *lock(&self.read_loop) = Some(handle);

        self.shared.logger.log(
            LogLevel::Debug,
            Some("connector::start"),
            "Connection read loop started",
            Some(json!({
                "connection_id": self.shared.id,
                "peer_addr": self.shared.peer_addr.to_string(),
                "read_timeout_ms": self.timeouts.read.as_millis() as u64,
                "write_timeout_ms": self.timeouts.write.as_millis() as u64,
            })),
        );
        Ok(())
    }

    /// Stops reading, waits for the in-flight dispatch, then releases the
    /// socket. Safe to call more than once. A writer stuck on a peer that
    /// stopped reading holds things up for at most the write timeout.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let handle = lock(&self.read_loop).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.shared.logger.log(
                    LogLevel::Error,
                    Some("connector::stop"),
                    "Connection read loop panicked",
                    Some(json!({ "connection_id": self.shared.id })),
                );
            }
        }

        let closed_now = self.shared.close_socket();
        lock(&self.reader).take();
        if closed_now {
            self.shared.logger.log(
                LogLevel::Debug,
                Some("connector::stop"),
                "Connection stopped",
                Some(json!({
                    "connection_id": self.shared.id,
                    "peer_addr": self.shared.peer_addr.to_string(),
                })),
            );
        }
    }

    pub fn send_broadcast(&self, message: &Message) -> Result<(), ConnectorError> {
        self.shared.write(message)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(shared: &ConnectorShared, mut stream: TcpStream) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];

    'connection: while !shared.stopping.load(Ordering::SeqCst) {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                shared.logger.log(
                    LogLevel::Info,
                    Some("connector::read"),
                    "Peer closed connection",
                    Some(json!({
                        "connection_id": shared.id,
                        "peer_addr": shared.peer_addr.to_string(),
                        "buffered_bytes": frames.len(),
                    })),
                );
                break;
            }
            Ok(read) => read,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(source) => {
                shared.report(&ConnectorError::Read { source });
                break;
            }
        };
        frames.extend(&chunk[..read]);

        loop {
            let decoded = match frames.next_message(&shared.codec) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(error) => {
                    shared.report(&ConnectorError::Codec(error));
                    break 'connection;
                }
            };
            for error in decoded.field_errors {
                shared.report(&ConnectorError::Field(error));
            }

            let reply = shared.handler.dispatch(&decoded.message);
            let written = match shared.write(&reply) {
                // Every request gets an answer, even when its reply cannot be framed.
                Err(ConnectorError::Encode(error)) => {
                    shared.logger.log(
                        LogLevel::Error,
                        Some("connector::write"),
                        "Reply cannot be encoded, answering with internal error",
                        Some(json!({
                            "connection_id": shared.id,
                            "request": command_name(decoded.message.code),
                            "request_id": decoded.message.id,
                            "error": error.to_string(),
                        })),
                    );
                    shared.write(
                        &Message::new(CMD_REQUEST_COMPLETED, decoded.message.id)
                            .with(VID_RCC, RCC_INTERNAL_ERROR),
                    )
                }
                other => other,
            };
            if let Err(error) = written {
                shared.logger.log(
                    LogLevel::Warn,
                    Some("connector::write"),
                    "Reply could not be delivered",
                    Some(json!({
                        "connection_id": shared.id,
                        "request": command_name(decoded.message.code),
                        "request_id": decoded.message.id,
                    })),
                );
                shared.report(&error);
                break 'connection;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
}

/// Live connections of the process. Broadcasts go to every open connector;
/// closed ones are reaped on the way.
pub struct ConnectorRegistry {
    codec: WireCodec,
    timeouts: SocketTimeouts,
    logger: Arc<Logger>,
    next_id: AtomicU64,
    connectors: Mutex<HashMap<u64, Arc<Connector>>>,
}

impl ConnectorRegistry {
    pub fn new(codec: WireCodec, timeouts: SocketTimeouts, logger: Arc<Logger>) -> Self {
        Self {
            codec,
            timeouts,
            logger,
            next_id: AtomicU64::new(1),
            connectors: Mutex::new(HashMap::new()),
        }
    }

    /// Registers and starts a connector for an accepted socket.
    pub fn open(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Arc<Connector>, ConnectorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connector = Arc::new(Connector::new(
            id,
            stream,
            peer_addr,
            self.codec,
            self.timeouts,
            handler,
            Arc::clone(&self.logger),
        )?);
        connector.start()?;
        lock(&self.connectors).insert(id, Arc::clone(&connector));

        self.logger.log(
            LogLevel::Info,
            Some("connector::registry"),
            "Accepted client connection",
            Some(json!({
                "connection_id": id,
                "peer_addr": peer_addr.to_string(),
            })),
        );
        Ok(connector)
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.connectors).len()
    }

    /// Stops and forgets connectors whose read loop has ended.
    pub fn reap(&self) -> usize {
        let closed: Vec<Arc<Connector>> = {
            let mut connectors = lock(&self.connectors);
            let ids: Vec<u64> = connectors
                .iter()
                .filter(|(_, connector)| connector.is_closed())
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| connectors.remove(id))
                .collect()
        };

        for connector in &closed {
            connector.stop();
        }
        closed.len()
    }

    pub fn shutdown(&self) {
        let connectors: Vec<Arc<Connector>> =
            lock(&self.connectors).drain().map(|(_, connector)| connector).collect();
        let count = connectors.len();
        for connector in connectors {
            connector.stop();
        }
        self.logger.log(
            LogLevel::Info,
            Some("connector::registry"),
            "All client connections stopped",
            Some(json!({ "connections": count })),
        );
    }
}

impl Broadcaster for ConnectorRegistry {
    fn send_broadcast(&self, message: &Message) {
        let connectors: Vec<Arc<Connector>> = lock(&self.connectors)
            .values()
            .filter(|connector| !connector.is_closed())
            .cloned()
            .collect();

        for connector in connectors {
            if let Err(error) = connector.send_broadcast(message) {
                self.logger.log(
                    LogLevel::Warn,
                    Some("connector::broadcast"),
                    "Broadcast delivery failed",
                    Some(json!({
                        "connection_id": connector.id(),
                        "command": command_name(message.code),
                        "error": error.to_string(),
                    })),
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

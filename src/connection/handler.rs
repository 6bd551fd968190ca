//! Connection Handler
//!
//! Each client gets its own task that reads frames, executes them and writes
//! the replies back, one reply per request and in request order.
//!
//! TCP is a stream protocol: a read may hold half a frame, or several
//! pipelined frames. Incoming bytes accumulate in a `BytesMut` and complete
//! frames are split off the front until only a partial frame (or nothing)
//! remains. Replies produced for one read are flushed together.
//!
//! A frame that fails to decode ends the connection after an error reply.
//! Other clients are unaffected.

use crate::commands::CommandHandler;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, trace, warn};

/// Most unparsed bytes buffered for one client: the largest bulk payload
/// plus room for the array and length headers around it
pub const MAX_PENDING_BYTES: usize = MAX_BULK_SIZE + 64 * 1024;

/// Spare capacity kept free before each read
const READ_RESERVE: usize = 4 * 1024;

/// Server-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: AtomicU64,
    active: AtomicU64,
    commands: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub commands: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Relaxed),
            active: self.active.load(Relaxed),
            commands: self.commands.load(Relaxed),
            bytes_in: self.bytes_in.load(Relaxed),
            bytes_out: self.bytes_out.load(Relaxed),
        }
    }

    fn opened(&self) {
        self.accepted.fetch_add(1, Relaxed);
        self.active.fetch_add(1, Relaxed);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Relaxed);
    }
}

/// Why a connection ended.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Parse(#[from] ParseError),

    /// Socket closed between frames
    #[error("client closed the connection")]
    ClientDisconnected,

    /// Socket closed part way through a frame
    #[error("client closed the connection mid-frame")]
    UnexpectedEof,

    #[error("read buffer full without a complete frame")]
    BufferFull,
}

impl ConnectionError {
    /// Whether this is an ordinary way for a client to leave.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected => true,
            ConnectionError::Io(e) => e.kind() == std::io::ErrorKind::ConnectionReset,
            _ => false,
        }
    }
}

/// One client session.
///
/// Generic over the stream so the loop can run against anything that reads
/// and writes bytes, not only a `TcpStream`.
pub struct ConnectionHandler<S> {
    io: BufWriter<S>,
    peer: SocketAddr,
    pending: BytesMut,
    max_pending: usize,
    parser: RespParser,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.opened();
        Self {
            io: BufWriter::new(stream),
            peer,
            pending: BytesMut::with_capacity(READ_RESERVE),
            max_pending: MAX_PENDING_BYTES,
            parser: RespParser::new(),
            commands,
            stats,
        }
    }

    /// Caps how many unparsed bytes may be buffered.
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.max_pending = limit;
        self
    }

    /// Serves the client until it leaves or an error ends the session.
    ///
    /// A clean close between frames is `Ok(())`.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let outcome = match self.serve().await {
            Err(ConnectionError::ClientDisconnected) => Ok(()),
            other => other,
        };

        match &outcome {
            Ok(()) => debug!(client = %self.peer, frames = self.parser.frames(), "Client left"),
            Err(e) if e.is_disconnect() => debug!(client = %self.peer, error = %e, "Client gone"),
            Err(e) => warn!(client = %self.peer, error = %e, "Closing connection"),
        }

        self.stats.closed();
        outcome
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.drain_frames().await?;
            self.io.flush().await?;
            self.fill().await?;
        }
    }

    /// Executes every complete frame in the buffer, queueing the replies.
    async fn drain_frames(&mut self) -> Result<(), ConnectionError> {
        while !self.pending.is_empty() {
            let (request, used) = match self.parser.parse(&self.pending) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    trace!(client = %self.peer, buffered = self.pending.len(), "Partial frame");
                    return Ok(());
                }
                Err(e) => {
                    let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                    self.queue(&reply).await?;
                    self.io.flush().await?;
                    return Err(e.into());
                }
            };
            let _ = self.pending.split_to(used);

            let reply = if self.commands.fsyncs(&request) && on_worker_pool() {
                // the fsync blocks this thread until the disk answers
                tokio::task::block_in_place(|| self.commands.execute(request))
            } else {
                self.commands.execute(request)
            };
            self.stats.commands.fetch_add(1, Relaxed);
            self.queue(&reply).await?;
        }
        Ok(())
    }

    /// Reads at least one more byte into the buffer.
    async fn fill(&mut self) -> Result<(), ConnectionError> {
        if self.pending.len() >= self.max_pending {
            error!(
                client = %self.peer,
                size = self.pending.len(),
                limit = self.max_pending,
                "Buffer size limit exceeded"
            );
            let reply = RespValue::error(format!(
                "ERR Protocol error: request exceeds {} bytes",
                self.max_pending
            ));
            self.queue(&reply).await?;
            self.io.flush().await?;
            return Err(ConnectionError::BufferFull);
        }
        self.pending.reserve(READ_RESERVE);

        match self.io.get_mut().read_buf(&mut self.pending).await? {
            0 if self.pending.is_empty() => Err(ConnectionError::ClientDisconnected),
            0 => Err(ConnectionError::UnexpectedEof),
            n => {
                self.stats.bytes_in.fetch_add(n as u64, Relaxed);
                trace!(client = %self.peer, bytes = n, "Read");
                Ok(())
            }
        }
    }

    async fn queue(&mut self, reply: &RespValue) -> Result<(), ConnectionError> {
        let encoded = reply.serialize();
        self.io.write_all(&encoded).await?;
        self.stats.bytes_out.fetch_add(encoded.len() as u64, Relaxed);
        Ok(())
    }
}

/// Whether the current task runs on a multi-threaded runtime, where
/// `block_in_place` is allowed.
fn on_worker_pool() -> bool {
    Handle::try_current().is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
}

/// Serves one accepted TCP client to completion.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    info!(client = %peer, "Accepted connection");
    // run() has already logged how the session ended
    let _ = ConnectionHandler::new(stream, peer, commands, stats).run().await;
}

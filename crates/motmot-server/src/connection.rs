use motmot::codec::{CodecError, MessageCodec, READ_CHUNK};
use motmot::protocol::Message;
use rmpv::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Any byte stream a connection can run over: plain TCP, TLS, or an
/// in-memory duplex in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }
}

struct Shared {
    state: AtomicU8,
    shutdown: CancellationToken,
}

/// Cloneable handle to a live connection. The only way to produce output on it.
#[derive(Clone)]
pub struct ConnectionHandle {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Enqueue a message for the write loop. Never blocks; returns false if
    /// the connection is already gone.
    pub fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    /// Begin teardown: both loops stop at their next suspension point.
    pub fn close(&self) {
        self.transition(ConnectionState::Closing);
        self.shared.shutdown.cancel();
    }

    pub(crate) fn mark_closed(&self) {
        self.shared
            .state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        self.shared.shutdown.cancel();
    }

    fn transition(&self, to: ConnectionState) {
        // Only ever move forward: Open -> Closing -> Closed.
        self.shared.state.fetch_max(to.as_u8(), Ordering::AcqRel);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// One socket with its read and write loops running.
///
/// Decoded values (or a fatal codec error) arrive through
/// [`receive`](Self::receive); the receive side ends once the peer closes.
pub struct Connection {
    handle: ConnectionHandle,
    inbound: mpsc::UnboundedReceiver<Result<Value, CodecError>>,
}

impl Connection {
    pub fn open<T: Transport>(stream: T, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let handle = ConnectionHandle {
            addr,
            outbound: out_tx,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Open.as_u8()),
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(read_loop(reader, in_tx, handle.clone()));
        tokio::spawn(write_loop(writer, out_rx, handle.clone()));

        tracing::debug!(peer = %addr, "connection opened");
        Self {
            handle,
            inbound: in_rx,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    /// Wait for the next decoded value. `None` once the read side is done.
    pub async fn receive(&mut self) -> Option<Result<Value, CodecError>> {
        self.inbound.recv().await
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    inbound: mpsc::UnboundedSender<Result<Value, CodecError>>,
    handle: ConnectionHandle,
) {
    let mut codec = MessageCodec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let token = handle.shared.shutdown.clone();

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::debug!(peer = %handle.addr, "peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %handle.addr, err = %e, "read failed");
                    break;
                }
            },
        };

        codec.feed(&chunk[..n]);
        match codec.drain() {
            Ok(values) => {
                for value in values {
                    if inbound.send(Ok(value)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = inbound.send(Err(e));
                break;
            }
        }
    }

    handle.transition(ConnectionState::Closing);
    // Dropping `inbound` ends the dispatcher's receive loop.
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    handle: ConnectionHandle,
) {
    let token = handle.shared.shutdown.clone();

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let bytes = match MessageCodec::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(peer = %handle.addr, err = %e, "dropping unencodable message");
                continue;
            }
        };

        let written = tokio::select! {
            _ = token.cancelled() => break,
            res = writer.write_all(&bytes) => res,
        };
        if let Err(e) = written {
            tracing::debug!(peer = %handle.addr, err = %e, "write failed");
            handle.close();
            break;
        }
    }

    // Flush whatever is still queued so replies raced against a close are not lost.
    let flush = async {
        while let Ok(msg) = outbound.try_recv() {
            let Ok(bytes) = MessageCodec::encode(&msg) else {
                continue;
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, flush).await;
    tracing::debug!(peer = %handle.addr, "write loop finished");
}

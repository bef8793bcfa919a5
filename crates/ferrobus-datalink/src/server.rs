//! Modbus TCP listener and per-connection sessions.
//!
//! Each accepted connection runs two cooperating pieces of work: a socket
//! read pump copying bytes into the session's [`ByteRing`], and a frame
//! pump pulling MBAP-framed requests back out, handing them to the
//! [`RequestHandler`] and writing responses. The split keeps socket reads
//! flowing while a request is being handled, and gives the frame parser a
//! place to wait for exactly as many bytes as the header declared.

use crate::ring::ByteRing;
use crate::TransportError;
use ferrobus_core::encoding::Writer;
use ferrobus_core::frame::tcp::{MbapPrefix, MAX_FRAME_BODY, MBAP_PREFIX_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

const INITIAL_RING_CAPACITY: usize = 512;
const READ_CHUNK_LEN: usize = 1024;

/// What the server should do with the handler's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Write the first `n` bytes of the response buffer back, framed with
    /// the request's transaction id.
    Reply(usize),
    /// Send nothing and wait for the next request.
    NoReply,
    /// Drop the connection.
    Close,
}

/// Server-side business logic, called once per parsed request frame.
///
/// `body` is the frame body as received: unit id at index 0, function code
/// at index 1. A reply is written into `response` in the same shape.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, body: &[u8], response: &mut [u8]) -> HandlerVerdict;
}

impl<T> RequestHandler for Arc<T>
where
    T: RequestHandler + ?Sized,
{
    fn handle(&self, body: &[u8], response: &mut [u8]) -> HandlerVerdict {
        (**self).handle(body, response)
    }
}

/// A bound but not yet running Modbus TCP server.
pub struct TcpServer<H> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H: RequestHandler> TcpServer<H> {
    /// Bind to `addr`. Binding `[::]`-style endpoints serves v4 and v6
    /// clients on hosts with dual-stack sockets enabled.
    pub async fn bind<A: ToSocketAddrs>(addr: A, handler: H) -> Result<Self, TransportError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Launch the accept loop and hand back the control handle.
    pub fn start(self) -> ServerHandle {
        let local_addr = self.listener.local_addr().ok();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));

        let accept_sessions = Arc::clone(&sessions);
        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            self.handler,
            accept_sessions,
            shutdown_rx,
        ));

        ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
            sessions,
        }
    }
}

/// Control handle of a running server.
pub struct ServerHandle {
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sessions: Arc<Mutex<JoinSet<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, signal every session, and wait up to `grace` for
    /// them to drain; whatever is still running is then aborted.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;

        let mut sessions = self.sessions.lock().await;
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("session drain timed out; closing sockets");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }
}

async fn accept_loop<H: RequestHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    sessions: Arc<Mutex<JoinSet<()>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted modbus tcp client");
                    let handler = Arc::clone(&handler);
                    let session_shutdown = shutdown.clone();
                    sessions.lock().await.spawn(async move {
                        if let Err(err) = run_session(socket, handler, session_shutdown).await {
                            warn!(%peer, error = %err, "modbus session ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
}

/// Wait until the watch flag turns true (or its sender goes away).
async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum Pumped {
    Data,
    Stop,
}

/// Pull exactly `dst` bytes from the ring, giving up when the socket hits
/// EOF or shutdown is signalled. Biased towards data so frames already
/// buffered are still served after the socket closes.
async fn dequeue_or_stop(
    ring: &ByteRing,
    dst: &mut [u8],
    eof: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Pumped {
    tokio::select! {
        biased;
        _ = ring.dequeue_exact(dst) => Pumped::Data,
        _ = wait_flag(eof) => Pumped::Stop,
        _ = wait_flag(shutdown) => Pumped::Stop,
    }
}

async fn run_session<H: RequestHandler>(
    socket: TcpStream,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let (mut read_half, mut write_half) = socket.into_split();
    let ring = Arc::new(ByteRing::new(INITIAL_RING_CAPACITY));
    let (eof_tx, mut eof_rx) = watch::channel(false);

    let pump_ring = Arc::clone(&ring);
    let mut pump_shutdown = shutdown.clone();
    let read_pump = tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK_LEN];
        loop {
            tokio::select! {
                _ = wait_flag(&mut pump_shutdown) => break,
                read = read_half.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => pump_ring.enqueue(&chunk[..n]),
                    Err(err) => {
                        match err.kind() {
                            std::io::ErrorKind::ConnectionAborted => {
                                warn!(error = %err, "session socket aborted by peer");
                            }
                            std::io::ErrorKind::ConnectionReset => {
                                warn!(error = %err, "session socket reset by peer");
                            }
                            _ => debug!(error = %err, "session socket closed"),
                        }
                        break;
                    }
                }
            }
        }
        let _ = eof_tx.send(true);
    });

    let result = frame_pump(&ring, handler.as_ref(), &mut write_half, &mut eof_rx, &mut shutdown).await;

    read_pump.abort();
    let _ = read_pump.await;
    result
}

async fn frame_pump<H: RequestHandler>(
    ring: &ByteRing,
    handler: &H,
    write_half: &mut OwnedWriteHalf,
    eof: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut response = [0u8; MAX_FRAME_BODY];
    loop {
        let mut prefix_bytes = [0u8; MBAP_PREFIX_LEN];
        if let Pumped::Stop = dequeue_or_stop(ring, &mut prefix_bytes, eof, shutdown).await {
            return Ok(());
        }
        // Rejecting a bad length terminates the session; there is no way
        // to resynchronize a TCP byte stream with a corrupt header.
        let prefix = MbapPrefix::from_bytes(&prefix_bytes)?;

        let mut body = vec![0u8; usize::from(prefix.length)];
        if let Pumped::Stop = dequeue_or_stop(ring, &mut body, eof, shutdown).await {
            return Ok(());
        }

        debug!(
            transaction_id = prefix.transaction_id,
            unit_id = body[0],
            body_len = body.len(),
            "received modbus request frame"
        );

        match handler.handle(&body, &mut response) {
            HandlerVerdict::NoReply => {}
            HandlerVerdict::Close => return Ok(()),
            HandlerVerdict::Reply(len) => {
                if len == 0 || len > MAX_FRAME_BODY {
                    return Err(TransportError::InvalidFrame(
                        "handler response length out of range",
                    ));
                }
                let mut frame = [0u8; MBAP_PREFIX_LEN + MAX_FRAME_BODY];
                let mut w = Writer::new(&mut frame);
                MbapPrefix {
                    transaction_id: prefix.transaction_id,
                    length: len as u16,
                }
                .encode(&mut w)?;
                w.write_all(&response[..len])?;

                debug!(
                    transaction_id = prefix.transaction_id,
                    body_len = len,
                    "sending modbus response frame"
                );
                write_half.write_all(w.as_written()).await?;
            }
        }
    }
}

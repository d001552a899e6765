//! TCP server that logs every line its clients send.
//!
//! The accept loop hands each connection to its own task and goes straight
//! back to accepting. Handlers share nothing, so one slow or broken client
//! cannot hold up the others.

use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept, so running out of descriptors does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One event on one server-side connection.
#[derive(Debug)]
pub enum Observation {
    /// A complete line, whitespace-trimmed.
    Line(String),
    /// The peer closed the stream.
    Disconnected,
    /// Reading failed with something other than EOF.
    ReadError(io::Error),
}

/// Where a connection handler reports what it sees.
pub trait Observer {
    fn observe(&mut self, peer: SocketAddr, observation: Observation);
}

/// Writes observations to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&mut self, peer: SocketAddr, observation: Observation) {
        match observation {
            Observation::Line(line) => info!(peer = %peer, "Received from {peer}: {line}"),
            Observation::Disconnected => info!(peer = %peer, "Client {peer} disconnected."),
            Observation::ReadError(e) => {
                error!(peer = %peer, error = %e, "Error reading from client {peer}: {e}")
            }
        }
    }
}

/// Source of accepted connections.
pub trait Acceptor {
    type Stream: AsyncRead + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind the listening socket. Failure here is fatal for the caller.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("could not resolve listen address {addr}"),
            )
        })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %addr, "Server listening on {addr}");

        Ok(Server { listener })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, logging what each client sends.
    pub async fn run(self) {
        self.run_with_observer(LogObserver).await
    }

    /// Accept connections forever, one task per connection. Each task gets
    /// its own clone of `observer`.
    pub async fn run_with_observer<O>(self, observer: O)
    where
        O: Observer + Clone + Send + 'static,
    {
        accept_loop(self.listener, observer).await
    }
}

async fn accept_loop<A, O>(mut acceptor: A, observer: O)
where
    A: Acceptor,
    O: Observer + Clone + Send + 'static,
{
    loop {
        match acceptor.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "Client connected: {peer}");

                let mut observer = observer.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, &mut observer).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Create a listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Read newline-delimited lines from one connection until EOF or error.
///
/// Every complete line produces one `Line` observation, in arrival order,
/// and the stream end produces exactly one `Disconnected` or `ReadError`.
/// Bytes after the last newline are dropped at EOF. The stream is consumed
/// and closed when this returns.
pub async fn handle_connection<S, O>(mut stream: S, peer: SocketAddr, observer: &mut O)
where
    S: AsyncRead + Unpin,
    O: Observer,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    // Bytes at the front of `buffer` already known to hold no newline.
    let mut scanned = 0;

    loop {
        while let Some(pos) = find_newline(&buffer, scanned) {
            let line = String::from_utf8_lossy(&buffer[..pos]).trim().to_string();
            buffer.advance(pos + 1);
            scanned = 0;
            observer.observe(peer, Observation::Line(line));
        }
        scanned = buffer.len();

        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                if !buffer.is_empty() {
                    trace!(peer = %peer, bytes = buffer.len(), "Dropping unterminated fragment");
                }
                observer.observe(peer, Observation::Disconnected);
                break;
            }
            Ok(n) => debug!(peer = %peer, bytes = n, "Read"),
            Err(e) => {
                observer.observe(peer, Observation::ReadError(e));
                break;
            }
        }
    }
}

/// Position of the first newline at or after `from`.
fn find_newline(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| from + pos)
}

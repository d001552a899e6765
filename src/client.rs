//! Periodic line sender with bounded retry and reconnect.
//!
//! The client dials the server until it gets through, then writes one
//! message per timer tick. A failed write closes the connection, dials a
//! new one and tries again, up to `max_attempts` writes per tick. Running
//! out of attempts is fatal.
//!
//! ```text
//!  Disconnected ──Connected──▶ Connected ──Tick──▶ Sending{1}
//!                                  ▲                  │
//!                                  └──WriteSucceeded──┤
//!                                                     │ WriteFailed (a < max)
//!              Sending{a+1} ◀──Reconnect*── Reconnecting{a}
//!
//!  Sending{max} ──WriteFailed──▶ Disconnected (fatal)
//! ```

use crate::config::ClientConfig;
use crate::message::Message;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Writes allowed per tick before giving up.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Dial timeout, for the first connect and for reconnects.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed reconnect inside a tick.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause between failed initial connects.
pub const INITIAL_CONNECT_DELAY: Duration = Duration::from_secs(5);

/// Retry knobs. `Default` gives the production values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub initial_connect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SEND_ATTEMPTS,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_backoff: RECONNECT_BACKOFF,
            initial_connect_delay: INITIAL_CONNECT_DELAY,
        }
    }
}

/// Opens new connections to the server.
pub trait Connector {
    type Stream: AsyncWrite + Unpin + Send;

    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Address being dialed, for log lines.
    fn target(&self) -> &str;
}

/// Dials a TCP address with a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        match timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", self.addr, self.timeout),
            )),
        }
    }

    fn target(&self) -> &str {
        &self.addr
    }
}

/// Sender state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// No usable connection. Initial state, and terminal after a fatal tick.
    Disconnected,
    /// Idle between ticks.
    Connected,
    /// About to write attempt `attempt` of the current tick.
    Sending { attempt: u32 },
    /// Attempt `attempt` failed; dialing a replacement connection.
    Reconnecting { attempt: u32 },
}

/// Inputs that move the sender between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    Connected,
    Tick,
    WriteSucceeded,
    WriteFailed,
    ReconnectSucceeded,
    ReconnectFailed,
}

impl SenderState {
    /// Transition table. Pairs not listed leave the state unchanged.
    pub fn on(self, event: SenderEvent, max_attempts: u32) -> SenderState {
        use SenderEvent as E;
        use SenderState as S;

        match (self, event) {
            (S::Disconnected, E::Connected) => S::Connected,
            (S::Connected, E::Tick) => S::Sending { attempt: 1 },
            (S::Sending { .. }, E::WriteSucceeded) => S::Connected,
            (S::Sending { attempt }, E::WriteFailed) if attempt >= max_attempts => {
                S::Disconnected
            }
            (S::Sending { attempt }, E::WriteFailed) => S::Reconnecting { attempt },
            (S::Reconnecting { attempt }, E::ReconnectSucceeded | E::ReconnectFailed) => {
                S::Sending {
                    attempt: attempt + 1,
                }
            }
            (state, _) => state,
        }
    }
}

/// Outcome of a tick that got its message out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub sequence: u64,
    /// Writes it took, 1 when the first one worked.
    pub attempts: u32,
}

/// Send path errors
#[derive(Debug)]
pub enum SendError {
    /// Every attempt of one tick failed.
    Exhausted {
        sequence: u64,
        attempts: u32,
        source: io::Error,
    },
    /// The sender already failed fatally and holds no connection.
    Stopped,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Exhausted {
                sequence,
                attempts,
                source,
            } => write!(
                f,
                "Failed to send message #{sequence} after {attempts} attempts: {source}"
            ),
            SendError::Stopped => write!(f, "sender stopped after a fatal send failure"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Exhausted { source, .. } => Some(source),
            SendError::Stopped => None,
        }
    }
}

/// Owns the client connection and the message sequence.
pub struct Sender<C: Connector> {
    connector: C,
    conn: Option<C::Stream>,
    state: SenderState,
    sequence: u64,
    policy: RetryPolicy,
}

impl<C: Connector> Sender<C> {
    /// Start from an already established connection.
    pub fn new(connector: C, stream: C::Stream, policy: RetryPolicy) -> Self {
        let mut sender = Sender {
            connector,
            conn: Some(stream),
            state: SenderState::Disconnected,
            sequence: 0,
            policy,
        };
        sender.transition(SenderEvent::Connected);
        sender
    }

    #[cfg(test)]
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Sequence number of the most recent tick, 0 before the first.
    #[cfg(test)]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Send one message every `period` until a tick fails fatally.
    ///
    /// The first tick fires one period after start. A tick that falls due
    /// while the previous one is still retrying is delivered once, as soon
    /// as that tick finishes; any further missed ticks are dropped.
    pub async fn run(mut self, period: Duration) -> Result<(), SendError> {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    /// Deliver the next message, retrying within the attempt budget.
    pub async fn tick(&mut self) -> Result<TickReport, SendError> {
        if self.state != SenderState::Connected {
            return Err(SendError::Stopped);
        }

        self.sequence += 1;
        let sequence = self.sequence;
        self.transition(SenderEvent::Tick);

        loop {
            match self.state {
                SenderState::Sending { attempt } => {
                    let message = Message::now(sequence, attempt);
                    match self.write(&message).await {
                        Ok(()) => {
                            info!(
                                sequence = message.sequence(),
                                attempt = message.attempt(),
                                "Sent to {}: {}",
                                self.connector.target(),
                                message
                            );
                            self.transition(SenderEvent::WriteSucceeded);
                            return Ok(TickReport {
                                sequence,
                                attempts: attempt,
                            });
                        }
                        Err(e) => {
                            warn!(
                                sequence,
                                attempt,
                                error = %e,
                                "Failed to send message #{sequence} (attempt {attempt}): {e}"
                            );
                            self.transition(SenderEvent::WriteFailed);

                            if self.state == SenderState::Disconnected {
                                self.close().await;
                                error!(
                                    sequence,
                                    attempts = attempt,
                                    "Failed to send message #{sequence} after {attempt} attempts. Exiting."
                                );
                                return Err(SendError::Exhausted {
                                    sequence,
                                    attempts: attempt,
                                    source: e,
                                });
                            }
                        }
                    }
                }
                SenderState::Reconnecting { attempt } => {
                    info!("Attempting to reconnect...");
                    self.close().await;

                    match self.connector.connect().await {
                        Ok(stream) => {
                            self.conn = Some(stream);
                            info!("Reconnected to server. Retrying send.");
                            self.transition(SenderEvent::ReconnectSucceeded);
                        }
                        Err(e) => {
                            warn!(
                                sequence,
                                attempt,
                                error = %e,
                                "Failed to reconnect on attempt {attempt} for message #{sequence}: {e}."
                            );
                            sleep(self.policy.reconnect_backoff).await;
                            self.transition(SenderEvent::ReconnectFailed);
                        }
                    }
                }
                SenderState::Connected | SenderState::Disconnected => {
                    return Err(SendError::Stopped);
                }
            }
        }
    }

    fn transition(&mut self, event: SenderEvent) {
        let next = self.state.on(event, self.policy.max_attempts);
        trace!(from = ?self.state, ?event, to = ?next, "Sender transition");
        self.state = next;
    }

    async fn write(&mut self, message: &Message) -> io::Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no live connection"))?;
        conn.write_all(message.as_bytes()).await?;
        conn.flush().await
    }

    /// Drop the current connection, if any.
    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                debug!(error = %e, "Shutdown of failed connection errored");
            }
        }
    }
}

/// Dial until a connection succeeds. Never gives up.
pub async fn connect_with_retry<C: Connector>(connector: &mut C, delay: Duration) -> C::Stream {
    loop {
        match connector.connect().await {
            Ok(stream) => {
                info!(server = %connector.target(), "Connected to server: {}", connector.target());
                return stream;
            }
            Err(e) => {
                warn!(
                    server = %connector.target(),
                    error = %e,
                    "Failed to connect to server {}: {e}. Retrying in {delay:?}...",
                    connector.target()
                );
                sleep(delay).await;
            }
        }
    }
}

/// Client entry point: connect, then send forever.
pub async fn run(config: ClientConfig) -> Result<(), SendError> {
    info!(
        server = %config.server_addr,
        period = ?config.send_period,
        "Client configured to send to {} every {:?}",
        config.server_addr,
        config.send_period
    );

    let policy = RetryPolicy::default();
    let mut connector = TcpConnector::new(config.server_addr, policy.connect_timeout);
    let stream = connect_with_retry(&mut connector, policy.initial_connect_delay).await;

    Sender::new(connector, stream, policy)
        .run(config.send_period)
        .await
}

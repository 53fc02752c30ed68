//! The transport adapter contract. This is explicitly an external collaborator
//! of the session-lifecycle core: the pool and connection state machine only ever depend on the
//! [`Transport`] trait, never on `TcpStream` directly. [`TcpTransport`] is a reference
//! implementation good enough to run against a real server; tests substitute an in-memory mock
//! that implements the same trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    runtime,
};

/// The cap on reconnect backoff: keep retrying forever, but never wait longer than this between
/// attempts.
pub(crate) const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(1);

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Events a transport emits for its owning Connection to observe, independent of any in-flight
/// frame exchange.
#[derive(Clone, Debug)]
pub(crate) enum TransportEvent {
    Connect,
    Close,
    Error(String),
    Reconnecting { delay: Duration, attempt: u32 },
}

/// A single framed, reliable byte stream to a `(host, port)` endpoint.
///
/// Implementations must support unbounded reconnect attempts with delay capped at
/// [`MAX_RECONNECT_DELAY`], because the pool relies on the transport to continuously retry rather
/// than escalating failures to the pool itself.
#[async_trait]
pub(crate) trait Transport: Send {
    /// Establishes the connection, retrying internally (with capped backoff) until it succeeds
    /// or the transport is told to end.
    async fn connect(&mut self) -> Result<()>;

    /// Sends one length-framed payload.
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()>;

    /// Receives one length-framed payload.
    async fn recv_frame(&mut self) -> Result<Vec<u8>>;

    /// Returns a receiver for transport lifecycle events. Each call drains whatever has not yet
    /// been observed; Connections poll this concurrently with frame I/O via `select!`.
    fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransportEvent>;

    /// Terminates the transport. Idempotent; never blocks on in-flight I/O.
    fn end(&mut self);
}

/// Reference transport implementation over `tokio::net::TcpStream`, using a simple
/// length-prefixed framing (a 4-byte big-endian length followed by the payload), in the hand
/// rolled style of a wire-protocol header rather than a general-purpose codec crate.
pub(crate) struct TcpTransport {
    address: ServerAddress,
    stream: Option<TcpStream>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ended: bool,
}

impl TcpTransport {
    pub(crate) fn new(address: ServerAddress) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            address,
            stream: None,
            events_tx,
            events_rx,
            ended: false,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut attempt = 0u32;

        loop {
            if self.ended {
                return Err(Error::transport("transport ended before connect succeeded"));
            }

            match TcpStream::connect((self.address.host.as_str(), self.address.port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.stream = Some(stream);
                    let _ = self.events_tx.send(TransportEvent::Connect);
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    let _ = self.events_tx.send(TransportEvent::Reconnecting {
                        delay,
                        attempt,
                    });
                    let _ = self
                        .events_tx
                        .send(TransportEvent::Error(err.to_string()));
                    runtime::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::transport("not connected"))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::transport("frame too large"))?;
        if let Err(err) = stream.write_all(&len.to_be_bytes()).await {
            self.fail(&err);
            return Err(err.into());
        }
        if let Err(err) = stream.write_all(payload).await {
            self.fail(&err);
            return Err(err.into());
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::transport("not connected"))?;
        let mut len_buf = [0u8; 4];
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            self.fail(&err);
            return Err(err.into());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if let Err(err) = stream.read_exact(&mut payload).await {
            self.fail(&err);
            return Err(err.into());
        }
        Ok(payload)
    }

    fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransportEvent> {
        &mut self.events_rx
    }

    fn end(&mut self) {
        self.ended = true;
        self.stream = None;
        let _ = self.events_tx.send(TransportEvent::Close);
    }
}

impl TcpTransport {
    fn fail(&mut self, err: &std::io::Error) {
        self.stream = None;
        let _ = self.events_tx.send(TransportEvent::Error(err.to_string()));
        let _ = self.events_tx.send(TransportEvent::Close);
    }
}

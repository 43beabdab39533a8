use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::config::TimeoutConfig;
use super::error::WsError;
use crate::Result;
use crate::error::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// Bound on queued-but-unsent outbound payloads. [`Session::write`] fails
/// fast with a queue-overflow error once the writer falls this far behind.
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// Callbacks a [`Session`] reports into.
///
/// All of them run on the session's I/O task and must not block; slow
/// handlers stall frame processing for the whole session.
pub(crate) struct SessionHandlers {
    /// Invoked synchronously for every inbound text or binary payload
    pub on_message: Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>,
    /// Invoked exactly once when the session dies. `None` means the close
    /// was requested locally.
    pub on_disconnect: Box<dyn Fn(Option<Error>) + Send + Sync>,
    /// Out-of-band errors that do not terminate the session
    pub on_error: Box<dyn Fn(Error) + Send + Sync>,
}

/// One live WebSocket frame channel and the tasks that service it.
///
/// A session is created by the [`Client`](super::Client) after a successful
/// handshake and discarded after its disconnect notification. It never
/// recovers on its own; reconnection is the client's job.
pub struct Session {
    id: String,
    tls: bool,
    subprotocol: Option<String>,
    write_wait: Duration,
    out_tx: mpsc::Sender<Vec<u8>>,
    close_tx: mpsc::Sender<CloseFrame>,
    /// Transitions false to true exactly once, either through `close` or
    /// when the I/O task exits on an error
    closed: AtomicBool,
    /// Set only by `close`; lets the I/O task tell a local close apart from
    /// a transport failure, and cuts the outbound queue off from the writer
    close_requested: AtomicBool,
    /// Flipped to true by the I/O task once it has shut down and delivered
    /// the disconnect notification
    terminated: watch::Sender<bool>,
}

impl Session {
    /// Takes ownership of a freshly upgraded stream and spawns the I/O task
    /// and, unless disabled, the pinger.
    pub(crate) fn spawn(
        id: String,
        stream: WsStream,
        subprotocol: Option<String>,
        config: TimeoutConfig,
        handlers: SessionHandlers,
    ) -> Arc<Self> {
        let tls = !matches!(stream.get_ref(), MaybeTlsStream::Plain(_));
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(1);

        let (terminated, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            tls,
            subprotocol,
            write_wait: config.write_wait,
            out_tx,
            close_tx,
            closed: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            terminated,
        });

        let (ping_tx, ping_rx) = mpsc::channel(1);
        let pinger = (!config.ping_period.is_zero()).then(|| {
            tokio::spawn(async move {
                let mut tick = interval(config.ping_period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick of an interval completes immediately.
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if ping_tx.send(()).await.is_err() {
                        break;
                    }
                }
            })
        });

        let io = Arc::clone(&session);
        tokio::spawn(async move {
            io.run(stream, out_rx, close_rx, ping_rx, config, handlers, pinger)
                .await;
        });

        session
    }

    /// The device id, taken from the final path segment of the URL the
    /// session was dialed with.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Whether the underlying stream negotiated TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// The subprotocol selected by the server during the handshake.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Enqueues a payload for the writer without blocking.
    ///
    /// # Errors
    ///
    /// `NotConnected` once the session is closed, `QueueOverflow` when the
    /// bounded outbound queue is full.
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WsError::NotConnected.into());
        }
        self.out_tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => Error::from(WsError::QueueOverflow),
            TrySendError::Closed(_) => Error::from(WsError::NotConnected),
        })
    }

    /// Graceful shutdown: queued but unsent payloads are discarded, a close
    /// frame goes out within the write deadline, then the stream is dropped.
    ///
    /// Blocks until the I/O task has shut down and delivered its disconnect
    /// notification, but never longer than the write deadline. Idempotent;
    /// a second call returns immediately.
    pub(crate) async fn close(&self, code: CloseCode, reason: &str) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        // The I/O task may already be gone; its exit path reported the
        // disconnect in that case.
        drop(self.close_tx.try_send(frame));

        // Bound the graceful-close window. A zero write deadline means no
        // bound, as everywhere else.
        let mut done = self.terminated.subscribe();
        let shutdown = done.wait_for(|terminated| *terminated);
        if self.write_wait.is_zero() {
            drop(shutdown.await);
        } else {
            drop(timeout(self.write_wait, shutdown).await);
        }
    }

    /// Services the frame channel until it dies.
    ///
    /// A single task owns both stream halves and selects over inbound
    /// frames, the outbound queue, pinger ticks, the close command and the
    /// read deadline. Exiting the loop is the only way a session ends, which
    /// is what makes the disconnect notification exactly-once.
    #[expect(
        clippy::too_many_arguments,
        reason = "The I/O task receives every channel end exactly once, at spawn"
    )]
    async fn run(
        self: Arc<Self>,
        stream: WsStream,
        mut out_rx: mpsc::Receiver<Vec<u8>>,
        mut close_rx: mpsc::Receiver<CloseFrame>,
        mut ping_rx: mpsc::Receiver<()>,
        config: TimeoutConfig,
        handlers: SessionHandlers,
        pinger: Option<JoinHandle<()>>,
    ) {
        let (mut write, mut read) = stream.split();

        let read_deadline = (!config.pong_wait.is_zero()).then_some(config.pong_wait);
        let idle = sleep_until(Instant::now() + read_deadline.unwrap_or(Duration::ZERO));
        tokio::pin!(idle);

        let error: Option<WsError> = loop {
            tokio::select! {
                frame = read.next() => {
                    if let Some(wait) = read_deadline {
                        idle.as_mut().reset(Instant::now() + wait);
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = (handlers.on_message)(text.as_bytes()) {
                                (handlers.on_error)(e);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = (handlers.on_message)(&data) {
                                (handlers.on_error)(e);
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Deadline already pushed out above; the library
                            // answers pings on its own.
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break Some(WsError::ConnectionClosed {
                                code: frame.as_ref().map(|f| u16::from(f.code)),
                                reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                            });
                        }
                        Some(Ok(Message::Frame(_))) => {
                            // Raw frames do not surface outside the library.
                        }
                        Some(Err(e)) => break Some(e.into()),
                        None => break Some(WsError::Transport("connection reset by peer".to_owned())),
                    }
                }
                () = &mut idle, if read_deadline.is_some() => {
                    break Some(WsError::PongTimeout);
                }
                // Once a close is requested the queue and the pinger stop
                // feeding the writer, so a pending close command always wins
                // over further draining.
                payload = out_rx.recv(), if !self.close_requested.load(Ordering::SeqCst) => {
                    let Some(data) = payload else { break None };
                    let message = match String::from_utf8(data) {
                        Ok(text) => Message::Text(text.into()),
                        Err(raw) => Message::Binary(raw.into_bytes().into()),
                    };
                    if let Err(e) = send_with_deadline(&mut write, message, config.write_wait).await {
                        break Some(e);
                    }
                }
                Some(()) = ping_rx.recv(), if !self.close_requested.load(Ordering::SeqCst) => {
                    if let Err(e) =
                        send_with_deadline(&mut write, Message::Ping(Bytes::new()), config.write_wait).await
                    {
                        break Some(e);
                    }
                }
                frame = close_rx.recv() => {
                    // Queued but unsent payloads are discarded, not drained.
                    out_rx.close();
                    while out_rx.try_recv().is_ok() {}
                    let frame = frame.unwrap_or(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    });
                    drop(send_with_deadline(&mut write, Message::Close(Some(frame)), config.write_wait).await);
                    break None;
                }
            }
        };

        if let Some(pinger) = pinger {
            pinger.abort();
        }
        self.closed.store(true, Ordering::SeqCst);

        // A locally requested close wins any race with a transport error:
        // the caller asked for the shutdown, so it is reported as clean.
        let error = if self.close_requested.load(Ordering::SeqCst) {
            None
        } else {
            error
        };

        match error {
            Some(cause) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = %self.id, error = %cause, "session closed on error");
                // Fatal errors reach both the error channel and the
                // disconnect callback.
                (handlers.on_error)(Error::from(cause.clone()));
                (handlers.on_disconnect)(Some(Error::from(cause)));
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = %self.id, "session closed");
                (handlers.on_disconnect)(None);
            }
        }

        // Release anyone waiting in `close` only after the disconnect
        // notification has been delivered.
        drop(self.terminated.send(true));
    }
}

/// Writes one frame under the configured deadline. A zero deadline disables
/// the timer rather than expiring instantly.
async fn send_with_deadline(
    write: &mut WsSink,
    message: Message,
    write_wait: Duration,
) -> std::result::Result<(), WsError> {
    if write_wait.is_zero() {
        return write.send(message).await.map_err(Into::into);
    }
    match timeout(write_wait, write.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(WsError::WriteTimeout),
    }
}

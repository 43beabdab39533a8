use std::sync::{Arc, Mutex, PoisonError, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{Notify, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::Connector;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::config::TimeoutConfig;
use super::dialer::{DialOption, Dialer};
use super::error::WsError;
use super::reconnect::Reconnector;
use super::session::{Session, SessionHandlers};
use crate::Result;
use crate::error::Error;

/// Capacity of the user-visible error stream. Sends never block; an error is
/// dropped when the subscriber is not keeping up.
const ERROR_CHANNEL_CAPACITY: usize = 1;

type MessageHandler = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;
type DisconnectedHandler = Arc<dyn Fn(Option<&Error>) + Send + Sync>;
type ReconnectedHandler = Arc<dyn Fn() + Send + Sync>;

/// Asynchronous WebSocket client, used by a charging station to reach its
/// central system.
///
/// The API is callback-driven: incoming payloads, disconnects and
/// re-established connections are reported through handlers registered
/// before [`start`](Self::start), and writes are queued and sent in the
/// background. When a live session dies on an error the client keeps
/// redialing the same URL with jittered exponential backoff until it
/// succeeds or [`stop`](Self::stop) is called.
///
/// Handlers run on the client's internal tasks and must not block; hand the
/// data off to your own queue if processing is slow.
///
/// # Examples
///
/// ```rust, no_run
/// use ocpp_ws_client::ws::Client;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new();
///     client.set_message_handler(|data| {
///         println!("received {} bytes", data.len());
///         Ok(())
///     });
///
///     client.start("ws://localhost:8887/ws/CP001").await?;
///     client.write(br#"[2,"1","Heartbeat",{}]"#.to_vec())?;
///
///     client.stop().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Live session, if any; replaced wholesale on every successful dial
    session: RwLock<Option<Arc<Session>>>,
    /// URL of the last `start` call, reused by reconnection attempts
    url: RwLock<Option<Url>>,
    /// Ordered dialer mutators, applied just before every dial
    dial_options: RwLock<Vec<DialOption>>,
    /// Extra HTTP headers for the upgrade request
    header: RwLock<HeaderMap>,
    timeouts: RwLock<TimeoutConfig>,
    message_handler: RwLock<Option<MessageHandler>>,
    on_disconnected: RwLock<Option<DisconnectedHandler>>,
    on_reconnected: RwLock<Option<ReconnectedHandler>>,
    /// Sender half of the user error stream; dropped by `stop` to close it
    error_tx: Mutex<Option<mpsc::Sender<Error>>>,
    /// One-slot reconnect interrupt. A stored permit aborts the next (or
    /// currently sleeping) reconnection loop, including a permit left over
    /// from a `stop` with no loop running.
    reconnect_interrupt: Notify,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a plaintext client. Use [`new_tls`](Self::new_tls) for a
    /// client that verifies `wss://` endpoints with a custom TLS
    /// configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session: RwLock::new(None),
                url: RwLock::new(None),
                dial_options: RwLock::new(Vec::new()),
                header: RwLock::new(HeaderMap::new()),
                timeouts: RwLock::new(TimeoutConfig::default()),
                message_handler: RwLock::new(None),
                on_disconnected: RwLock::new(None),
                on_reconnected: RwLock::new(None),
                error_tx: Mutex::new(None),
                reconnect_interrupt: Notify::new(),
            }),
        }
    }

    /// Creates a client that dials with the given TLS connector.
    ///
    /// Internally this registers a dial option, so a later
    /// [`add_option`](Self::add_option) can still override the connector.
    #[must_use]
    pub fn new_tls(connector: Connector) -> Self {
        let client = Self::new();
        client.add_option(move |dialer: &mut Dialer| dialer.connector = Some(connector.clone()));
        client
    }

    /// Appends a dialer mutator. Options run in registration order just
    /// before every dial, so later options override earlier ones.
    pub fn add_option(&self, option: impl Fn(&mut Dialer) + Send + Sync + 'static) {
        self.inner
            .dial_options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(option));
    }

    /// Offers `subprotocol` during the handshake. Duplicates from repeated
    /// calls are ignored.
    pub fn set_requested_subprotocol(&self, subprotocol: &str) {
        let subprotocol = subprotocol.to_owned();
        self.add_option(move |dialer: &mut Dialer| dialer.add_subprotocol(&subprotocol));
    }

    /// Sets the `Authorization` header to HTTP basic authentication with the
    /// given credentials.
    pub fn set_basic_auth(&self, username: &str, password: &str) {
        let token = BASE64.encode(format!("{username}:{password}"));
        let value = HeaderValue::try_from(format!("Basic {token}"))
            .expect("base64 output is always a valid header value");
        self.inner
            .header
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(AUTHORIZATION, value);
    }

    /// Sets a header on the upgrade request, overwriting any previous value
    /// for the same key.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when the key or value is not a legal
    /// HTTP header.
    pub fn set_header_value(&self, key: &str, value: &str) -> Result<()> {
        let name = HeaderName::try_from(key)
            .map_err(|e| Error::validation(format!("invalid header name {key:?}: {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| Error::validation(format!("invalid header value for {key:?}: {e}")))?;
        self.inner
            .header
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
        Ok(())
    }

    /// Replaces the timeout configuration. Must be called before
    /// [`start`](Self::start).
    pub fn set_timeout_config(&self, config: TimeoutConfig) {
        *self
            .inner
            .timeouts
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Sets the callback for all incoming text and binary payloads.
    ///
    /// The handler runs synchronously on the session's I/O task. An `Err`
    /// return is surfaced on the error stream but does not terminate the
    /// session, so protocol-level parse failures never drop the transport.
    pub fn set_message_handler(
        &self,
        handler: impl Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    ) {
        *self
            .inner
            .message_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Sets the callback invoked when a session ends.
    ///
    /// The argument is `None` when the close was requested through
    /// [`stop`](Self::stop) and carries the causing error otherwise. The
    /// callback fires even when automatic reconnection takes over, and
    /// always before the matching reconnected callback.
    pub fn set_disconnected_handler(&self, handler: impl Fn(Option<&Error>) + Send + Sync + 'static) {
        *self
            .inner
            .on_disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Sets the callback invoked after the connection has been
    /// re-established by the automatic reconnection mechanism.
    pub fn set_reconnected_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self
            .inner
            .on_reconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Returns the stream of asynchronous errors.
    ///
    /// The stream has capacity one and never blocks producers; errors are
    /// dropped when the subscriber lags. It is closed by
    /// [`stop`](Self::stop). Subscribe before starting the client; a stream
    /// created while the client is running misses errors already in flight.
    pub fn errors(&self) -> mpsc::Receiver<Error> {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        *self
            .inner
            .error_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Connects to the server and returns once the session is live.
    ///
    /// Incoming payloads are passed to the message handler from then on; no
    /// explicit read operation exists. Use [`stop`](Self::stop) to close the
    /// session again. A client is reusable across start/stop cycles, but
    /// must not be started from several tasks at once, and handlers and
    /// options registered after this call do not reach the live session.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for an unparsable URL, a bad timeout
    /// configuration or a client that is already connected, and a
    /// `Handshake` error when the dial or upgrade fails. A handshake error
    /// carries the HTTP status and response body when the server answered
    /// with plain HTTP.
    pub async fn start(&self, url: &str) -> Result<()> {
        let url = Url::parse(url)?;
        self.inner.start(url).await
    }

    /// Connects like [`start`](Self::start), but on failure keeps retrying
    /// with the configured backoff until a dial succeeds or
    /// [`stop`](Self::stop) interrupts the wait.
    pub async fn start_with_retries(&self, url: &str) {
        if let Err(e) = self.start(url).await {
            #[cfg(feature = "tracing")]
            tracing::info!(error = %e, "connection failed, entering reconnection loop");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            Arc::clone(&self.inner).reconnect_loop().await;
        }
    }

    /// Closes the connection to the server with a normal-closure code.
    ///
    /// Queued but unsent payloads are discarded. The call blocks while the
    /// close frame goes out and the session shuts down, but never longer
    /// than the configured write deadline; in the normal case the
    /// disconnect callback has fired with `None` by the time it returns.
    /// Also wakes a sleeping reconnection loop, which then exits without
    /// dialing again, and closes the error stream. Safe to call at any
    /// time, including repeatedly.
    pub async fn stop(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("closing connection to server");
        let session = self
            .inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            session.close(CloseCode::Normal, "").await;
        }
        self.inner.reconnect_interrupt.notify_one();
        self.inner
            .error_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Queues a payload to be sent to the server in the background.
    ///
    /// Payloads that are valid UTF-8 go out as text frames, anything else as
    /// binary.
    ///
    /// # Errors
    ///
    /// `NotConnected` without a live session, `QueueOverflow` when the
    /// outbound queue is full.
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        let session = self
            .inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match session {
            Some(session) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = %session.id(), "queuing data for server");
                session.write(data)
            }
            None => Err(WsError::NotConnected.into()),
        }
    }

    /// Whether a live session exists right now. Explicitly `false` while
    /// reconnection is in progress.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The id of the current session, i.e. the final path segment of the
    /// connection URL.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.id().to_owned())
    }

    /// A handle to the current session, for callers that want to inspect the
    /// negotiated subprotocol or TLS state, or write to the session
    /// directly. The handle outlives the session it points at; check
    /// [`Session::is_connected`] before trusting it.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClientInner {
    fn is_connected(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    async fn start(self: &Arc<Self>, url: Url) -> Result<()> {
        let timeouts = *self.timeouts.read().unwrap_or_else(PoisonError::into_inner);
        timeouts.validate()?;
        if self.is_connected() {
            return Err(Error::validation(
                "client is already connected; call stop before starting again",
            ));
        }

        *self.url.write().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());

        let mut dialer = Dialer::new();
        {
            let options = self
                .dial_options
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for option in options.iter() {
                option(&mut dialer);
            }
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::from(WsError::from_handshake(e)))?;
        {
            let header = self.header.read().unwrap_or_else(PoisonError::into_inner);
            for (name, value) in header.iter() {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        if !dialer.subprotocols.is_empty() {
            let offer = dialer.subprotocols.join(", ");
            let value = HeaderValue::try_from(offer)
                .map_err(|e| Error::validation(format!("invalid subprotocol list: {e}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %url, "connecting to server");

        let connect = connect_async_tls_with_config(
            request,
            dialer.ws_config,
            dialer.disable_nagle,
            dialer.connector,
        );
        // A zero handshake timeout disables the deadline.
        let (stream, response) = if timeouts.handshake_timeout.is_zero() {
            connect.await.map_err(WsError::from_handshake)?
        } else {
            match timeout(timeouts.handshake_timeout, connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(WsError::from_handshake(e).into()),
                Err(_) => return Err(WsError::handshake_timeout().into()),
            }
        };

        let id = session_id(&url);
        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        let session = Session::spawn(id, stream, subprotocol, timeouts, self.session_handlers());
        #[cfg(feature = "tracing")]
        tracing::info!(id = %session.id(), "connected to server");
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    /// Builds the callbacks bound into a new session. They hold the client
    /// weakly so that a forgotten session cannot keep it alive.
    fn session_handlers(self: &Arc<Self>) -> SessionHandlers {
        let on_message = {
            let inner = Arc::downgrade(self);
            Box::new(move |data: &[u8]| {
                let Some(inner) = inner.upgrade() else {
                    return Ok(());
                };
                let handler = inner
                    .message_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler(data)
                        .map_err(|e| Error::from(WsError::Handler(e.to_string()))),
                    None => Err(WsError::Handler("no message handler set".to_owned()).into()),
                }
            }) as Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>
        };

        let on_disconnect = {
            let inner = Arc::downgrade(self);
            Box::new(move |error: Option<Error>| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let handler = inner
                    .on_disconnected
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(handler) = handler {
                    handler(error.as_ref());
                }
                if error.is_some() {
                    // The session was lost, not stopped: hand control to the
                    // reconnection loop.
                    tokio::spawn(Arc::clone(&inner).reconnect_loop());
                }
            }) as Box<dyn Fn(Option<Error>) + Send + Sync>
        };

        let on_error = {
            let inner = Arc::downgrade(self);
            Box::new(move |error: Error| {
                if let Some(inner) = inner.upgrade() {
                    inner.push_error(error);
                }
            }) as Box<dyn Fn(Error) + Send + Sync>
        };

        SessionHandlers {
            on_message,
            on_disconnect,
            on_error,
        }
    }

    /// Redials the last URL until a dial succeeds or the interrupt fires.
    ///
    /// The interrupt check is biased ahead of the timer so that a `stop`
    /// issued during the sleep always wins, even when both are ready.
    async fn reconnect_loop(self: Arc<Self>) {
        #[cfg(feature = "tracing")]
        tracing::info!("started automatic reconnection handler");
        let timeouts = *self.timeouts.read().unwrap_or_else(PoisonError::into_inner);
        let mut backoff = Reconnector::new(&timeouts);

        loop {
            tokio::select! {
                biased;
                () = self.reconnect_interrupt.notified() => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("automatic reconnection aborted");
                    return;
                }
                () = sleep(backoff.delay()) => {}
            }

            let url = self
                .url
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(url) = url else { return };

            let attempt = backoff.attempts();
            #[cfg(feature = "tracing")]
            tracing::info!(attempt, "reconnecting");
            #[cfg(not(feature = "tracing"))]
            let _ = attempt;
            match self.start(url).await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("reconnected successfully to server");
                    let handler = self
                        .on_reconnected
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                    return;
                }
                Err(e) => {
                    self.push_error(WsError::Reconnect(format!("reconnection failed: {e}")).into());
                }
            }
            backoff.record_failure();
        }
    }

    /// Forwards an asynchronous error to the subscriber, if any, without
    /// blocking the reporting task.
    fn push_error(&self, error: Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "client error");
        let guard = self.error_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            drop(tx.try_send(error));
        }
    }
}

/// Final non-empty path segment of the connection URL, used as the session
/// id. Falls back to the raw path for URLs without one.
fn session_id(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.rev().find(|s| !s.is_empty()))
        .map_or_else(|| url.path().to_owned(), ToOwned::to_owned)
}

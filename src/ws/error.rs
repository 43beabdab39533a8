#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use tokio_tungstenite::tungstenite::Error as TungsteniteError;

use crate::error::{Error, Kind};

/// Largest response-body slice copied into a handshake error.
const HANDSHAKE_DETAILS_LIMIT: usize = 64 * 1024;

/// WebSocket error variants.
///
/// Transport causes are stored as rendered strings so that a single failure
/// can be delivered to both the error channel and the disconnect callback.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum WsError {
    /// The upgrade handshake failed
    Handshake {
        /// What went wrong
        message: String,
        /// HTTP status line, when the server answered with HTTP
        status: Option<String>,
        /// HTTP status code, when the server answered with HTTP
        code: Option<u16>,
        /// Response body, truncated to 64 KiB
        details: Option<String>,
    },
    /// A reconnection attempt failed
    Reconnect(String),
    /// No live session to write to
    NotConnected,
    /// The bounded outbound queue is full
    QueueOverflow,
    /// Frame-level I/O failure
    Transport(String),
    /// No inbound frame arrived within the read deadline
    PongTimeout,
    /// A single outbound frame missed its write deadline
    WriteTimeout,
    /// The peer closed the connection
    ConnectionClosed {
        /// Close code from the peer's close frame, if one was received
        code: Option<u16>,
        /// Close reason from the peer's close frame
        reason: String,
    },
    /// The message handler rejected an inbound payload, or none was set
    Handler(String),
}

impl WsError {
    /// Builds a handshake error, enriched with status code and response body
    /// when the server answered the upgrade request with plain HTTP.
    pub(crate) fn from_handshake(error: TungsteniteError) -> Self {
        match error {
            TungsteniteError::Http(response) => {
                let code = response.status();
                let status = format!(
                    "{} {}",
                    code.as_u16(),
                    code.canonical_reason().unwrap_or_default()
                );
                let details = response.into_body().map(|body| {
                    let end = body.len().min(HANDSHAKE_DETAILS_LIMIT);
                    String::from_utf8_lossy(&body[..end]).into_owned()
                });
                Self::Handshake {
                    message: "server rejected the websocket upgrade".to_owned(),
                    status: Some(status),
                    code: Some(code.as_u16()),
                    details,
                }
            }
            other => Self::Handshake {
                message: other.to_string(),
                status: None,
                code: None,
                details: None,
            },
        }
    }

    pub(crate) fn handshake_timeout() -> Self {
        Self::Handshake {
            message: "handshake timed out".to_owned(),
            status: None,
            code: None,
            details: None,
        }
    }

    fn kind(&self) -> Kind {
        match self {
            Self::Handshake { .. } | Self::Reconnect(_) => Kind::Handshake,
            Self::NotConnected => Kind::NotConnected,
            Self::QueueOverflow => Kind::QueueOverflow,
            Self::Transport(_)
            | Self::PongTimeout
            | Self::WriteTimeout
            | Self::ConnectionClosed { .. } => Kind::Transport,
            Self::Handler(_) => Kind::Handler,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake {
                message,
                status,
                details,
                ..
            } => {
                write!(f, "websocket handshake failed: {message}")?;
                if let Some(status) = status {
                    write!(f, " (HTTP {status})")?;
                }
                if let Some(details) = details
                    && !details.is_empty()
                {
                    write!(f, ": {details}")?;
                }
                Ok(())
            }
            Self::Reconnect(message) => write!(f, "{message}"),
            Self::NotConnected => {
                write!(f, "client is currently not connected, cannot send data")
            }
            Self::QueueOverflow => write!(f, "outbound queue is full, payload rejected"),
            Self::Transport(cause) => write!(f, "websocket transport error: {cause}"),
            Self::PongTimeout => write!(f, "no pong received within the read deadline"),
            Self::WriteTimeout => write!(f, "outbound frame write timed out"),
            Self::ConnectionClosed { code, reason } => {
                write!(f, "connection closed by peer")?;
                if let Some(code) = code {
                    write!(f, " (code {code})")?;
                }
                if !reason.is_empty() {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            Self::Handler(cause) => write!(f, "message handler error: {cause}"),
        }
    }
}

impl StdError for WsError {}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = e.kind();
        Error::with_source(kind, e)
    }
}

impl From<TungsteniteError> for WsError {
    fn from(e: TungsteniteError) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_display_includes_status_and_details() {
        let error = WsError::Handshake {
            message: "server rejected the websocket upgrade".to_owned(),
            status: Some("401 Unauthorized".to_owned()),
            code: Some(401),
            details: Some("bad creds".to_owned()),
        };

        assert_eq!(
            error.to_string(),
            "websocket handshake failed: server rejected the websocket upgrade \
             (HTTP 401 Unauthorized): bad creds"
        );
    }

    #[test]
    fn kinds_map_to_the_crate_error() {
        let error: Error = WsError::QueueOverflow.into();
        assert_eq!(error.kind(), Kind::QueueOverflow);

        let error: Error = WsError::PongTimeout.into();
        assert_eq!(error.kind(), Kind::Transport);

        let error: Error = WsError::Handler("no message handler set".to_owned()).into();
        assert_eq!(error.kind(), Kind::Handler);
    }

    #[test]
    fn connection_closed_display_carries_the_close_code() {
        let error = WsError::ConnectionClosed {
            code: Some(1001),
            reason: "going away".to_owned(),
        };

        assert_eq!(
            error.to_string(),
            "connection closed by peer (code 1001): going away"
        );
    }
}

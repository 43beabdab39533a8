use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Mutable handshake state that dial options act on.
///
/// A fresh `Dialer` is built for every dial and the registered options are
/// applied in registration order, so a later option can override anything an
/// earlier one set.
#[derive(Default)]
pub struct Dialer {
    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in offer order
    pub subprotocols: Vec<String>,
    /// Frame-layer configuration handed to the WebSocket library
    pub ws_config: Option<WebSocketConfig>,
    /// TLS connector used for `wss://` URLs; `None` lets the library pick
    pub connector: Option<Connector>,
    /// Disable Nagle's algorithm on the underlying TCP stream
    pub disable_nagle: bool,
}

/// An ordered mutator applied to the [`Dialer`] just before dialing.
pub type DialOption = Box<dyn Fn(&mut Dialer) + Send + Sync>;

impl Dialer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers `subprotocol` during the handshake unless it is already listed.
    pub fn add_subprotocol(&mut self, subprotocol: &str) {
        if !self.subprotocols.iter().any(|p| p == subprotocol) {
            self.subprotocols.push(subprotocol.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_subprotocols_are_ignored() {
        let mut dialer = Dialer::new();

        dialer.add_subprotocol("ocpp1.6");
        dialer.add_subprotocol("ocpp1.6");
        dialer.add_subprotocol("ocpp2.0.1");
        dialer.add_subprotocol("ocpp1.6");

        assert_eq!(dialer.subprotocols, vec!["ocpp1.6", "ocpp2.0.1"]);
    }

    #[test]
    fn options_apply_in_registration_order() {
        let options: Vec<DialOption> = vec![
            Box::new(|dialer| dialer.disable_nagle = true),
            Box::new(|dialer| dialer.disable_nagle = false),
        ];

        let mut dialer = Dialer::new();
        for option in &options {
            option(&mut dialer);
        }

        assert!(!dialer.disable_nagle);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Anything outbound control messages can be written to.
pub trait SocketSink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send_text(&self, text: String) -> Result<(), TransportError>;
}

/// Send `payload` if the socket is open. Strings go out verbatim, anything
/// else as JSON. Never fails loudly: every problem becomes `false`.
pub fn safe_ws_send<S, T>(socket: &S, payload: &T) -> bool
where
    S: SocketSink + ?Sized,
    T: Serialize + ?Sized,
{
    if !socket.is_open() {
        return false;
    }

    let text = match serde_json::to_value(payload) {
        Ok(Value::String(text)) => text,
        Ok(value) => value.to_string(),
        Err(e) => {
            warn!("Failed to serialize control message: {}", e);
            return false;
        }
    };

    match socket.send_text(text) {
        Ok(()) => true,
        Err(e) => {
            debug!("Control message not sent: {}", e);
            false
        }
    }
}

/// Write half of one WebSocket connection. A new one is created for every
/// connection; it never outlives its socket.
#[derive(Debug, Clone)]
pub struct ControlSocket {
    tx: mpsc::Sender<Message>,
    open: Arc<AtomicBool>,
}

impl ControlSocket {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl SocketSink for ControlSocket {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .try_send(Message::Text(text))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Shared slot holding the socket of the current connection, if any.
/// Written only by the session; everyone else sends through it.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    current: Arc<RwLock<Option<ControlSocket>>>,
}

impl Outbox {
    pub fn attach(&self, socket: ControlSocket) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(socket);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut current) = self.current.write() {
            if let Some(socket) = current.take() {
                socket.mark_closed();
            }
        }
    }

    fn socket(&self) -> Option<ControlSocket> {
        self.current.read().ok().and_then(|s| s.clone())
    }
}

impl SocketSink for Outbox {
    fn is_open(&self) -> bool {
        self.socket().is_some_and(|s| s.is_open())
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.socket()
            .ok_or(TransportError::ChannelClosed)?
            .send_text(text)
    }
}

//! Registration and the WebSocket control channel.
//!
//! `SessionManager` is the only writer of session state. It runs as one task:
//! connect, pump frames until the socket closes, back off, reconnect. Other
//! components observe it through a cloneable `SessionHandle` and receive
//! inbound control messages, in arrival order, as `SessionEvent`s.

pub mod backoff;
pub mod messages;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::central_client::CentralClient;
use crate::crypto::{NodeKeys, TokenIssuer};
use crate::error::{JwtError, SessionError};
use crate::net::{ControlSocket, Outbox};
use crate::types::{NodeAuth, RegisterNodeRequest};

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use messages::{parse_inbound, InboundMessage, MessageError, NodeCommand};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unregistered,
    Registering,
    Registered,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Terminated,
}

#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// Reconnect attempts are exhausted; nothing will reconnect on its own.
    Offline { attempts: u32 },
    Inbound(InboundMessage),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Used when registration does not assign a control channel URL.
    pub ws_url: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub token_ttl: String,
}

/// Why a connection's pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Cancelled,
    Requested,
    Remote,
}

/// Read-only view of the session plus the outbound slot.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    outbox: Outbox,
    reconnect_tx: mpsc::Sender<()>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the session to drop the current connection and dial again.
    pub fn request_reconnect(&self) -> bool {
        self.reconnect_tx.try_send(()).is_ok()
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for(&self, target: SessionState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| *s == target).await.is_ok();
        reached
    }
}

pub struct SessionManager {
    settings: SessionSettings,
    central: Arc<CentralClient>,
    keys: Arc<NodeKeys>,
    registration: RegisterNodeRequest,
    auth: Option<NodeAuth>,
    state: watch::Sender<SessionState>,
    outbox: Outbox,
    events: mpsc::Sender<SessionEvent>,
    reconnect: ReconnectState,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: mpsc::Receiver<()>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        central: Arc<CentralClient>,
        keys: Arc<NodeKeys>,
        registration: RegisterNodeRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unregistered);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let reconnect = ReconnectState::new(settings.reconnect);

        Self {
            settings,
            central,
            keys,
            registration,
            auth: None,
            state,
            outbox: Outbox::default(),
            events,
            reconnect,
            reconnect_tx,
            reconnect_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.subscribe(),
            outbox: self.outbox.clone(),
            reconnect_tx: self.reconnect_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn auth(&self) -> Option<&NodeAuth> {
        self.auth.as_ref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    /// Token issuer bound to the registered node id.
    pub fn token_issuer(&self) -> Result<TokenIssuer, SessionError> {
        let auth = self.auth.as_ref().ok_or(SessionError::NotRegistered)?;
        Ok(TokenIssuer::new(
            self.keys.clone(),
            auth.node_id.clone(),
            auth.node_name.clone(),
            self.settings.token_ttl.clone(),
        ))
    }

    /// Register with the central server. There is no fallback: an error here
    /// should abort startup.
    pub async fn register_node(&mut self) -> Result<&NodeAuth, SessionError> {
        self.set_state(SessionState::Registering);
        let public_key = self.keys.public_key_base64();

        let data = match self
            .central
            .register_node(&self.registration, &public_key)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                self.set_state(SessionState::Unregistered);
                return Err(e);
            }
        };

        let auth = NodeAuth {
            node_id: data.node_id,
            node_name: self.registration.node_name.clone(),
            ws_url: data.ws_url.unwrap_or_else(|| self.settings.ws_url.clone()),
            public_key,
        };
        info!(
            "Session registered: node_id={}, ws_url={}",
            auth.node_id, auth.ws_url
        );

        self.set_state(SessionState::Registered);
        Ok(self.auth.insert(auth))
    }

    /// Open one WebSocket connection with a fresh bearer token. Does not retry.
    pub async fn connect(&mut self) -> Result<WsStream, SessionError> {
        let auth = self.auth.as_ref().ok_or(SessionError::NotRegistered)?;
        let url = control_channel_url(&auth.ws_url, &auth.node_id)?;
        let token = self.token_issuer()?.issue()?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Connect(Box::new(e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SessionError::Token(JwtError::Issue(e.to_string())))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        self.set_state(SessionState::Connecting);
        info!("Connecting control channel to {}", url);

        let timeout = self.settings.connect_timeout;
        let (stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| SessionError::ConnectTimeout(timeout))?
            .map_err(|e| SessionError::Connect(Box::new(e)))?;

        self.mark_open();
        Ok(stream)
    }

    fn mark_open(&mut self) {
        if self.reconnect.attempts() > 0 {
            info!(
                "Control channel open after {} reconnect attempt(s)",
                self.reconnect.attempts()
            );
        }
        self.reconnect.reset();
        self.set_state(SessionState::Connected);
    }

    /// Keep the control channel up until `cancel` fires or reconnect attempts
    /// run out.
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.auth.is_none() {
            error!("Session started without registration");
            self.set_state(SessionState::Terminated);
            return;
        }

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    self.emit(SessionEvent::Connected).await;
                    let closed = self.pump(stream, &cancel).await;
                    if closed == Closed::Cancelled {
                        break;
                    }
                    self.set_state(SessionState::Disconnected);
                    self.emit(SessionEvent::Disconnected).await;
                }
                Err(e) => {
                    warn!("Control channel connect failed: {}", e);
                    self.set_state(SessionState::Disconnected);
                }
            }

            let Some(delay) = self.reconnect.next_delay() else {
                let attempts = self.settings.reconnect.max_attempts;
                error!(
                    "Giving up on control channel after {} reconnect attempt(s); node is offline",
                    attempts
                );
                self.set_state(SessionState::Terminated);
                self.emit(SessionEvent::Offline { attempts }).await;
                return;
            };

            self.set_state(SessionState::Reconnecting);
            info!(
                "Reconnecting control channel in {:?} (attempt {}/{})",
                delay,
                self.reconnect.attempts(),
                self.settings.reconnect.max_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.outbox.detach();
        self.set_state(SessionState::Terminated);
        info!("Session stopped");
    }

    /// Move frames in both directions until the connection ends. Returns only
    /// after the socket is torn down, so the next connect never overlaps it.
    async fn pump(&mut self, stream: WsStream, cancel: &CancellationToken) -> Closed {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let socket = ControlSocket::new(outbound_tx);
        self.outbox.attach(socket.clone());

        let events = self.events.clone();
        let reconnect_rx = &mut self.reconnect_rx;

        // Drop any restart request that arrived while disconnected.
        while reconnect_rx.try_recv().is_ok() {}

        let closed = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Closed::Cancelled,
                Some(()) = reconnect_rx.recv() => {
                    info!("Control channel reconnect requested");
                    break Closed::Requested;
                }
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        warn!("Control channel write failed: {}", e);
                        break Closed::Remote;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => dispatch(&events, &text).await,
                    Some(Ok(Message::Close(frame))) => {
                        info!("Control channel closed by server: {:?}", frame);
                        break Closed::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Control channel read failed: {}", e);
                        break Closed::Remote;
                    }
                    None => break Closed::Remote,
                },
            }
        };

        socket.mark_closed();
        self.outbox.detach();

        if closed != Closed::Remote {
            let _ = sink.send(Message::Close(None)).await;
        }
        let _ = sink.close().await;

        closed
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session event dropped, receiver is gone");
        }
    }
}

async fn dispatch(events: &mpsc::Sender<SessionEvent>, text: &str) {
    match parse_inbound(text) {
        Ok(message) => {
            debug!("Control message received: {:?}", message);
            if events.send(SessionEvent::Inbound(message)).await.is_err() {
                debug!("Control message dropped, receiver is gone");
            }
        }
        Err(e) => warn!("Ignoring control message: {}", e),
    }
}

fn control_channel_url(ws_url: &str, node_id: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(ws_url).map_err(|e| SessionError::InvalidUrl {
        url: ws_url.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SessionError::InvalidUrl {
            url: ws_url.to_string(),
            reason: "scheme must be ws or wss".to_string(),
        });
    }

    url.query_pairs_mut().append_pair("nodeId", node_id);
    Ok(url)
}

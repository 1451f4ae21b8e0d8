//! Bidirectional relay between the protocol connection and the bus.
//!
//! Every event goes through [`MessageRelay::dispatch`]. Handlers may run
//! concurrently with each other and with themselves; session state is always
//! read back from the store.
//!
//! Logout and login resets bump a session epoch and wait for in-flight store
//! writes before clearing. Work started under an older epoch is discarded, so a
//! cleared session cannot be written back.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chatbridge_core::{
    BridgeConfig, BusError, DisconnectReason, InboundMessage, InboundRecord, MessageBus, MsgStore,
    RelayEvent, SessionStatus,
};
use chatbridge_session::{AuthState, SessionError, SessionStateStore};
use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Map;
use thiserror::Error;
use tokio::{
    sync::{RwLock, mpsc, watch},
    task::JoinHandle,
};

use crate::{
    notify::{DeliveryNotifier, DeliveryReport},
    protocol::{Media, Origin, PeerRef, RelayEnvelope},
    socket::{OutboundContent, ProtocolConnector, ProtocolError, ProtocolSocket, SendError},
};

/// Upper bound on the pause between failed reconnect attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Connection lifecycle as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Logged out. Nothing reconnects until [`MessageRelay::reset_login`].
    Terminated,
}

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed bus payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("Envelope rejected: {0}")]
    Rejected(&'static str),
    #[error("Envelope did not come from an external sender")]
    NotExternal,
    #[error("Session is logged out; reset the login before connecting")]
    AuthTerminal,
    #[error("Connect attempt superseded by a login reset")]
    Superseded,
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result of delivering one envelope to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Error(String),
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Per-peer record of an outbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDelivery {
    /// Peer as given in the envelope.
    pub peer: String,
    /// Protocol id the peer normalized to, if it had any digits.
    pub jid: Option<String>,
    pub outcome: DeliveryOutcome,
}

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Bus channel used in both directions.
    pub channel: String,
    /// Pause before the first reconnect attempt; doubled on each failure.
    pub reconnect_delay: Duration,
}

impl RelayOptions {
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            reconnect_delay: config.reconnect_delay,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// Owns the protocol connection of one session and forwards traffic.
pub struct MessageRelay {
    session: SessionStateStore,
    connector: Arc<dyn ProtocolConnector>,
    bus: Arc<dyn MessageBus>,
    notifier: Arc<dyn DeliveryNotifier>,
    options: RelayOptions,
    state: watch::Sender<ConnectionState>,
    /// Bumped by `logout` and `reset_login`.
    epoch: AtomicU64,
    /// Held shared by session writes, exclusively while clearing.
    clear_gate: RwLock<()>,
    auth: RwLock<Option<(u64, AuthState)>>,
    socket: RwLock<Option<Arc<dyn ProtocolSocket>>>,
    recent: Arc<MsgStore>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
}

impl MessageRelay {
    /// Create a relay and the receiving end of its event queue.
    ///
    /// Pass the receiver to [`MessageRelay::run`].
    #[must_use]
    pub fn new(
        session: SessionStateStore,
        connector: Arc<dyn ProtocolConnector>,
        bus: Arc<dyn MessageBus>,
        notifier: Arc<dyn DeliveryNotifier>,
        options: RelayOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let relay = Arc::new(Self {
            session,
            connector,
            bus,
            notifier,
            options,
            state,
            epoch: AtomicU64::new(0),
            clear_gate: RwLock::new(()),
            auth: RwLock::new(None),
            socket: RwLock::new(None),
            recent: Arc::new(MsgStore::new()),
            events_tx,
        });
        (relay, events_rx)
    }

    /// Sender feeding the relay's event queue.
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedSender<RelayEvent> {
        self.events_tx.clone()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Recently relayed inbound messages, newest first.
    #[must_use]
    pub fn recent_messages(&self) -> Vec<InboundRecord> {
        self.recent.get_history()
    }

    /// Recent inbound messages oldest first, then each new one as it arrives.
    #[must_use]
    pub fn recent_feed(&self) -> BoxStream<'static, InboundRecord> {
        self.recent.history_plus_stream()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Load the session and open a protocol connection.
    ///
    /// The state stays `Connecting` until the protocol reports the
    /// connection open.
    ///
    /// # Errors
    /// Returns [`RelayError::AuthTerminal`] after a logout, or the session or
    /// protocol error that prevented connecting.
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.state() == ConnectionState::Terminated {
            return Err(RelayError::AuthTerminal);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let result = async {
            let auth = {
                let _gate = self.clear_gate.read().await;
                self.ensure_current(epoch)?;
                self.session.initialize().await?
            };
            let socket = self
                .connector
                .connect(auth.clone(), self.events_tx.clone())
                .await?;
            self.install(epoch, auth, socket).await
        }
        .await;

        match &result {
            Err(RelayError::AuthTerminal | RelayError::Superseded) => {
                tracing::warn!(session = %self.session.session_id(), "Discarded connect attempt after logout");
            }
            Err(e) => {
                tracing::error!(session = %self.session.session_id(), "Failed to connect: {e}");
                // a logout may have landed meanwhile
                if self.state() == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            Ok(()) => {}
        }
        result
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), RelayError> {
        if self.state() == ConnectionState::Terminated {
            Err(RelayError::AuthTerminal)
        } else if self.epoch.load(Ordering::SeqCst) != epoch {
            Err(RelayError::Superseded)
        } else {
            Ok(())
        }
    }

    /// Keep a freshly opened connection unless a logout or reset happened
    /// since `epoch`; a stale one is logged out and dropped.
    async fn install(
        &self,
        epoch: u64,
        auth: AuthState,
        socket: Arc<dyn ProtocolSocket>,
    ) -> Result<(), RelayError> {
        let stale = {
            let mut slot = self.socket.write().await;
            match self.ensure_current(epoch) {
                Ok(()) => {
                    *self.auth.write().await = Some((epoch, auth));
                    *slot = Some(socket);
                    return Ok(());
                }
                Err(e) => (e, socket),
            }
        };
        let (err, socket) = stale;
        if let Err(e) = socket.logout().await {
            tracing::warn!("Failed to log out discarded connection: {e}");
        }
        Err(err)
    }

    /// Consume events until the queue closes, handling each on its own task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            let relay = Arc::clone(&self);
            tokio::spawn(async move { relay.dispatch(event).await });
        }
        tracing::debug!("Relay event queue closed");
    }

    /// Subscribe to the bus channel and feed payloads into the event queue.
    ///
    /// # Errors
    /// Returns error if the subscription cannot be established.
    pub async fn spawn_bus_listener(&self) -> Result<JoinHandle<()>, RelayError> {
        let mut stream = self.bus.subscribe(&self.options.channel).await?;
        let events = self.events_tx.clone();
        let channel = self.options.channel.clone();
        tracing::info!(channel = %channel, "Listening for bus envelopes");

        Ok(tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                if events.send(RelayEvent::BusMessage(payload)).is_err() {
                    break;
                }
            }
            tracing::warn!(channel = %channel, "Bus subscription ended");
        }))
    }

    /// Handle one event to completion.
    pub async fn dispatch(&self, event: RelayEvent) {
        match event {
            RelayEvent::CredsUpdated => self.on_creds_updated().await,
            RelayEvent::ConnectionOpen => self.on_open().await,
            RelayEvent::ConnectionClosed(reason) => self.on_closed(reason).await,
            RelayEvent::MessageReceived(msg) => self.on_message(&msg).await,
            RelayEvent::BusMessage(raw) => match self.handle_bus_payload(&raw).await {
                Ok(deliveries) => {
                    let sent: Vec<&str> = deliveries
                        .iter()
                        .filter(|d| d.outcome.is_sent())
                        .map(|d| d.peer.as_str())
                        .collect();
                    if !sent.is_empty() {
                        tracing::info!(peers = ?sent, "Relayed external message");
                    }
                }
                Err(RelayError::NotExternal) => {
                    tracing::debug!("Ignoring envelope this relay published");
                }
                Err(e) => tracing::error!(payload = %raw, "Dropping bus message: {e}"),
            },
        }
    }

    async fn on_creds_updated(&self) {
        let loaded = self.auth.read().await.clone();
        let Some((epoch, auth)) = loaded else {
            tracing::warn!("Credentials updated with no session loaded");
            return;
        };
        let _gate = self.clear_gate.read().await;
        if self.ensure_current(epoch).is_err() {
            tracing::debug!("Dropping credential update for a cleared session");
            return;
        }
        match auth.save_creds().await {
            Ok(()) => tracing::debug!("Saved updated credentials"),
            Err(e) => tracing::error!("Failed to save updated credentials: {e}"),
        }
    }

    async fn on_open(&self) {
        if self.state() == ConnectionState::Terminated {
            return;
        }
        self.set_state(ConnectionState::Open);
        tracing::info!(session = %self.session.session_id(), "Connection open");
        self.session
            .update_status(SessionStatus::Open, Map::new())
            .await;
    }

    async fn on_closed(&self, reason: DisconnectReason) {
        self.socket.write().await.take();
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), format!("{reason:?}").into());
        self.session
            .update_status(SessionStatus::Closed, metadata)
            .await;

        if reason.is_logged_out() {
            self.set_state(ConnectionState::Terminated);
            tracing::warn!(
                session = %self.session.session_id(),
                "Logged out; re-authentication required"
            );
            return;
        }
        if self.state() == ConnectionState::Terminated {
            return;
        }

        tracing::info!(reason = ?reason, "Connection closed, reconnecting");
        self.set_state(ConnectionState::Connecting);
        self.reconnect().await;
    }

    async fn reconnect(&self) {
        let mut delay = self.options.reconnect_delay;
        loop {
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(()) | Err(RelayError::AuthTerminal | RelayError::Superseded) => return,
                Err(_) => {
                    delay = (delay * 2).clamp(Duration::from_millis(1), MAX_RECONNECT_DELAY);
                    tracing::warn!(retry_in = ?delay, "Reconnect failed");
                }
            }
        }
    }

    async fn on_message(&self, msg: &InboundMessage) {
        let Some(envelope) = RelayEnvelope::from_inbound(msg) else {
            return;
        };
        let phone = envelope.peers.to_vec().first().map(ToString::to_string).unwrap_or_default();
        self.recent.push(InboundRecord {
            phone: phone.clone(),
            name: envelope.name.clone(),
            message: envelope.text.clone(),
            received_at: Utc::now(),
        });

        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(phone = %phone, "Failed to encode inbound envelope: {e}");
                return;
            }
        };
        match self.bus.publish(&self.options.channel, &payload).await {
            Ok(()) => tracing::info!(phone = %phone, "Relayed inbound message to bus"),
            Err(e) => tracing::error!(phone = %phone, "Failed to publish inbound message: {e}"),
        }
    }

    /// Parse an external envelope and deliver it to every listed peer.
    ///
    /// Peers are handled one after another; a failure for one peer is
    /// recorded in its [`PeerDelivery`] and never stops the next. When the
    /// envelope carries a verification token the notifier gets one report
    /// per peer.
    ///
    /// # Errors
    /// Returns error if the payload is malformed, not external, or lacks
    /// peers or text.
    pub async fn handle_bus_payload(&self, raw: &str) -> Result<Vec<PeerDelivery>, RelayError> {
        let envelope = RelayEnvelope::parse(raw)?;
        if envelope.origin != Origin::External {
            return Err(RelayError::NotExternal);
        }
        let peers = envelope.peers.to_vec();
        if peers.is_empty() {
            return Err(RelayError::Rejected("no peers"));
        }
        if envelope.text.is_empty() {
            return Err(RelayError::Rejected("empty message"));
        }

        let socket = self.socket.read().await.clone();
        let token = envelope.verification_token();
        let mut deliveries = Vec::with_capacity(peers.len());

        for peer in peers {
            let delivery = self.deliver(socket.as_deref(), peer, &envelope).await;
            if let DeliveryOutcome::Error(reason) = &delivery.outcome {
                tracing::warn!(peer = %delivery.peer, "Delivery failed: {reason}");
            }
            if let Some(token) = token {
                let report = match &delivery.outcome {
                    DeliveryOutcome::Sent => DeliveryReport::sent(token.clone(), &delivery.peer),
                    DeliveryOutcome::Error(reason) => {
                        DeliveryReport::failed(token.clone(), &delivery.peer, reason)
                    }
                };
                self.notifier.notify(&report).await;
            }
            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    async fn deliver(
        &self,
        socket: Option<&dyn ProtocolSocket>,
        peer: &PeerRef,
        envelope: &RelayEnvelope,
    ) -> PeerDelivery {
        let jid = peer.to_protocol_jid();
        let outcome = match (&jid, socket) {
            (None, _) => DeliveryOutcome::Error("peer has no digits".to_string()),
            (Some(_), None) => DeliveryOutcome::Error(SendError::NotConnected.to_string()),
            (Some(jid), Some(socket)) => self.send_all(socket, jid, envelope).await,
        };
        PeerDelivery {
            peer: peer.to_string(),
            jid,
            outcome,
        }
    }

    /// Send the text, then each media item. A failed item does not stop the
    /// ones after it; the outcome lists every failure.
    async fn send_all(&self, socket: &dyn ProtocolSocket, jid: &str, envelope: &RelayEnvelope) -> DeliveryOutcome {
        let mut contents = vec![OutboundContent::Text(envelope.text.clone())];
        contents.extend(envelope.media.items().into_iter().map(|media| match media {
            Media::Image(url) => OutboundContent::Image { url },
            Media::Audio(url) => OutboundContent::audio(url),
            Media::Video(url) => OutboundContent::Video { url },
            Media::Location(loc) => OutboundContent::Location {
                latitude: loc.latitude,
                longitude: loc.longitude,
            },
        }));

        let mut failures = Vec::new();
        for content in contents {
            let kind = content.kind();
            match socket.send(jid, content).await {
                Ok(Some(sent)) => {
                    self.session
                        .save_message(&sent.peer, &sent.id, &sent.content)
                        .await;
                }
                Ok(None) => {}
                Err(e) => failures.push(format!("{kind}: {e}")),
            }
        }

        if failures.is_empty() {
            DeliveryOutcome::Sent
        } else {
            DeliveryOutcome::Error(failures.join("; "))
        }
    }

    /// Log the account out and wipe the session.
    ///
    /// The relay ends `Terminated`; only [`Self::reset_login`] allows a new
    /// connection.
    ///
    /// # Errors
    /// Returns error if the session could not be fully cleared. A failed
    /// server-side logout is logged and does not stop the clear.
    pub async fn logout(&self) -> Result<(), RelayError> {
        self.set_state(ConnectionState::Terminated);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let socket = self.socket.write().await.take();
        if let Some(socket) = socket {
            if let Err(e) = socket.logout().await {
                tracing::warn!("Server-side logout failed: {e}");
            }
        }
        self.auth.write().await.take();
        let _gate = self.clear_gate.write().await;
        let removed = self.session.clear_session().await?;
        tracing::info!(session = %self.session.session_id(), removed, "Logged out and cleared session");
        Ok(())
    }

    /// Clear the stored session so the next [`Self::connect`] starts a fresh
    /// login.
    ///
    /// # Errors
    /// Returns error if the session could not be fully cleared.
    pub async fn reset_login(&self) -> Result<(), RelayError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.socket.write().await.take();
        self.auth.write().await.take();
        {
            let _gate = self.clear_gate.write().await;
            self.session.clear_session().await?;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(session = %self.session.session_id(), "Login reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use chatbridge_core::{KeyValueStore, MessageContent, MessageKey, SessionId, Value};
    use chatbridge_session::storage::MemoryStore;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{bus::MemoryBus, notify::NoopNotifier, socket::SentMessage};

    const CHANNEL: &str = "relay_test";

    #[derive(Default)]
    struct ScriptedSocket {
        failing: HashSet<String>,
        sent: Mutex<Vec<(String, OutboundContent)>>,
        logged_out: AtomicBool,
    }

    impl ScriptedSocket {
        fn sent(&self) -> Vec<(String, OutboundContent)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProtocolSocket for ScriptedSocket {
        async fn send(&self, jid: &str, content: OutboundContent) -> Result<Option<SentMessage>, SendError> {
            if self.failing.contains(jid) {
                return Err(SendError::Rejected(jid.to_string()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((jid.to_string(), content.clone()));
            Ok(Some(SentMessage {
                peer: jid.to_string(),
                id: format!("OUT{}", sent.len()),
                content: Value::from(content.kind()),
            }))
        }

        async fn logout(&self) -> Result<(), ProtocolError> {
            self.logged_out.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedConnector {
        socket: Arc<ScriptedSocket>,
        connects: AtomicUsize,
        events: Mutex<Option<mpsc::UnboundedSender<RelayEvent>>>,
    }

    impl ScriptedConnector {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                socket: Arc::new(ScriptedSocket {
                    failing: failing.iter().map(ToString::to_string).collect(),
                    ..ScriptedSocket::default()
                }),
                connects: AtomicUsize::new(0),
                events: Mutex::new(None),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn emit(&self, event: RelayEvent) {
            let events = self.events.lock().unwrap();
            events.as_ref().unwrap().send(event).unwrap();
        }
    }

    #[async_trait]
    impl ProtocolConnector for ScriptedConnector {
        async fn connect(
            &self,
            _auth: AuthState,
            events: mpsc::UnboundedSender<RelayEvent>,
        ) -> Result<Arc<dyn ProtocolSocket>, ProtocolError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.events.lock().unwrap() = Some(events);
            Ok(Arc::clone(&self.socket) as Arc<dyn ProtocolSocket>)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        reports: Mutex<Vec<DeliveryReport>>,
    }

    #[async_trait]
    impl DeliveryNotifier for RecordingNotifier {
        async fn notify(&self, report: &DeliveryReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    struct Harness {
        relay: Arc<MessageRelay>,
        events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
        connector: Arc<ScriptedConnector>,
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn harness(failing: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let connector = ScriptedConnector::new(failing);
        let session = SessionStateStore::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            SessionId::new("main").unwrap(),
        );
        let (relay, events) = MessageRelay::new(
            session,
            Arc::clone(&connector) as Arc<dyn ProtocolConnector>,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Arc::clone(&notifier) as Arc<dyn DeliveryNotifier>,
            RelayOptions {
                channel: CHANNEL.to_string(),
                reconnect_delay: Duration::from_millis(1),
            },
        );
        assert_ok!(relay.connect().await);
        relay.dispatch(RelayEvent::ConnectionOpen).await;
        Harness {
            relay,
            events: Some(events),
            connector,
            store,
            bus,
            notifier,
        }
    }

    fn inbound(jid: &str, from_me: bool, text: &str) -> InboundMessage {
        InboundMessage {
            key: MessageKey {
                remote_jid: Some(jid.to_string()),
                from_me,
                id: "IN1".to_string(),
                participant: None,
            },
            push_name: Some("Ana".to_string()),
            content: MessageContent {
                conversation: Some(text.to_string()),
                ..MessageContent::default()
            },
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_open() {
        let h = harness(&[]).await;
        assert!(h.relay.is_connected());
        assert_eq!(h.connector.connects(), 1);

        let raw = h.store.get("chatbridge:sessions:main").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["status"], "open");
    }

    #[tokio::test]
    async fn test_first_peer_failure_does_not_block_second() {
        let h = harness(&["15550001@s.whatsapp.net"]).await;
        let deliveries = h
            .relay
            .handle_bus_payload(r#"{"transmitter":"external","phone":["15550001","15550002"],"message":"hi"}"#)
            .await
            .unwrap();

        assert_eq!(deliveries.len(), 2);
        assert!(matches!(deliveries[0].outcome, DeliveryOutcome::Error(_)));
        assert_eq!(deliveries[1].outcome, DeliveryOutcome::Sent);
        assert_eq!(deliveries[1].jid.as_deref(), Some("15550002@s.whatsapp.net"));
        assert_eq!(
            h.connector.socket.sent(),
            vec![(
                "15550002@s.whatsapp.net".to_string(),
                OutboundContent::Text("hi".to_string())
            )]
        );
        assert!(h.notifier.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_then_media_in_order_and_cached() {
        let h = harness(&[]).await;
        let raw = concat!(
            r#"{"transmitter":"N8N","phone":"+57 300 123","message":"hola","#,
            r#""send":{"video":"http://v","audio":"http://a","location":{"latitude":4.6,"longitude":-74.0}}}"#
        );
        let deliveries = h.relay.handle_bus_payload(raw).await.unwrap();
        assert_eq!(deliveries[0].outcome, DeliveryOutcome::Sent);

        let kinds: Vec<&str> = h.connector.socket.sent().iter().map(|(_, c)| c.kind()).collect();
        assert_eq!(kinds, vec!["text", "audio", "video", "location"]);
        assert_eq!(h.connector.socket.sent()[1].1, OutboundContent::audio("http://a"));

        let cached = h
            .relay
            .session
            .get_message("57300123@s.whatsapp.net", "OUT1")
            .await;
        assert_eq!(cached, Some(Value::from("text")));
    }

    #[tokio::test]
    async fn test_notifies_once_per_peer() {
        let h = harness(&["15550001@s.whatsapp.net"]).await;
        let raw = r#"{"transmitter":"external","phone":[15550001,"15550002","none"],"message":"hi","verification":{"id":"s-1"}}"#;
        let deliveries = h.relay.handle_bus_payload(raw).await.unwrap();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries[2].jid, None);

        let reports = h.notifier.reports.lock().unwrap().clone();
        let summary: Vec<(&str, &str)> = reports
            .iter()
            .map(|r| (r.phone.as_str(), r.survey_sent.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("15550001", "ERROR"), ("15550002", "SI"), ("none", "ERROR")]
        );
        assert!(reports[0].observation.as_deref().unwrap().contains("Peer rejected"));
        assert!(reports.iter().all(|r| r.survey_id == PeerRef::from("s-1")));
    }

    #[tokio::test]
    async fn test_empty_list_entry_is_reported_as_failed() {
        let h = harness(&[]).await;
        let raw = r#"{"transmitter":"external","phone":["","15550002"],"message":"hi","verification":{"id":3}}"#;
        let deliveries = h.relay.handle_bus_payload(raw).await.unwrap();
        assert_eq!(
            deliveries[0].outcome,
            DeliveryOutcome::Error("peer has no digits".to_string())
        );
        assert!(deliveries[1].outcome.is_sent());

        let reports = h.notifier.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].phone, "");
        assert_eq!(reports[0].survey_sent, "ERROR");
        assert_eq!(reports[0].observation.as_deref(), Some("peer has no digits"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_envelopes() {
        let h = harness(&[]).await;
        assert!(matches!(
            h.relay.handle_bus_payload(r#"{"transmitter":"external","phone":"1","mess"#).await,
            Err(RelayError::MalformedPayload(_))
        ));
        assert!(matches!(
            h.relay
                .handle_bus_payload(r#"{"transmitter":"protocol","phone":"1","message":"x"}"#)
                .await,
            Err(RelayError::NotExternal)
        ));
        assert!(matches!(
            h.relay
                .handle_bus_payload(r#"{"transmitter":"external","phone":[],"message":"x"}"#)
                .await,
            Err(RelayError::Rejected(_))
        ));
        assert!(matches!(
            h.relay
                .handle_bus_payload(r#"{"transmitter":"external","phone":"1","message":""}"#)
                .await,
            Err(RelayError::Rejected(_))
        ));
        assert!(h.connector.socket.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_stop_listener() {
        let mut h = harness(&[]).await;
        let events = h.events.take().unwrap();
        tokio::spawn(Arc::clone(&h.relay).run(events));
        let _listener = h.relay.spawn_bus_listener().await.unwrap();

        h.bus.publish(CHANNEL, r#"{"transmitter":"external","phone":"#).await.unwrap();
        h.bus
            .publish(CHANNEL, r#"{"transmitter":"external","phone":"15550009","message":"after"}"#)
            .await
            .unwrap();

        let socket = Arc::clone(&h.connector.socket);
        wait_for(|| !socket.sent().is_empty()).await;
        assert_eq!(socket.sent()[0].0, "15550009@s.whatsapp.net");
    }

    #[tokio::test]
    async fn test_inbound_is_filtered_normalized_and_published() {
        let h = harness(&[]).await;
        let mut sub = h.bus.subscribe(CHANNEL).await.unwrap();

        h.relay
            .dispatch(RelayEvent::MessageReceived(inbound("15550001@s.whatsapp.net", true, "mine")))
            .await;
        h.relay
            .dispatch(RelayEvent::MessageReceived(inbound("15550002:4@s.whatsapp.net", false, "hola")))
            .await;

        let payload = sub.next().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["transmitter"], "protocol");
        assert_eq!(json["phone"], "15550002");
        assert_eq!(json["message"], "hola");

        let recent = h.relay.recent_messages();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].phone, "15550002");
        assert_eq!(recent[0].name, "Ana");
    }

    #[tokio::test]
    async fn test_recent_ring_is_bounded() {
        let h = harness(&[]).await;
        for n in 0..25 {
            h.relay
                .dispatch(RelayEvent::MessageReceived(inbound(
                    &format!("1555{n:04}@s.whatsapp.net"),
                    false,
                    &format!("m{n}"),
                )))
                .await;
        }
        let recent = h.relay.recent_messages();
        assert_eq!(recent.len(), chatbridge_core::msg_store::RECENT_LIMIT);
        assert_eq!(recent[0].message, "m24");

        let mut feed = h.relay.recent_feed();
        assert_eq!(feed.next().await.unwrap().message, "m5");
    }

    #[tokio::test]
    async fn test_logged_out_close_does_not_reconnect() {
        let h = harness(&[]).await;
        h.relay
            .dispatch(RelayEvent::ConnectionClosed(DisconnectReason::from_status_code(401)))
            .await;

        assert_eq!(h.relay.state(), ConnectionState::Terminated);
        assert_eq!(h.connector.connects(), 1);
        assert!(matches!(h.relay.connect().await, Err(RelayError::AuthTerminal)));

        let raw = h.store.get("chatbridge:sessions:main").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["status"], "closed");
    }

    #[tokio::test]
    async fn test_transient_close_reconnects() {
        let h = harness(&[]).await;
        for code in [408, 428, 515, 503] {
            h.relay
                .dispatch(RelayEvent::ConnectionClosed(DisconnectReason::from_status_code(code)))
                .await;
        }
        assert_eq!(h.connector.connects(), 5);
        assert_eq!(h.relay.state(), ConnectionState::Connecting);

        h.relay.dispatch(RelayEvent::ConnectionOpen).await;
        assert!(h.relay.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_retries_until_store_returns() {
        let h = harness(&[]).await;
        h.store.set_available(false);
        let relay = Arc::clone(&h.relay);
        let task = tokio::spawn(async move {
            relay
                .dispatch(RelayEvent::ConnectionClosed(DisconnectReason::ConnectionLost))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.connects(), 1);
        h.store.set_available(true);
        assert_ok!(task.await);
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_creds_update_persists_via_event_queue() {
        let mut h = harness(&[]).await;
        let events = h.events.take().unwrap();
        tokio::spawn(Arc::clone(&h.relay).run(events));

        let (_, auth) = h.relay.auth.read().await.clone().unwrap();
        auth.creds.write().await.insert("registrationId", 7_i64);
        h.connector.emit(RelayEvent::CredsUpdated);

        let session = h.relay.session.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let reloaded = session.initialize().await.unwrap();
                if reloaded.creds.read().await.get("registrationId").is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_logout_terminates_and_clears() {
        let h = harness(&[]).await;
        assert_ok!(h.relay.logout().await);

        assert_eq!(h.relay.state(), ConnectionState::Terminated);
        assert!(h.connector.socket.logged_out.load(Ordering::SeqCst));
        assert!(h.store.get("chatbridge:creds:main").await.unwrap().is_none());
        assert!(h.store.get("chatbridge:sessions:main").await.unwrap().is_none());

        // the server's close after logout must not resurrect the session
        h.relay
            .dispatch(RelayEvent::ConnectionClosed(DisconnectReason::ConnectionClosed))
            .await;
        assert_eq!(h.connector.connects(), 1);
        assert_err!(h.relay.connect().await);

        assert_ok!(h.relay.reset_login().await);
        assert_eq!(h.relay.state(), ConnectionState::Disconnected);
        assert_ok!(h.relay.connect().await);
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_logout_propagates_clear_failure() {
        let h = harness(&[]).await;
        h.store.fail_keys_containing("creds:main");
        assert!(matches!(h.relay.logout().await, Err(RelayError::Session(_))));
    }

    struct GatedConnector {
        inner: Arc<ScriptedConnector>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ProtocolConnector for GatedConnector {
        async fn connect(
            &self,
            auth: AuthState,
            events: mpsc::UnboundedSender<RelayEvent>,
        ) -> Result<Arc<dyn ProtocolSocket>, ProtocolError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.connect(auth, events).await
        }
    }

    fn gated_relay(store: &Arc<MemoryStore>) -> (Arc<MessageRelay>, Arc<GatedConnector>) {
        let gated = Arc::new(GatedConnector {
            inner: ScriptedConnector::new(&[]),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (relay, _events) = MessageRelay::new(
            SessionStateStore::new(
                Arc::clone(store) as Arc<dyn KeyValueStore>,
                SessionId::new("main").unwrap(),
            ),
            Arc::clone(&gated) as Arc<dyn ProtocolConnector>,
            Arc::new(MemoryBus::new()),
            Arc::new(NoopNotifier),
            RelayOptions {
                channel: CHANNEL.to_string(),
                reconnect_delay: Duration::from_millis(1),
            },
        );
        (relay, gated)
    }

    #[tokio::test]
    async fn test_logout_during_connect_discards_new_connection() {
        let store = Arc::new(MemoryStore::new());
        let (relay, gated) = gated_relay(&store);

        let connecting = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.connect().await })
        };
        gated.entered.notified().await;
        assert_ok!(relay.logout().await);
        gated.release.notify_one();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(RelayError::AuthTerminal)));
        assert_eq!(relay.state(), ConnectionState::Terminated);
        assert!(relay.socket.read().await.is_none());
        assert!(gated.inner.socket.logged_out.load(Ordering::SeqCst));

        relay.dispatch(RelayEvent::CredsUpdated).await;
        assert!(store.get("chatbridge:creds:main").await.unwrap().is_none());
        assert!(store.get("chatbridge:sessions:main").await.unwrap().is_none());

        let deliveries = relay
            .handle_bus_payload(r#"{"transmitter":"external","phone":"1555","message":"x"}"#)
            .await
            .unwrap();
        assert!(!deliveries[0].outcome.is_sent());
        assert!(gated.inner.socket.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reset_during_connect_supersedes_attempt() {
        let store = Arc::new(MemoryStore::new());
        let (relay, gated) = gated_relay(&store);

        let connecting = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.connect().await })
        };
        gated.entered.notified().await;
        assert_ok!(relay.reset_login().await);
        gated.release.notify_one();

        assert!(matches!(connecting.await.unwrap(), Err(RelayError::Superseded)));
        assert!(relay.auth.read().await.is_none());
        assert_eq!(relay.state(), ConnectionState::Disconnected);

        gated.release.notify_one();
        assert_ok!(relay.connect().await);
        assert!(relay.socket.read().await.is_some());
    }

    #[tokio::test]
    async fn test_pending_creds_save_does_not_outlive_logout() {
        let h = harness(&[]).await;
        let (_, auth) = h.relay.auth.read().await.clone().unwrap();
        auth.creds.write().await.insert("registrationId", 9_i64);

        let gate = h.relay.clear_gate.write().await;
        let saving = {
            let relay = Arc::clone(&h.relay);
            tokio::spawn(async move { relay.dispatch(RelayEvent::CredsUpdated).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let logging_out = {
            let relay = Arc::clone(&h.relay);
            tokio::spawn(async move { relay.logout().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(gate);

        assert_ok!(saving.await);
        assert_ok!(logging_out.await.unwrap());
        assert!(h.store.get("chatbridge:creds:main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_records_error() {
        let store = Arc::new(MemoryStore::new());
        let (relay, _events) = MessageRelay::new(
            SessionStateStore::new(store as Arc<dyn KeyValueStore>, SessionId::default()),
            ScriptedConnector::new(&[]) as Arc<dyn ProtocolConnector>,
            Arc::new(MemoryBus::new()),
            Arc::new(NoopNotifier),
            RelayOptions::default(),
        );
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        let deliveries = relay
            .handle_bus_payload(r#"{"transmitter":"external","phone":"1","message":"x"}"#)
            .await
            .unwrap();
        assert_eq!(deliveries[0].outcome, DeliveryOutcome::Error("Not connected".to_string()));
    }
}

//! One websocket connection to the relay, bound to one device key.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::envelope::{ActionFilter, Envelope, InboundMessage};
use crate::error::{ChannelError, EnvelopeError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
    TornDown,
}

/// What a [`Subscription`] observes, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(InboundMessage),
    /// An inbound frame was dropped because it could not be parsed.
    Malformed(EnvelopeError),
    /// The transport failed or the relay hung up. Terminal.
    Error(ChannelError),
    /// The session was closed locally. Terminal.
    Closed,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Error(_) | SessionEvent::Closed)
    }
}

/// Anything that can carry outbound envelopes for one device.
pub trait EnvelopeSink: Send + Sync {
    fn device_key(&self) -> &str;
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

enum Outbound {
    Frame(String),
    Ping,
    Close,
}

struct Subscriber {
    id: u64,
    filter: ActionFilter,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

pub struct ChannelSession {
    device_key: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Mutex<RegistrationState>,
    closed: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    terminal: Mutex<Option<SessionEvent>>,
    next_subscriber: AtomicU64,
    malformed: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelSession {
    /// Connects to the relay and registers as a viewer of `device_key`.
    ///
    /// The registration frame is written before the reader starts, so no
    /// inbound envelope is ever attributed to an unregistered session.
    pub async fn open(config: &ChannelConfig, device_key: &str) -> Result<Arc<Self>, ChannelError> {
        if device_key.trim().is_empty() {
            return Err(ChannelError::Setup("device key must not be empty".into()));
        }
        let url = config.endpoint_for(device_key);
        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::Timeout(config.connect_timeout))?
            .map_err(|err| ChannelError::Setup(format!("websocket connect failed: {err}")))?;
        debug!(target = "relay", url = %url, device = %device_key, "relay websocket connected");

        let (mut write, read) = ws.split();
        let register = Envelope::register(device_key)
            .to_text()
            .map_err(|err| ChannelError::Setup(err.to_string()))?;
        write
            .send(Message::Text(register))
            .await
            .map_err(|err| ChannelError::Transport(format!("registration failed: {err}")))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self::new(device_key, outbound));
        *session.state.lock() = RegistrationState::Registered;
        info!(target = "relay", device = %device_key, "registered as frontend viewer");

        let writer = tokio::spawn(write_loop(write, outbound_rx));
        let reader = tokio::spawn(read_loop(Arc::downgrade(&session), read));
        let mut tasks = vec![writer, reader];
        if let Some(period) = config.keepalive {
            tasks.push(tokio::spawn(keepalive_loop(session.outbound.clone(), period)));
        }
        session.tasks.lock().extend(tasks);
        Ok(session)
    }

    fn new(device_key: &str, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            device_key: device_key.to_string(),
            outbound,
            state: Mutex::new(RegistrationState::Unregistered),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            terminal: Mutex::new(None),
            next_subscriber: AtomicU64::new(1),
            malformed: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of inbound frames dropped as unparsable.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Registers interest in inbound messages matching `filter`.
    ///
    /// Subscribing to a session that already ended yields its terminal
    /// event immediately.
    pub fn subscribe(self: &Arc<Self>, filter: ActionFilter) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let terminal = self.terminal.lock();
            if let Some(event) = terminal.as_ref() {
                let _ = tx.send(event.clone());
            } else {
                self.subscribers.lock().push(Subscriber { id, filter, tx });
            }
        }
        Subscription {
            id,
            rx,
            session: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|sub| sub.id != id);
    }

    /// Closes the connection. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = RegistrationState::TornDown;
        let _ = self.outbound.send(Outbound::Close);
        self.stop_background_tasks();
        debug!(target = "relay", device = %self.device_key, "relay channel closed");
        self.finish(SessionEvent::Closed);
    }

    fn fail(&self, error: ChannelError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = RegistrationState::TornDown;
        let _ = self.outbound.send(Outbound::Close);
        self.stop_background_tasks();
        warn!(target = "relay", device = %self.device_key, error = %error, "relay channel lost");
        self.finish(SessionEvent::Error(error));
    }

    // The writer is left running so it can flush the close frame; it exits
    // once it has, or when the last sender goes away.
    fn stop_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        for handle in tasks.drain(..).skip(1) {
            handle.abort();
        }
    }

    fn finish(&self, event: SessionEvent) {
        let mut terminal = self.terminal.lock();
        *terminal = Some(event.clone());
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        drop(terminal);
        for sub in subscribers {
            let _ = sub.tx.send(event.clone());
        }
    }

    fn handle_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.dispatch(envelope),
            Err(err) => self.report_malformed(err),
        }
    }

    fn handle_bytes(&self, data: &[u8]) {
        match Envelope::parse_bytes(data) {
            Ok(envelope) => self.dispatch(envelope),
            Err(err) => self.report_malformed(err),
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        if self.is_closed() {
            return;
        }
        if !envelope.device_key.is_empty() && envelope.device_key != self.device_key {
            warn!(
                target = "relay",
                device = %self.device_key,
                foreign = %envelope.device_key,
                action = %envelope.action,
                "dropping envelope addressed to another device"
            );
            return;
        }
        let message = match envelope.classify() {
            Ok(message) => message,
            Err(err) => return self.report_malformed(err),
        };
        if let InboundMessage::Unknown { action, .. } = &message {
            debug!(target = "relay", device = %self.device_key, action = %action, "unknown action");
        }
        self.deliver(&message);
    }

    fn deliver(&self, message: &InboundMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter().filter(|sub| sub.filter.matches(message)) {
            let _ = sub.tx.send(SessionEvent::Message(message.clone()));
        }
    }

    fn report_malformed(&self, error: EnvelopeError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(target = "relay", device = %self.device_key, error = %error, "dropping malformed envelope");
        let subscribers = self.subscribers.lock();
        for sub in subscribers
            .iter()
            .filter(|sub| matches!(sub.filter, ActionFilter::All | ActionFilter::Unknown))
        {
            let _ = sub.tx.send(SessionEvent::Malformed(error.clone()));
        }
    }
}

impl EnvelopeSink for ChannelSession {
    fn device_key(&self) -> &str {
        &self.device_key
    }

    /// Queues an envelope. An empty `device_key` is stamped with this
    /// session's key; a different key is refused.
    fn send(&self, mut envelope: Envelope) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        if envelope.device_key.is_empty() {
            envelope.device_key = self.device_key.clone();
        } else if envelope.device_key != self.device_key {
            return Err(ChannelError::DeviceMismatch {
                channel: self.device_key.clone(),
                envelope: envelope.device_key,
            });
        }
        let text = envelope
            .to_text()
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        trace!(target = "relay", action = %envelope.action, len = text.len(), "ws_out");
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| ChannelError::ChannelClosed)
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ordered inbound events for one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: Weak<ChannelSession>,
}

impl Subscription {
    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.unsubscribe(self.id);
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            Outbound::Frame(text) => sink.send(Message::Text(text)).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        };
        if let Err(err) = result {
            debug!(target = "relay", error = %err, "relay writer stopped");
            break;
        }
    }
}

async fn read_loop(session: Weak<ChannelSession>, mut stream: SplitStream<WsStream>) {
    let error = loop {
        let Some(frame) = stream.next().await else {
            break ChannelError::Transport("connection dropped without close frame".into());
        };
        let Some(live) = session.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => {
                trace!(target = "relay", event = "ws_in", kind = "text", len = text.len());
                live.handle_text(&text);
            }
            Ok(Message::Binary(data)) => {
                trace!(target = "relay", event = "ws_in", kind = "binary", len = data.len());
                live.handle_bytes(&data);
            }
            Ok(Message::Close(frame)) => {
                break ChannelError::ClosedByRelay {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                };
            }
            Ok(_) => {}
            Err(err) => break classify_ws_error(err),
        }
    };
    if let Some(live) = session.upgrade() {
        live.fail(error);
    }
}

async fn keepalive_loop(outbound: mpsc::UnboundedSender<Outbound>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if outbound.send(Outbound::Ping).is_err() {
            break;
        }
    }
}

fn classify_ws_error(err: WsError) -> ChannelError {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            ChannelError::Transport("connection reset".into())
        }
        other => ChannelError::Transport(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::envelope::Action;
    use serde_json::{json, Value};

    /// A registered session with no socket behind it; outbound frames land
    /// in the returned receiver.
    pub(crate) fn detached(device_key: &str) -> (Arc<ChannelSession>, mpsc::UnboundedReceiver<String>) {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(ChannelSession::new(device_key, outbound));
        *session.state.lock() = RegistrationState::Registered;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                if let Outbound::Frame(text) = command {
                    if frames_tx.send(text).is_err() {
                        break;
                    }
                }
            }
        });
        (session, frames_rx)
    }

    pub(crate) fn inject(session: &ChannelSession, value: Value) {
        session.handle_text(&value.to_string());
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_session_continues() {
        let (session, _frames) = detached("dev1");
        let mut all = session.subscribe(ActionFilter::All);
        let mut audio = session.subscribe(ActionFilter::only(&[Action::AudioStream]));

        session.handle_text("{not json");
        inject(
            &session,
            json!({"action": "audio_stream", "device_key": "dev1", "payload": "AAAA"}),
        );

        assert!(matches!(all.recv().await, Some(SessionEvent::Malformed(_))));
        assert_eq!(
            all.recv().await,
            Some(SessionEvent::Message(InboundMessage::AudioStream("AAAA".into())))
        );
        assert_eq!(
            audio.recv().await,
            Some(SessionEvent::Message(InboundMessage::AudioStream("AAAA".into())))
        );
        assert_eq!(session.malformed_count(), 1);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn envelopes_for_other_devices_are_not_delivered() {
        let (session, _frames) = detached("dev1");
        let mut sub = session.subscribe(ActionFilter::All);
        inject(
            &session,
            json!({"action": "screenshot", "device_key": "dev2", "payload": "AAAA"}),
        );
        inject(&session, json!({"action": "screenshot", "payload": "BBBB"}));
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::Message(InboundMessage::Screenshot("BBBB".into())))
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_closed_once() {
        let (session, _frames) = detached("dev1");
        let mut sub = session.subscribe(ActionFilter::All);
        session.close();
        session.close();
        assert_eq!(session.state(), RegistrationState::TornDown);
        assert_eq!(sub.recv().await, Some(SessionEvent::Closed));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn transport_failure_is_distinct_from_close() {
        let (session, _frames) = detached("dev1");
        let mut sub = session.subscribe(ActionFilter::All);
        session.fail(ChannelError::Transport("reset".into()));
        session.close();
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::Error(ChannelError::Transport("reset".into())))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn late_subscriber_sees_terminal_event() {
        let (session, _frames) = detached("dev1");
        session.close();
        let mut sub = session.subscribe(ActionFilter::All);
        assert_eq!(sub.recv().await, Some(SessionEvent::Closed));
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_close() {
        let (session, _frames) = detached("dev1");
        let mut sub = session.subscribe(ActionFilter::All);
        session.close();
        inject(
            &session,
            json!({"action": "camera_frame", "device_key": "dev1", "payload": "AAAA"}),
        );
        assert_eq!(sub.recv().await, Some(SessionEvent::Closed));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn send_stamps_device_key_and_refuses_foreign_keys() {
        let (session, mut frames) = detached("dev1");
        let envelope = Envelope {
            action: "webrtc_ice".into(),
            device_key: String::new(),
            payload: json!({"candidate": "c"}),
        };
        session.send(envelope).unwrap();
        let sent: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(sent["device_key"], "dev1");

        let foreign = Envelope::register("dev2");
        assert!(matches!(
            session.send(foreign),
            Err(ChannelError::DeviceMismatch { .. })
        ));

        session.close();
        assert_eq!(
            session.send(Envelope::register("dev1")),
            Err(ChannelError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let (session, _frames) = detached("dev1");
        let sub = session.subscribe(ActionFilter::All);
        assert_eq!(session.subscriber_count(), 1);
        drop(sub);
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unknown_actions_reach_drift_subscribers_only() {
        let (session, _frames) = detached("dev1");
        let mut drift = session.subscribe(ActionFilter::Unknown);
        let mut snapshots = session.subscribe(ActionFilter::only(&[Action::Screenshot]));
        inject(&session, json!({"action": "sent_apps", "device_key": "dev1", "payload": []}));
        assert!(matches!(
            drift.recv().await,
            Some(SessionEvent::Message(InboundMessage::Unknown { .. }))
        ));
        assert!(snapshots.try_recv().is_none());
    }
}

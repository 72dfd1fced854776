//! WebRTC answerer driven by `webrtc_offer` / `webrtc_ice` envelopes.
//!
//! The device always offers; the viewer answers on the same relay channel.
//! [`SignalingNegotiator`] owns the negotiation state machine and talks to
//! the media stack only through [`PeerSession`], so the state machine is
//! testable without a real peer connection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::channel::{EnvelopeSink, SessionEvent, Subscription};
use crate::envelope::{Envelope, IceCandidate, InboundMessage, SessionDescription};
use crate::error::NegotiationError;

/// What to do with a remote candidate that arrives before the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    #[default]
    Buffer,
    Discard,
}

impl FromStr for CandidatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffer" => Ok(CandidatePolicy::Buffer),
            "discard" => Ok(CandidatePolicy::Discard),
            other => Err(format!("expected `buffer` or `discard`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationState::HaveRemoteOffer
                | NegotiationState::HaveLocalAnswer
                | NegotiationState::Connected
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the media stack, delivered in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Track(TrackInfo),
    TrackEnded { id: String, packets: u64 },
    Link(LinkState),
}

/// The operations the negotiator needs from a peer connection.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<(), NegotiationError>;
    /// Creates the answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self);
}

/// [`PeerSession`] backed by a `webrtc` peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    pub async fn new(
        ice_servers: &[String],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError> {
        let setup = |err: webrtc::Error| NegotiationError::Setup(err.to_string());

        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(setup)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(target = "signaling", "local ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let info = TrackInfo {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind: match track.kind() {
                            RTPCodecType::Audio => TrackKind::Audio,
                            RTPCodecType::Video => TrackKind::Video,
                            _ => TrackKind::Unknown,
                        },
                    };
                    let _ = tx.send(PeerEvent::Track(info));
                    // Keep reading so receiver reports keep flowing back.
                    tokio::spawn(async move {
                        let mut packets = 0u64;
                        while track.read_rtp().await.is_ok() {
                            packets += 1;
                        }
                        let _ = tx.send(PeerEvent::TrackEnded {
                            id: track.id(),
                            packets,
                        });
                    });
                })
            },
        ));

        let tx = events_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target = "signaling", state = %state, "peer connection state changed");
                let link = match state {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                        LinkState::Connecting
                    }
                    RTCPeerConnectionState::Connected => LinkState::Connected,
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                    _ => return,
                };
                let _ = tx.send(PeerEvent::Link(link));
            })
        }));

        Ok((Arc::new(Self { pc }), events_rx))
    }
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<(), NegotiationError> {
        let description = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::Answer(err.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::Answer(err.to_string()))?;
        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        };
        Ok(SessionDescription::answer(sdp))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::CandidateRejected(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "signaling", error = %err, "peer connection close reported an error");
        }
    }
}

/// What happened to a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
    /// Arrived after the negotiation ended.
    Ignored,
}

/// Progress reported by [`SignalingNegotiator::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    Answered,
    Connected,
    Track(TrackInfo),
    TrackEnded { id: String, packets: u64 },
    Failed(NegotiationError),
    Closed,
}

pub struct SignalingNegotiator {
    device_key: String,
    peer: Arc<dyn PeerSession>,
    sink: Arc<dyn EnvelopeSink>,
    policy: CandidatePolicy,
    state: NegotiationState,
    pending: Vec<IceCandidate>,
    cancel: CancellationToken,
}

impl SignalingNegotiator {
    pub fn new(
        peer: Arc<dyn PeerSession>,
        sink: Arc<dyn EnvelopeSink>,
        policy: CandidatePolicy,
    ) -> Self {
        Self {
            device_key: sink.device_key().to_string(),
            peer,
            sink,
            policy,
            state: NegotiationState::Idle,
            pending: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Cancelling this token stops [`run`](Self::run) and closes the peer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn fail(&mut self, err: NegotiationError) -> NegotiationError {
        warn!(
            target = "signaling",
            device = %self.device_key,
            state = %self.state,
            error = %err,
            "negotiation failed"
        );
        self.state = NegotiationState::Failed;
        self.pending.clear();
        err
    }

    /// Applies a remote offer and answers it on the channel.
    ///
    /// A second offer after the first answer is treated as renegotiation.
    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Err(NegotiationError::InvalidState {
                operation: "apply offer",
                state: self.state.as_str(),
            });
        }
        let was_connected = self.state == NegotiationState::Connected;
        debug!(target = "signaling", device = %self.device_key, sdp_len = offer.sdp.len(), "applying remote offer");

        if let Err(err) = self.peer.set_remote_offer(&offer).await {
            return Err(self.fail(err));
        }
        self.state = NegotiationState::HaveRemoteOffer;

        for candidate in std::mem::take(&mut self.pending) {
            if let Err(err) = self.peer.add_ice_candidate(&candidate).await {
                warn!(target = "signaling", device = %self.device_key, error = %err, "buffered candidate rejected");
            }
        }

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = self.sink.send(Envelope::answer(self.device_key.as_str(), &answer)) {
            return Err(self.fail(err.into()));
        }
        self.state = if was_connected {
            NegotiationState::Connected
        } else {
            NegotiationState::HaveLocalAnswer
        };
        info!(target = "signaling", device = %self.device_key, "sent webrtc answer");
        Ok(())
    }

    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        if self.state.is_terminal() {
            return Ok(CandidateOutcome::Ignored);
        }
        if !self.state.has_remote_description() {
            return match self.policy {
                CandidatePolicy::Buffer => {
                    debug!(target = "signaling", device = %self.device_key, "buffering candidate until offer");
                    self.pending.push(candidate);
                    Ok(CandidateOutcome::Buffered)
                }
                CandidatePolicy::Discard => {
                    warn!(target = "signaling", device = %self.device_key, "discarding candidate received before offer");
                    Err(NegotiationError::PrematureCandidate)
                }
            };
        }
        self.peer.add_ice_candidate(&candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    /// Folds one peer callback into the state machine.
    pub fn handle_peer_event(
        &mut self,
        event: PeerEvent,
    ) -> Result<Option<NegotiationEvent>, NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Ok(None);
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.sink
                    .send(Envelope::ice(self.device_key.as_str(), &candidate))
                    .map_err(NegotiationError::from)?;
                Ok(None)
            }
            PeerEvent::Track(info) => {
                if !self.state.is_terminal() {
                    self.state = NegotiationState::Connected;
                }
                info!(target = "signaling", device = %self.device_key, track = %info.id, kind = ?info.kind, "remote track available");
                Ok(Some(NegotiationEvent::Track(info)))
            }
            PeerEvent::TrackEnded { id, packets } => {
                debug!(target = "signaling", device = %self.device_key, track = %id, packets, "remote track ended");
                Ok(Some(NegotiationEvent::TrackEnded { id, packets }))
            }
            PeerEvent::Link(LinkState::Connected) => {
                let first = self.state != NegotiationState::Connected;
                self.state = NegotiationState::Connected;
                Ok(first.then_some(NegotiationEvent::Connected))
            }
            PeerEvent::Link(LinkState::Failed) => Err(self.fail(NegotiationError::PeerFailed)),
            PeerEvent::Link(_) => Ok(None),
        }
    }

    /// Drives negotiation until the channel ends, the peer fails, or the
    /// cancel token fires. The peer is closed on every exit path.
    pub async fn run(
        mut self,
        mut signals: Subscription,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        events: mpsc::UnboundedSender<NegotiationEvent>,
    ) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = signals.recv() => {
                    let message = match signal {
                        Some(SessionEvent::Message(message)) => message,
                        Some(SessionEvent::Malformed(_)) => continue,
                        Some(SessionEvent::Error(_)) | Some(SessionEvent::Closed) | None => break,
                    };
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.handle_signal(message) => result,
                    };
                    match result {
                        Ok(Some(event)) => {
                            let _ = events.send(event);
                        }
                        Ok(None) => {}
                        Err(err) if err.is_fatal() => {
                            let _ = events.send(NegotiationEvent::Failed(err));
                            break;
                        }
                        Err(err) => {
                            debug!(target = "signaling", device = %self.device_key, error = %err, "non-fatal signaling error");
                        }
                    }
                }
                Some(event) = peer_events.recv() => {
                    match self.handle_peer_event(event) {
                        Ok(Some(event)) => {
                            let _ = events.send(event);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = events.send(NegotiationEvent::Failed(err));
                            break;
                        }
                    }
                }
            }
        }
        self.close().await;
        let _ = events.send(NegotiationEvent::Closed);
    }

    async fn handle_signal(
        &mut self,
        message: InboundMessage,
    ) -> Result<Option<NegotiationEvent>, NegotiationError> {
        match message {
            InboundMessage::Offer(offer) => {
                self.handle_offer(offer).await?;
                Ok(Some(NegotiationEvent::Answered))
            }
            InboundMessage::Ice(candidate) => {
                self.handle_remote_candidate(candidate).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Closes the peer connection. Repeated calls do nothing.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending.clear();
        self.cancel.cancel();
        self.peer.close().await;
        debug!(target = "signaling", device = %self.device_key, "peer connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::{detached, inject};
    use crate::envelope::{Action, ActionFilter};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct FakePeer {
        calls: Mutex<Vec<String>>,
        fail_offer: bool,
        reject_candidates: bool,
    }

    impl FakePeer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PeerSession for FakePeer {
        async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<(), NegotiationError> {
            self.calls.lock().push(format!("offer:{}", offer.sdp));
            if self.fail_offer {
                return Err(NegotiationError::RemoteDescription("bad sdp".into()));
            }
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            self.calls.lock().push("answer".into());
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
            self.calls.lock().push(format!("ice:{}", candidate.candidate));
            if self.reject_candidates {
                return Err(NegotiationError::CandidateRejected("nope".into()));
            }
            Ok(())
        }

        async fn close(&self) {
            self.calls.lock().push("close".into());
        }
    }

    fn candidate(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn buffered_candidates_apply_after_offer_before_answer() {
        let (session, mut frames) = detached("dev1");
        let peer = Arc::new(FakePeer::default());
        let mut negotiator =
            SignalingNegotiator::new(peer.clone(), session.clone(), CandidatePolicy::Buffer);

        let outcome = negotiator.handle_remote_candidate(candidate("c1")).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Buffered);
        assert_eq!(negotiator.pending_candidates(), 1);

        negotiator.handle_offer(SessionDescription::offer("v=0 offer")).await.unwrap();
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalAnswer);
        assert_eq!(peer.calls(), vec!["offer:v=0 offer", "ice:c1", "answer"]);
        assert_eq!(negotiator.pending_candidates(), 0);

        let sent: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(
            sent,
            json!({
                "action": "webrtc_answer",
                "device_key": "dev1",
                "payload": {"sdp": "v=0 answer", "type": "answer"}
            })
        );
    }

    #[tokio::test]
    async fn discard_policy_drops_early_candidates() {
        let (session, _frames) = detached("dev1");
        let peer = Arc::new(FakePeer::default());
        let mut negotiator =
            SignalingNegotiator::new(peer.clone(), session, CandidatePolicy::Discard);

        let err = negotiator.handle_remote_candidate(candidate("c1")).await.unwrap_err();
        assert_eq!(err, NegotiationError::PrematureCandidate);
        assert!(!err.is_fatal());
        negotiator.handle_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(peer.calls(), vec!["offer:o", "answer"]);
    }

    #[tokio::test]
    async fn bad_offer_fails_without_answer() {
        let (session, mut frames) = detached("dev1");
        let peer = Arc::new(FakePeer {
            fail_offer: true,
            ..FakePeer::default()
        });
        let mut negotiator =
            SignalingNegotiator::new(peer.clone(), session.clone(), CandidatePolicy::Buffer);

        let err = negotiator.handle_offer(SessionDescription::offer("junk")).await.unwrap_err();
        assert!(matches!(err, NegotiationError::RemoteDescription(_)));
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(peer.calls(), vec!["offer:junk"]);
        assert!(frames.try_recv().is_err());

        let again = negotiator.handle_offer(SessionDescription::offer("v=0")).await;
        assert!(matches!(again, Err(NegotiationError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn rejected_candidate_does_not_fail_the_connection() {
        let (session, _frames) = detached("dev1");
        let peer = Arc::new(FakePeer {
            reject_candidates: true,
            ..FakePeer::default()
        });
        let mut negotiator = SignalingNegotiator::new(peer, session, CandidatePolicy::Buffer);
        negotiator.handle_offer(SessionDescription::offer("o")).await.unwrap();
        let err = negotiator.handle_remote_candidate(candidate("bad")).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalAnswer);
    }

    #[tokio::test]
    async fn local_candidates_are_sent_as_ice_envelopes() {
        let (session, mut frames) = detached("dev1");
        let mut negotiator = SignalingNegotiator::new(
            Arc::new(FakePeer::default()),
            session,
            CandidatePolicy::Buffer,
        );
        negotiator
            .handle_peer_event(PeerEvent::LocalCandidate(candidate("local")))
            .unwrap();
        let sent: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(sent["action"], "webrtc_ice");
        assert_eq!(sent["payload"]["candidate"], "local");
        assert_eq!(sent["payload"]["sdpMLineIndex"], 0);
    }

    #[tokio::test]
    async fn track_marks_connected_and_failure_is_terminal() {
        let (session, _frames) = detached("dev1");
        let mut negotiator = SignalingNegotiator::new(
            Arc::new(FakePeer::default()),
            session,
            CandidatePolicy::Buffer,
        );
        negotiator.handle_offer(SessionDescription::offer("o")).await.unwrap();
        let track = TrackInfo {
            id: "video0".into(),
            stream_id: "s".into(),
            kind: TrackKind::Video,
        };
        let event = negotiator.handle_peer_event(PeerEvent::Track(track.clone())).unwrap();
        assert_eq!(event, Some(NegotiationEvent::Track(track)));
        assert_eq!(negotiator.state(), NegotiationState::Connected);

        let err = negotiator
            .handle_peer_event(PeerEvent::Link(LinkState::Failed))
            .unwrap_err();
        assert_eq!(err, NegotiationError::PeerFailed);
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _frames) = detached("dev1");
        let peer = Arc::new(FakePeer::default());
        let mut negotiator = SignalingNegotiator::new(peer.clone(), session, CandidatePolicy::Buffer);
        negotiator.close().await;
        negotiator.close().await;
        assert_eq!(peer.calls(), vec!["close"]);
        assert_eq!(
            negotiator.handle_remote_candidate(candidate("late")).await.unwrap(),
            CandidateOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn run_answers_offers_from_the_channel_and_stops_on_cancel() {
        let (session, mut frames) = detached("dev1");
        let peer = Arc::new(FakePeer::default());
        let negotiator =
            SignalingNegotiator::new(peer.clone(), session.clone(), CandidatePolicy::Buffer);
        let cancel = negotiator.cancel_token();
        let signals = session.subscribe(ActionFilter::only(&[Action::WebRtcOffer, Action::WebRtcIce]));
        let (_peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let task = tokio::spawn(negotiator.run(signals, peer_rx, events_tx));

        inject(
            &session,
            json!({"action": "webrtc_ice", "payload": {"candidate": 1, "candidateDescription": "early"}}),
        );
        inject(
            &session,
            json!({"action": "webrtc_offer", "device_key": "dev1", "payload": {"sdp": "v=0", "type": "offer"}}),
        );
        assert_eq!(events.recv().await, Some(NegotiationEvent::Answered));
        let sent: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(sent["action"], "webrtc_answer");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(events.recv().await, Some(NegotiationEvent::Closed));
        assert_eq!(peer.calls(), vec!["offer:v=0", "ice:early", "answer", "close"]);
    }

    #[tokio::test]
    async fn run_stops_when_the_channel_closes() {
        let (session, _frames) = detached("dev1");
        let peer = Arc::new(FakePeer::default());
        let negotiator =
            SignalingNegotiator::new(peer.clone(), session.clone(), CandidatePolicy::Buffer);
        let signals = session.subscribe(ActionFilter::All);
        let (_peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let task = tokio::spawn(negotiator.run(signals, peer_rx, events_tx));

        session.close();
        task.await.unwrap();
        assert_eq!(events.recv().await, Some(NegotiationEvent::Closed));
        assert_eq!(peer.calls(), vec!["close"]);
    }

    #[tokio::test]
    async fn webrtc_peer_answers_a_real_offer() {
        let mut media = MediaEngine::default();
        media.register_default_codecs().unwrap();
        let offerer = APIBuilder::new()
            .with_media_engine(media)
            .build()
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        offerer
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = offerer.create_offer(None).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();

        let (session, mut frames) = detached("dev1");
        let (peer, _events) = WebRtcPeer::new(&[]).await.unwrap();
        let mut negotiator = SignalingNegotiator::new(peer, session, CandidatePolicy::Buffer);
        negotiator
            .handle_offer(SessionDescription::offer(offer.sdp))
            .await
            .unwrap();

        let sent: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(sent["payload"]["type"], "answer");
        let sdp = sent["payload"]["sdp"].as_str().unwrap().to_string();
        assert!(sdp.starts_with("v=0"));
        offerer
            .set_remote_description(RTCSessionDescription::answer(sdp).unwrap())
            .await
            .unwrap();

        negotiator.close().await;
        offerer.close().await.unwrap();
    }
}

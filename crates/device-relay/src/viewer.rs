//! Binds one viewer to one device: a pooled relay channel plus one task per
//! enabled media component.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{
    AudioFrameScheduler, AudioOutput, DeviceOutput, MonotonicClock, ScheduledChunk, WavRecorder,
};
use crate::channel::{SessionEvent, Subscription};
use crate::config::{RelayConfig, DEFAULT_SAMPLE_RATE};
use crate::envelope::{Action, ActionFilter, InboundMessage};
use crate::error::{ChannelError, DecodeError, NegotiationError, RelayError};
use crate::pool::{ChannelPool, PooledChannel};
use crate::signaling::{
    CandidatePolicy, NegotiationEvent, PeerEvent, SignalingNegotiator, TrackInfo, WebRtcPeer,
};
use crate::snapshot::{
    FileSnapshotSink, MediaSnapshot, MediaSnapshotViewer, MemorySink, SnapshotSink, ViewerMode,
};

const EVENT_CAPACITY: usize = 256;
const CLOSED_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where streamed audio is played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTarget {
    /// Keep the schedule, drop the samples.
    Discard,
    /// The default output device.
    Device,
    Wav(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ViewerOptions {
    pub snapshots: Vec<ViewerMode>,
    /// `None` keeps snapshots in memory.
    pub snapshot_dir: Option<PathBuf>,
    pub keep_last_snapshot: bool,
    pub audio: Option<AudioTarget>,
    pub sample_rate: u32,
    pub webrtc: bool,
    pub ice_servers: Vec<String>,
    pub candidate_policy: CandidatePolicy,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            snapshots: Vec::new(),
            snapshot_dir: None,
            keep_last_snapshot: false,
            audio: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            webrtc: false,
            ice_servers: Vec::new(),
            candidate_policy: CandidatePolicy::default(),
        }
    }
}

impl ViewerOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            ice_servers: config.ice_servers.clone(),
            candidate_policy: config.candidate_policy,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Snapshot { device: String, snapshot: MediaSnapshot },
    AudioScheduled { device: String, chunk: ScheduledChunk },
    Track { device: String, track: TrackInfo },
    /// The channel dropped; the component is back to its placeholder.
    Waiting { device: String, mode: ViewerMode },
    StreamingFailed { device: String, error: NegotiationError },
    ChannelLost { device: String, error: ChannelError },
    /// A media message was dropped.
    Decode { device: String, action: Action, error: DecodeError },
    UnknownAction { device: String, action: String },
    Closed { device: String },
}

impl ViewerEvent {
    pub fn device(&self) -> &str {
        match self {
            ViewerEvent::Snapshot { device, .. }
            | ViewerEvent::AudioScheduled { device, .. }
            | ViewerEvent::Track { device, .. }
            | ViewerEvent::Waiting { device, .. }
            | ViewerEvent::StreamingFailed { device, .. }
            | ViewerEvent::ChannelLost { device, .. }
            | ViewerEvent::Decode { device, .. }
            | ViewerEvent::UnknownAction { device, .. }
            | ViewerEvent::Closed { device } => device,
        }
    }
}

pub struct DeviceViewer {
    pool: Arc<ChannelPool>,
    options: ViewerOptions,
    events: mpsc::Sender<ViewerEvent>,
    binding: Option<Binding>,
}

struct Binding {
    device_key: String,
    channel: PooledChannel,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
struct Emitter {
    device: String,
    tx: mpsc::Sender<ViewerEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    // Nothing is reported once the binding is cancelled.
    async fn emit(&self, event: ViewerEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(event) => {}
        }
    }

    async fn next(&self, sub: &mut Subscription) -> Option<SessionEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = sub.recv() => event,
        }
    }
}

impl DeviceViewer {
    pub async fn open(
        pool: Arc<ChannelPool>,
        device_key: &str,
        options: ViewerOptions,
    ) -> Result<(Self, mpsc::Receiver<ViewerEvent>), RelayError> {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let mut viewer = Self {
            pool,
            options,
            events,
            binding: None,
        };
        viewer.bind(device_key).await?;
        Ok((viewer, rx))
    }

    pub fn device_key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.device_key.as_str())
    }

    pub fn is_open(&self) -> bool {
        self.binding.is_some()
    }

    /// Tears the current binding down completely, then binds to `device_key`.
    pub async fn switch_device(&mut self, device_key: &str) -> Result<(), RelayError> {
        if let Some(current) = self.device_key() {
            info!(target = "relay", from = %current, to = %device_key, "switching device");
        }
        self.close().await;
        self.bind(device_key).await
    }

    /// Closes the channel, then the peer connection, then releases
    /// snapshots and stops audio. Does nothing when already closed.
    pub async fn close(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        let Binding {
            device_key,
            channel,
            cancel,
            tasks,
        } = binding;
        drop(channel);
        cancel.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(target = "relay", device = %device_key, "viewer task panicked");
                }
            }
        }
        debug!(target = "relay", device = %device_key, "viewer closed");
        let notice = self.events.send(ViewerEvent::Closed { device: device_key });
        match tokio::time::timeout(CLOSED_NOTICE_TIMEOUT, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(target = "relay", "event receiver gone, closed event dropped"),
            Err(_) => warn!(target = "relay", "event queue full, closed event dropped"),
        }
    }

    async fn bind(&mut self, device_key: &str) -> Result<(), RelayError> {
        let channel = self.pool.acquire(device_key).await?;
        let cancel = CancellationToken::new();
        let emitter = Emitter {
            device: device_key.to_string(),
            tx: self.events.clone(),
            cancel: cancel.clone(),
        };
        let options = &self.options;
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(monitor_task(
            emitter.clone(),
            channel.subscribe(ActionFilter::Unknown),
        )));

        for mode in &options.snapshots {
            let viewer = MediaSnapshotViewer::new(*mode, snapshot_sink(options));
            let sub = channel.subscribe(ActionFilter::only(&[mode.action()]));
            tasks.push(tokio::spawn(snapshot_task(emitter.clone(), sub, viewer)));
        }

        if let Some(target) = &options.audio {
            let output: Box<dyn AudioOutput> = match target {
                AudioTarget::Discard => Box::new(MonotonicClock::new()),
                AudioTarget::Device => match DeviceOutput::open(options.sample_rate) {
                    Ok(output) => Box::new(output),
                    Err(err) => {
                        warn!(target = "audio", device = %device_key, error = %err, "playback unavailable, audio will be discarded");
                        Box::new(MonotonicClock::new())
                    }
                },
                AudioTarget::Wav(path) => Box::new(WavRecorder::new(
                    MonotonicClock::new(),
                    path.clone(),
                    options.sample_rate,
                )),
            };
            let scheduler = AudioFrameScheduler::new(output, options.sample_rate);
            let sub = channel.subscribe(ActionFilter::only(&[Action::AudioStream]));
            tasks.push(tokio::spawn(audio_task(emitter.clone(), sub, scheduler)));
        }

        if options.webrtc {
            // Subscribed first: a shared channel may already be carrying the offer.
            let sub = channel.subscribe(ActionFilter::only(&[Action::WebRtcOffer, Action::WebRtcIce]));
            match WebRtcPeer::new(&options.ice_servers).await {
                Ok((peer, peer_events)) => {
                    let negotiator = SignalingNegotiator::new(
                        peer,
                        channel.session().clone(),
                        options.candidate_policy,
                    );
                    tasks.push(tokio::spawn(webrtc_task(
                        emitter.clone(),
                        negotiator,
                        sub,
                        peer_events,
                    )));
                }
                Err(error) => {
                    warn!(target = "signaling", device = %device_key, error = %error, "could not create peer connection");
                    emitter.emit(ViewerEvent::StreamingFailed {
                        device: device_key.to_string(),
                        error,
                    })
                    .await;
                }
            }
        }

        info!(target = "relay", device = %device_key, components = tasks.len(), "viewer bound");
        self.binding = Some(Binding {
            device_key: device_key.to_string(),
            channel,
            cancel,
            tasks,
        });
        Ok(())
    }
}

impl Drop for DeviceViewer {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.cancel.cancel();
        }
    }
}

fn snapshot_sink(options: &ViewerOptions) -> Box<dyn SnapshotSink> {
    let Some(dir) = &options.snapshot_dir else {
        return Box::new(MemorySink);
    };
    match FileSnapshotSink::new(dir.clone()) {
        Ok(sink) => Box::new(sink.keep_last(options.keep_last_snapshot)),
        Err(err) => {
            warn!(target = "snapshot", dir = %dir.display(), error = %err, "snapshot directory unavailable, keeping snapshots in memory");
            Box::new(MemorySink)
        }
    }
}

async fn monitor_task(emitter: Emitter, mut sub: Subscription) {
    while let Some(event) = emitter.next(&mut sub).await {
        match event {
            SessionEvent::Message(InboundMessage::Unknown { action, .. }) => {
                emitter
                    .emit(ViewerEvent::UnknownAction {
                        device: emitter.device.clone(),
                        action,
                    })
                    .await;
            }
            SessionEvent::Message(_) | SessionEvent::Malformed(_) => {}
            SessionEvent::Error(error) => {
                emitter
                    .emit(ViewerEvent::ChannelLost {
                        device: emitter.device.clone(),
                        error,
                    })
                    .await;
                break;
            }
            SessionEvent::Closed => break,
        }
    }
}

async fn snapshot_task(emitter: Emitter, mut sub: Subscription, mut viewer: MediaSnapshotViewer) {
    while let Some(event) = emitter.next(&mut sub).await {
        match event {
            SessionEvent::Message(message) => match viewer.handle(&message) {
                Ok(Some(snapshot)) => {
                    let event = ViewerEvent::Snapshot {
                        device: emitter.device.clone(),
                        snapshot: snapshot.clone(),
                    };
                    emitter.emit(event).await;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(target = "snapshot", device = %emitter.device, error = %error, "dropping undecodable snapshot");
                    emitter
                        .emit(ViewerEvent::Decode {
                            device: emitter.device.clone(),
                            action: viewer.mode().action(),
                            error,
                        })
                        .await;
                }
            },
            SessionEvent::Malformed(_) => {}
            SessionEvent::Error(_) => {
                viewer.clear();
                emitter
                    .emit(ViewerEvent::Waiting {
                        device: emitter.device.clone(),
                        mode: viewer.mode(),
                    })
                    .await;
                break;
            }
            SessionEvent::Closed => break,
        }
    }
    viewer.close();
}

async fn audio_task<O: AudioOutput>(
    emitter: Emitter,
    mut sub: Subscription,
    mut scheduler: AudioFrameScheduler<O>,
) {
    while let Some(event) = emitter.next(&mut sub).await {
        let payload = match event {
            SessionEvent::Message(InboundMessage::AudioStream(payload)) => payload,
            SessionEvent::Message(_) | SessionEvent::Malformed(_) => continue,
            SessionEvent::Error(_) | SessionEvent::Closed => break,
        };
        match scheduler.push_chunk(&payload) {
            Ok(Some(chunk)) => {
                emitter
                    .emit(ViewerEvent::AudioScheduled {
                        device: emitter.device.clone(),
                        chunk,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(error) => {
                debug!(target = "audio", device = %emitter.device, error = %error, "dropping audio chunk");
                emitter
                    .emit(ViewerEvent::Decode {
                        device: emitter.device.clone(),
                        action: Action::AudioStream,
                        error,
                    })
                    .await;
            }
        }
    }
    scheduler.close();
}

async fn webrtc_task(
    emitter: Emitter,
    negotiator: SignalingNegotiator,
    sub: Subscription,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    let (negotiation_tx, mut negotiation) = mpsc::unbounded_channel();
    let stop = negotiator.cancel_token();
    let run = tokio::spawn(negotiator.run(sub, peer_events, negotiation_tx));
    loop {
        let event = tokio::select! {
            biased;
            _ = emitter.cancel.cancelled() => break,
            event = negotiation.recv() => event,
        };
        match event {
            Some(NegotiationEvent::Track(track)) => {
                emitter
                    .emit(ViewerEvent::Track {
                        device: emitter.device.clone(),
                        track,
                    })
                    .await;
            }
            Some(NegotiationEvent::Failed(error)) => {
                emitter
                    .emit(ViewerEvent::StreamingFailed {
                        device: emitter.device.clone(),
                        error,
                    })
                    .await;
            }
            Some(NegotiationEvent::Closed) | None => break,
            Some(other) => {
                debug!(target = "signaling", device = %emitter.device, event = ?other, "negotiation progress");
            }
        }
    }
    stop.cancel();
    if run.await.is_err() {
        warn!(target = "signaling", device = %emitter.device, "negotiation task ended abnormally");
    }
}

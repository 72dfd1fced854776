//! Viewer side of the device relay: one websocket channel per device, the
//! WebRTC answerer that rides on it, and the audio and snapshot consumers
//! for the media the device streams back.

pub mod audio;
pub mod channel;
pub mod commands;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod signaling;
pub mod snapshot;
pub mod viewer;

pub use channel::{ChannelSession, EnvelopeSink, RegistrationState, SessionEvent, Subscription};
pub use commands::{Command, CommandClient, CommandReceipt, CommandStatus};
pub use config::{ChannelConfig, RelayConfig};
pub use envelope::{Action, ActionFilter, Envelope, IceCandidate, InboundMessage, SessionDescription};
pub use error::{
    ChannelError, CommandError, ConfigError, DecodeError, EnvelopeError, NegotiationError,
    RelayError, RelayResult,
};
pub use pool::{ChannelPool, PooledChannel};
pub use signaling::{CandidatePolicy, NegotiationState, SignalingNegotiator, WebRtcPeer};
pub use snapshot::{MediaSnapshot, MediaSnapshotViewer, SnapshotKind, ViewerMode};
pub use viewer::{AudioTarget, DeviceViewer, ViewerEvent, ViewerOptions};

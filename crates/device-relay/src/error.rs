use thiserror::Error;

/// An inbound frame that could not be turned into an [`crate::envelope::Envelope`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("binary frame is not utf-8")]
    NotUtf8,
    #[error("payload for action {action} has the wrong shape: {reason}")]
    Payload { action: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel setup failed: {0}")]
    Setup(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("relay closed the channel (code {code:?}): {reason}")]
    ClosedByRelay { code: Option<u16>, reason: String },
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("envelope for device {envelope} cannot be sent on the channel for {channel}")]
    DeviceMismatch { channel: String, envelope: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to create local answer: {0}")]
    Answer(String),
    #[error("ice candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("ice candidate arrived before the remote description")]
    PrematureCandidate,
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("peer connection failed")]
    PeerFailed,
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl NegotiationError {
    /// Whether the error ends the life of the peer connection it came from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            NegotiationError::CandidateRejected(_) | NegotiationError::PrematureCandidate
        )
    }
}

/// A single media chunk or snapshot that could not be decoded. Always local:
/// the offending message is dropped and processing continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("pcm16 payload has odd length {0}")]
    OddLength(usize),
    #[error("invalid wav payload: {0}")]
    Wav(String),
    #[error("audio output rejected chunk: {0}")]
    Output(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command endpoint: {0}")]
    Endpoint(String),
    #[error("command request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("command rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type RelayResult<T> = Result<T, RelayError>;

//! Single-shot media: camera frames, captures, screenshots and recorded
//! audio clips. Only the latest snapshot per viewer is kept; the one it
//! replaces is released through the [`SnapshotSink`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::audio::{probe_wav, WavInfo};
use crate::envelope::{Action, InboundMessage};
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerMode {
    CameraFrame,
    Capture,
    Screenshot,
    RecordedAudio,
}

impl ViewerMode {
    pub const ALL: [ViewerMode; 4] = [
        ViewerMode::CameraFrame,
        ViewerMode::Capture,
        ViewerMode::Screenshot,
        ViewerMode::RecordedAudio,
    ];

    pub fn action(self) -> Action {
        match self {
            ViewerMode::CameraFrame => Action::CameraFrame,
            ViewerMode::Capture => Action::CaptureFrame,
            ViewerMode::Screenshot => Action::Screenshot,
            ViewerMode::RecordedAudio => Action::RecordedAudio,
        }
    }

    pub fn kind(self) -> SnapshotKind {
        match self {
            ViewerMode::CameraFrame => SnapshotKind::Frame,
            ViewerMode::Capture => SnapshotKind::Capture,
            ViewerMode::Screenshot => SnapshotKind::Screenshot,
            ViewerMode::RecordedAudio => SnapshotKind::RecordedAudio,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ViewerMode::CameraFrame | ViewerMode::Capture => "image/jpeg",
            ViewerMode::Screenshot => "image/png",
            ViewerMode::RecordedAudio => "audio/wav",
        }
    }

    fn payload(self, message: &InboundMessage) -> Option<&str> {
        match (self, message) {
            (ViewerMode::CameraFrame, InboundMessage::CameraFrame(p))
            | (ViewerMode::Capture, InboundMessage::CaptureFrame(p))
            | (ViewerMode::Screenshot, InboundMessage::Screenshot(p))
            | (ViewerMode::RecordedAudio, InboundMessage::RecordedAudio(p)) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Frame,
    Capture,
    Screenshot,
    RecordedAudio,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Frame => "frame",
            SnapshotKind::Capture => "capture",
            SnapshotKind::Screenshot => "screenshot",
            SnapshotKind::RecordedAudio => "recorded-audio",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SnapshotKind::Frame | SnapshotKind::Capture => "jpg",
            SnapshotKind::Screenshot => "png",
            SnapshotKind::RecordedAudio => "wav",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub kind: SnapshotKind,
    pub mime: &'static str,
    pub bytes: Bytes,
    pub sequence: u64,
    /// Set for recorded audio.
    pub audio: Option<WavInfo>,
    /// Where the sink materialized this snapshot, if anywhere.
    pub location: Option<PathBuf>,
}

impl MediaSnapshot {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

/// Owns whatever a published snapshot is rendered into.
pub trait SnapshotSink: Send {
    fn publish(&mut self, snapshot: &MediaSnapshot) -> io::Result<Option<PathBuf>>;
    /// The snapshot was replaced or cleared.
    fn release(&mut self, snapshot: &MediaSnapshot);
    /// The viewer is closing and `snapshot` was the last one shown.
    fn retire(&mut self, snapshot: &MediaSnapshot) {
        self.release(snapshot);
    }
}

/// Keeps snapshots in memory only.
#[derive(Debug, Default)]
pub struct MemorySink;

impl SnapshotSink for MemorySink {
    fn publish(&mut self, _snapshot: &MediaSnapshot) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }

    fn release(&mut self, _snapshot: &MediaSnapshot) {}
}

/// Writes each snapshot to `dir` and deletes it once superseded.
#[derive(Debug)]
pub struct FileSnapshotSink {
    dir: PathBuf,
    prefix: String,
    keep_last: bool,
}

impl FileSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            dir,
            prefix: id[..8].to_string(),
            keep_last: false,
        })
    }

    /// Leave the final snapshot on disk when the viewer closes.
    pub fn keep_last(mut self, keep: bool) -> Self {
        self.keep_last = keep;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn publish(&mut self, snapshot: &MediaSnapshot) -> io::Result<Option<PathBuf>> {
        let name = format!(
            "{}-{}-{:06}.{}",
            self.prefix,
            snapshot.kind.as_str(),
            snapshot.sequence,
            snapshot.kind.extension()
        );
        let path = self.dir.join(name);
        fs::write(&path, &snapshot.bytes)?;
        Ok(Some(path))
    }

    fn release(&mut self, snapshot: &MediaSnapshot) {
        let Some(path) = snapshot.location.as_ref() else {
            return;
        };
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(target = "snapshot", path = %path.display(), error = %err, "failed to release snapshot");
            }
        }
    }

    fn retire(&mut self, snapshot: &MediaSnapshot) {
        if !self.keep_last {
            self.release(snapshot);
        }
    }
}

pub struct MediaSnapshotViewer {
    mode: ViewerMode,
    sink: Box<dyn SnapshotSink>,
    current: Option<MediaSnapshot>,
    sequence: u64,
    closed: bool,
}

impl MediaSnapshotViewer {
    pub fn new(mode: ViewerMode, sink: Box<dyn SnapshotSink>) -> Self {
        Self {
            mode,
            sink,
            current: None,
            sequence: 0,
            closed: false,
        }
    }

    pub fn mode(&self) -> ViewerMode {
        self.mode
    }

    pub fn latest(&self) -> Option<&MediaSnapshot> {
        self.current.as_ref()
    }

    /// Decodes a message for this viewer's mode and makes it the latest
    /// snapshot. Messages for other actions are ignored.
    pub fn handle(&mut self, message: &InboundMessage) -> Result<Option<&MediaSnapshot>, DecodeError> {
        if self.closed {
            return Ok(None);
        }
        let Some(payload) = self.mode.payload(message) else {
            return Ok(None);
        };
        let bytes = decode_media(payload)?;
        let audio = match self.mode {
            ViewerMode::RecordedAudio => Some(probe_wav(&bytes)?),
            _ => None,
        };

        self.sequence += 1;
        let mut snapshot = MediaSnapshot {
            kind: self.mode.kind(),
            mime: self.mode.mime(),
            bytes: Bytes::from(bytes),
            sequence: self.sequence,
            audio,
            location: None,
        };
        match self.sink.publish(&snapshot) {
            Ok(location) => snapshot.location = location,
            Err(err) => {
                warn!(target = "snapshot", kind = snapshot.kind.as_str(), error = %err, "failed to publish snapshot");
            }
        }
        if let Some(previous) = self.current.replace(snapshot) {
            self.sink.release(&previous);
        }
        debug!(target = "snapshot", kind = self.mode.kind().as_str(), sequence = self.sequence, "snapshot updated");
        Ok(self.current.as_ref())
    }

    /// Drops the current snapshot, back to the placeholder state.
    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            self.sink.release(&previous);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(last) = self.current.take() {
            self.sink.retire(&last);
        }
    }
}

impl Drop for MediaSnapshotViewer {
    fn drop(&mut self) {
        self.close();
    }
}

// Devices send bare base64; a full data URL is accepted too.
fn decode_media(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let payload = payload.trim();
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => payload,
    };
    if encoded.is_empty() {
        return Err(DecodeError::Base64("empty payload".into()));
    }
    STANDARD
        .decode(encoded)
        .map_err(|err| DecodeError::Base64(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SnapshotSink for RecordingSink {
        fn publish(&mut self, snapshot: &MediaSnapshot) -> io::Result<Option<PathBuf>> {
            self.log.lock().push(format!("publish:{}", snapshot.sequence));
            Ok(None)
        }

        fn release(&mut self, snapshot: &MediaSnapshot) {
            self.log.lock().push(format!("release:{}", snapshot.sequence));
        }
    }

    fn wav_bytes() -> Vec<u8> {
        let mut cursor = io::Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..800 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn latest_wins_and_predecessor_is_released() {
        let sink = RecordingSink::default();
        let log = sink.log.clone();
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::Screenshot, Box::new(sink));

        viewer
            .handle(&InboundMessage::Screenshot(STANDARD.encode(b"one")))
            .unwrap();
        let latest = viewer
            .handle(&InboundMessage::Screenshot(STANDARD.encode(b"two")))
            .unwrap()
            .unwrap();
        assert_eq!(latest.bytes.as_ref(), b"two");
        assert_eq!(latest.mime, "image/png");
        assert_eq!(*log.lock(), vec!["publish:1", "publish:2", "release:1"]);

        drop(viewer);
        assert_eq!(log.lock().last().map(String::as_str), Some("release:2"));
    }

    #[test]
    fn other_actions_are_ignored() {
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::CameraFrame, Box::new(MemorySink));
        let out = viewer
            .handle(&InboundMessage::Screenshot(STANDARD.encode(b"x")))
            .unwrap();
        assert!(out.is_none());
        assert!(viewer.latest().is_none());
    }

    #[test]
    fn bad_payload_keeps_previous_snapshot() {
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::Capture, Box::new(MemorySink));
        viewer
            .handle(&InboundMessage::CaptureFrame(STANDARD.encode(b"jpeg")))
            .unwrap();
        let err = viewer
            .handle(&InboundMessage::CaptureFrame("%%%".into()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
        assert_eq!(viewer.latest().unwrap().bytes.as_ref(), b"jpeg");
    }

    #[test]
    fn data_url_round_trips_the_mime() {
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::CameraFrame, Box::new(MemorySink));
        let snapshot = viewer
            .handle(&InboundMessage::CameraFrame("data:image/jpeg;base64,AQID".into()))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(snapshot.data_url(), "data:image/jpeg;base64,AQID");
    }

    #[test]
    fn recorded_audio_is_probed() {
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::RecordedAudio, Box::new(MemorySink));
        let snapshot = viewer
            .handle(&InboundMessage::RecordedAudio(STANDARD.encode(wav_bytes())))
            .unwrap()
            .unwrap();
        let info = snapshot.audio.unwrap();
        assert_eq!(info.sample_rate, 8_000);
        assert!((info.duration_secs - 0.1).abs() < 1e-9);

        let err = viewer
            .handle(&InboundMessage::RecordedAudio(STANDARD.encode(b"nope")))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Wav(_)));
    }

    #[test]
    fn file_sink_deletes_superseded_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSnapshotSink::new(dir.path()).unwrap();
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::CameraFrame, Box::new(sink));

        let first = viewer
            .handle(&InboundMessage::CameraFrame(STANDARD.encode(b"a")))
            .unwrap()
            .unwrap()
            .location
            .clone()
            .unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"a");
        let second = viewer
            .handle(&InboundMessage::CameraFrame(STANDARD.encode(b"b")))
            .unwrap()
            .unwrap()
            .location
            .clone()
            .unwrap();
        assert!(!first.exists());
        assert!(second.exists());

        viewer.clear();
        assert!(!second.exists());
        assert!(viewer.latest().is_none());
    }

    #[test]
    fn file_sink_can_keep_the_last_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSnapshotSink::new(dir.path()).unwrap().keep_last(true);
        let mut viewer = MediaSnapshotViewer::new(ViewerMode::Screenshot, Box::new(sink));
        let path = viewer
            .handle(&InboundMessage::Screenshot(STANDARD.encode(b"png")))
            .unwrap()
            .unwrap()
            .location
            .clone()
            .unwrap();
        viewer.close();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
    }
}

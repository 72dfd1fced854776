//! Gapless playback of streamed PCM16 chunks.
//!
//! Each `audio_stream` payload is base64 little-endian signed 16-bit mono
//! PCM. Chunks are placed back to back on the output's clock; when the
//! output has already played past the cursor (network underrun) the next
//! chunk starts "now" instead of in the past.

mod device;
mod wav;

pub use device::{DeviceOutput, PlaybackQueue};
pub use wav::{probe_wav, WavInfo, WavRecorder};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, trace};

use crate::error::DecodeError;

/// Decoded mono samples in `[-1.0, 1.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// A source of time, in seconds, that never goes backwards.
pub trait Clock: Send {
    fn now(&self) -> f64;
}

/// Seconds since construction, on tokio's clock so paused-time tests can
/// drive it.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Where decoded audio goes: an audio-context analog with its own clock.
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;
    fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError>;
    /// Stops playback and drops anything not yet played.
    fn close(&mut self);
}

/// A clock with nowhere to play; scheduled audio is dropped.
impl AudioOutput for MonotonicClock {
    fn current_time(&self) -> f64 {
        self.now()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError> {
        trace!(target = "audio", start, samples = buffer.samples.len(), "discarding scheduled audio");
        Ok(())
    }

    fn close(&mut self) {}
}

impl AudioOutput for Box<dyn AudioOutput> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError> {
        (**self).schedule(buffer, start)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Decodes one base64 PCM16LE payload.
pub fn decode_pcm16(payload: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| DecodeError::Base64(err.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Where the next chunk starts, in output-clock seconds. Never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    next_start: f64,
}

impl PlaybackCursor {
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    fn place(&mut self, now: f64, duration: f64) -> (f64, bool) {
        let clamped = now > self.next_start;
        let start = self.next_start.max(now);
        self.next_start = start + duration;
        (start, clamped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
    pub samples: usize,
    /// The cursor was behind the clock and the chunk was moved up to now.
    pub clamped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub chunks: u64,
    pub samples: u64,
    pub clamps: u64,
    pub dropped: u64,
}

pub struct AudioFrameScheduler<O: AudioOutput> {
    output: O,
    cursor: PlaybackCursor,
    sample_rate: u32,
    stats: SchedulerStats,
    closed: bool,
}

impl<O: AudioOutput> AudioFrameScheduler<O> {
    pub fn new(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            cursor: PlaybackCursor::default(),
            sample_rate: sample_rate.max(1),
            stats: SchedulerStats::default(),
            closed: false,
        }
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Decodes and schedules one chunk. Empty chunks are skipped; a chunk
    /// that fails to decode is dropped and leaves the cursor where it was.
    pub fn push_chunk(&mut self, payload: &str) -> Result<Option<ScheduledChunk>, DecodeError> {
        if self.closed {
            return Ok(None);
        }
        let samples = match decode_pcm16(payload) {
            Ok(samples) => samples,
            Err(err) => {
                self.stats.dropped += 1;
                return Err(err);
            }
        };
        if samples.is_empty() {
            return Ok(None);
        }
        let buffer = AudioBuffer {
            samples,
            sample_rate: self.sample_rate,
        };
        let duration = buffer.duration();
        let count = buffer.samples.len();

        let mut cursor = self.cursor;
        let (start, clamped) = cursor.place(self.output.current_time(), duration);
        if let Err(err) = self.output.schedule(buffer, start) {
            self.stats.dropped += 1;
            return Err(err);
        }
        self.cursor = cursor;
        self.stats.chunks += 1;
        self.stats.samples += count as u64;
        if clamped {
            self.stats.clamps += 1;
        }
        trace!(target = "audio", start, duration, samples = count, clamped, "scheduled chunk");
        Ok(Some(ScheduledChunk {
            start,
            duration,
            samples: count,
            clamped,
        }))
    }

    /// Stops the output. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output.close();
        debug!(
            target = "audio",
            chunks = self.stats.chunks,
            samples = self.stats.samples,
            clamps = self.stats.clamps,
            dropped = self.stats.dropped,
            "audio scheduler closed"
        );
    }
}

impl<O: AudioOutput> Drop for AudioFrameScheduler<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeOutput {
        now: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
        closed: Arc<Mutex<u32>>,
    }

    impl FakeOutput {
        fn set_time(&self, t: f64) {
            *self.now.lock() = t;
        }
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            *self.now.lock()
        }

        fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError> {
            self.scheduled.lock().push((start, buffer.samples.len()));
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    fn pcm_chunk(samples: usize) -> String {
        STANDARD.encode(vec![0u8; samples * 2])
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn decodes_little_endian_samples() {
        let payload = STANDARD.encode([0x00, 0x80, 0xff, 0x7f, 0x00, 0x40]);
        let samples = decode_pcm16(&payload).unwrap();
        assert_eq!(samples, vec![-1.0, 32767.0 / 32768.0, 0.5]);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        let payload = STANDARD.encode([1u8, 2, 3]);
        assert_eq!(decode_pcm16(&payload), Err(DecodeError::OddLength(3)));
    }

    #[test]
    fn back_to_back_chunks_are_gapless() {
        let output = FakeOutput::default();
        output.set_time(1.0);
        let mut scheduler = AudioFrameScheduler::new(output.clone(), 44_100);

        let first = scheduler.push_chunk(&pcm_chunk(4410)).unwrap().unwrap();
        let second = scheduler.push_chunk(&pcm_chunk(4410)).unwrap().unwrap();
        assert!(approx(first.start, 1.0));
        assert!(first.clamped);
        assert!(approx(second.start, 1.1));
        assert!(!second.clamped);
        assert!(approx(scheduler.cursor().next_start(), 1.2));
    }

    #[test]
    fn underrun_restarts_at_current_time() {
        let output = FakeOutput::default();
        let mut scheduler = AudioFrameScheduler::new(output.clone(), 44_100);
        scheduler.push_chunk(&pcm_chunk(4410)).unwrap();
        output.set_time(5.0);
        let late = scheduler.push_chunk(&pcm_chunk(4410)).unwrap().unwrap();
        assert!(approx(late.start, 5.0));
        assert!(late.clamped);
        assert_eq!(scheduler.stats().clamps, 1);
    }

    #[test]
    fn scheduled_chunks_never_overlap() {
        let output = FakeOutput::default();
        let mut scheduler = AudioFrameScheduler::new(output.clone(), 8_000);
        for (i, len) in [800usize, 160, 2400, 1].into_iter().enumerate() {
            output.set_time(i as f64 * 0.05);
            scheduler.push_chunk(&pcm_chunk(len)).unwrap();
        }
        let scheduled = output.scheduled.lock().clone();
        for pair in scheduled.windows(2) {
            let (start, len) = pair[0];
            let end = start + len as f64 / 8_000.0;
            assert!(pair[1].0 >= end - 1e-9);
        }
    }

    #[test]
    fn empty_and_bad_chunks_leave_cursor_alone() {
        let output = FakeOutput::default();
        output.set_time(2.0);
        let mut scheduler = AudioFrameScheduler::new(output.clone(), 44_100);
        scheduler.push_chunk(&pcm_chunk(441)).unwrap();
        let cursor = scheduler.cursor();

        assert_eq!(scheduler.push_chunk("").unwrap(), None);
        assert!(matches!(
            scheduler.push_chunk("!!not base64!!"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            scheduler.push_chunk(&STANDARD.encode([1u8])),
            Err(DecodeError::OddLength(1))
        ));
        assert_eq!(scheduler.cursor(), cursor);
        assert_eq!(scheduler.stats().dropped, 2);
        assert_eq!(output.scheduled.lock().len(), 1);
    }

    #[test]
    fn close_once_including_drop() {
        let output = FakeOutput::default();
        let closed = output.closed.clone();
        let mut scheduler = AudioFrameScheduler::new(output, 44_100);
        scheduler.close();
        scheduler.close();
        assert_eq!(scheduler.push_chunk(&pcm_chunk(10)).unwrap(), None);
        drop(scheduler);
        assert_eq!(*closed.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert!(approx(clock.now(), 0.25));
    }
}

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{info, warn};

use super::{AudioBuffer, AudioOutput, Clock};
use crate::error::DecodeError;

/// Format summary of a WAV payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub duration_secs: f64,
}

pub fn probe_wav(bytes: &[u8]) -> Result<WavInfo, DecodeError> {
    let reader = WavReader::new(Cursor::new(bytes)).map_err(|err| DecodeError::Wav(err.to_string()))?;
    let spec = reader.spec();
    let frames = reader.duration();
    Ok(WavInfo {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits_per_sample,
        duration_secs: f64::from(frames) / f64::from(spec.sample_rate.max(1)),
    })
}

/// Plays scheduled audio into a 16-bit mono WAV file.
///
/// The file starts at the first scheduled buffer. Samples are mixed into a
/// pending tail and written out as the clock passes them, so only audio
/// that has not "played" yet is held in memory. Idle time between buffers
/// is written as silence. On close the tail is cut at the clock's time,
/// like a stopped audio context.
pub struct WavRecorder<C: Clock> {
    clock: C,
    path: PathBuf,
    sample_rate: u32,
    writer: Option<WavWriter<BufWriter<File>>>,
    /// Clock time of sample zero.
    origin: Option<f64>,
    /// Samples already written to the file.
    written: usize,
    /// Mixed samples from `written` onwards.
    pending: VecDeque<f32>,
    finished: bool,
}

impl<C: Clock> WavRecorder<C> {
    pub fn new(clock: C, path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            clock,
            path: path.into(),
            sample_rate: sample_rate.max(1),
            writer: None,
            origin: None,
            written: 0,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples written to disk so far.
    pub fn samples_written(&self) -> usize {
        self.written
    }

    fn offset(&self, seconds: f64) -> usize {
        let origin = self.origin.unwrap_or(seconds);
        ((seconds - origin).max(0.0) * f64::from(self.sample_rate)).round() as usize
    }

    // Opened on first use so a recorder that never plays still leaves a file.
    fn take_writer(&mut self) -> Result<WavWriter<BufWriter<File>>, hound::Error> {
        if let Some(writer) = self.writer.take() {
            return Ok(writer);
        }
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        WavWriter::create(&self.path, spec)
    }

    /// Writes everything the clock has passed. With `pad`, time the clock
    /// passed beyond the pending tail is written as silence.
    fn flush_played(&mut self, pad: bool) -> Result<(), hound::Error> {
        if self.origin.is_none() {
            return Ok(());
        }
        let played = self.offset(self.clock.now());
        let due = played.saturating_sub(self.written);
        let from_tail = due.min(self.pending.len());
        let silence = if pad { due - from_tail } else { 0 };
        if from_tail + silence == 0 {
            return Ok(());
        }

        let mut writer = self.take_writer()?;
        let result = self
            .pending
            .drain(..from_tail)
            .chain(std::iter::repeat(0.0).take(silence))
            .try_for_each(|sample| writer.write_sample(to_pcm16(sample)));
        self.writer = Some(writer);
        result?;
        self.written += from_tail + silence;
        Ok(())
    }
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

impl<C: Clock> AudioOutput for WavRecorder<C> {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError> {
        if self.finished {
            return Err(DecodeError::Output("recorder already closed".into()));
        }
        if buffer.sample_rate != self.sample_rate {
            return Err(DecodeError::Output(format!(
                "sample rate {} does not match recorder rate {}",
                buffer.sample_rate, self.sample_rate
            )));
        }
        if self.origin.is_none() {
            self.origin = Some(start);
        }
        self.flush_played(true)
            .map_err(|err| DecodeError::Output(err.to_string()))?;

        let offset = self.offset(start);
        // Anything before `written` is already on disk.
        let skip = self.written.saturating_sub(offset);
        let index = offset.saturating_sub(self.written);
        let samples = buffer.samples.get(skip..).unwrap_or_default();
        let end = index + samples.len();
        if self.pending.len() < end {
            self.pending.resize(end, 0.0);
        }
        for (slot, sample) in self.pending.range_mut(index..end).zip(samples) {
            *slot += *sample;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let result = self
            .flush_played(false)
            .and_then(|()| self.take_writer())
            .and_then(WavWriter::finalize);
        match result {
            Ok(()) => info!(
                target = "audio",
                path = %self.path.display(),
                samples = self.written,
                "wrote audio recording"
            ),
            Err(err) => warn!(
                target = "audio",
                path = %self.path.display(),
                error = %err,
                "failed to write audio recording"
            ),
        }
        self.pending = VecDeque::new();
    }
}

impl<C: Clock> Drop for WavRecorder<C> {
    fn drop(&mut self) {
        self.close();
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioBuffer, AudioOutput};
use crate::error::DecodeError;

/// Samples waiting for the sound card, positioned on the card's own clock.
///
/// Time is measured in source frames the output callback has consumed, so
/// `current_time` only advances while the device is actually playing.
#[derive(Debug)]
pub struct PlaybackQueue {
    sample_rate: u32,
    /// Source frames handed to the device so far.
    played: u64,
    /// Source frames from `played` onwards, silence where nothing is scheduled.
    pending: VecDeque<f32>,
    /// Fractional source position when the device runs at another rate.
    phase: f64,
}

impl PlaybackQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            played: 0,
            pending: VecDeque::new(),
            phase: 0.0,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.played as f64 / f64::from(self.sample_rate)
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Mixes `samples` in at `start` seconds. Samples whose time has passed
    /// are dropped.
    pub fn schedule(&mut self, samples: &[f32], start: f64) {
        let at = (start.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let skip = usize::try_from(self.played.saturating_sub(at)).unwrap_or(usize::MAX);
        let index = usize::try_from(at.saturating_sub(self.played)).unwrap_or(usize::MAX);
        let samples = samples.get(skip..).unwrap_or_default();
        if samples.is_empty() {
            return;
        }
        let end = index.saturating_add(samples.len());
        if self.pending.len() < end {
            self.pending.resize(end, 0.0);
        }
        for (slot, sample) in self.pending.range_mut(index..end).zip(samples) {
            *slot += *sample;
        }
    }

    /// Fills one interleaved device buffer. Every channel gets the mono
    /// sample; `step` is source frames per device frame.
    pub fn fill(&mut self, out: &mut [f32], channels: usize, step: f64) {
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = self.pending.front().copied().unwrap_or(0.0);
            frame.fill(sample.clamp(-1.0, 1.0));
            self.phase += step;
            while self.phase >= 1.0 {
                self.phase -= 1.0;
                self.pending.pop_front();
                self.played += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Plays scheduled audio on the default output device.
///
/// The cpal stream lives on its own thread; dropping or closing the output
/// stops it and discards whatever had not played.
pub struct DeviceOutput {
    queue: Arc<Mutex<PlaybackQueue>>,
    #[cfg(feature = "playback")]
    stream: Option<stream::StreamThread>,
}

impl DeviceOutput {
    #[cfg(feature = "playback")]
    pub fn open(sample_rate: u32) -> Result<Self, DecodeError> {
        let queue = Arc::new(Mutex::new(PlaybackQueue::new(sample_rate)));
        let stream = stream::StreamThread::spawn(queue.clone(), sample_rate)?;
        Ok(Self {
            queue,
            stream: Some(stream),
        })
    }

    #[cfg(not(feature = "playback"))]
    pub fn open(_sample_rate: u32) -> Result<Self, DecodeError> {
        Err(DecodeError::Output(
            "built without the `playback` feature".into(),
        ))
    }

    #[cfg(feature = "playback")]
    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }

    #[cfg(not(feature = "playback"))]
    fn stop_stream(&mut self) {}
}

impl AudioOutput for DeviceOutput {
    fn current_time(&self) -> f64 {
        self.queue.lock().current_time()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start: f64) -> Result<(), DecodeError> {
        let mut queue = self.queue.lock();
        if buffer.sample_rate != queue.sample_rate {
            return Err(DecodeError::Output(format!(
                "sample rate {} does not match output rate {}",
                buffer.sample_rate, queue.sample_rate
            )));
        }
        queue.schedule(&buffer.samples, start);
        Ok(())
    }

    fn close(&mut self) {
        self.stop_stream();
        self.queue.lock().clear();
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "playback")]
mod stream {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use parking_lot::Mutex;
    use tracing::{info, warn};

    use super::PlaybackQueue;
    use crate::error::DecodeError;

    pub(super) struct StreamThread {
        stop: mpsc::Sender<()>,
        handle: JoinHandle<()>,
    }

    impl StreamThread {
        pub(super) fn spawn(
            queue: Arc<Mutex<PlaybackQueue>>,
            sample_rate: u32,
        ) -> Result<Self, DecodeError> {
            let (ready_tx, ready_rx) = mpsc::channel();
            let (stop, stop_rx) = mpsc::channel::<()>();
            let handle = thread::Builder::new()
                .name("device-relay-playback".into())
                .spawn(move || {
                    let stream = match build(queue, sample_rate) {
                        Ok(stream) => stream,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // Either a stop request or the output being dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                })
                .map_err(|err| DecodeError::Output(format!("playback thread: {err}")))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self { stop, handle }),
                Ok(Err(err)) => {
                    let _ = handle.join();
                    Err(err)
                }
                Err(_) => Err(DecodeError::Output("playback thread exited".into())),
            }
        }

        pub(super) fn stop(self) {
            let _ = self.stop.send(());
            if self.handle.join().is_err() {
                warn!(target = "audio", "playback thread panicked");
            }
        }
    }

    fn build(queue: Arc<Mutex<PlaybackQueue>>, sample_rate: u32) -> Result<cpal::Stream, DecodeError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| DecodeError::Output("no output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|err| DecodeError::Output(format!("output config: {err}")))?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(DecodeError::Output(format!(
                "unsupported output sample format {:?}",
                supported.sample_format()
            )));
        }
        let config: cpal::StreamConfig = supported.into();
        let channels = usize::from(config.channels);
        let step = f64::from(sample_rate) / f64::from(config.sample_rate.0);
        info!(
            target = "audio",
            device = %device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            source_rate = sample_rate,
            channels,
            "opening playback stream"
        );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    queue.lock().fill(data, channels, step);
                },
                |err| warn!(target = "audio", error = %err, "playback stream error"),
                None,
            )
            .map_err(|err| DecodeError::Output(format!("build stream: {err}")))?;
        stream
            .play()
            .map_err(|err| DecodeError::Output(format!("start stream: {err}")))?;
        Ok(stream)
    }
}

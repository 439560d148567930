//! Speaker output.
//!
//! The sink exposes a device clock measured in seconds of audio actually
//! rendered, and accepts chunks scheduled at explicit start times on that
//! clock. Scheduling is realized as a single contiguous sample queue drained
//! by the device callback: a chunk scheduled later than the current queue end
//! gets zero-padding in between, so start times are honored to the sample.
//!
//! `stop()` lets the chunk currently under the play head finish naturally
//! but drops every chunk that has not started yet.

use crate::audio::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Output device abstraction the playback scheduler talks to. Mocked in
/// tests with a manually advanced clock.
pub trait PlaybackSink: Send + Sync {
    /// Current device-clock time in seconds.
    fn clock_now(&self) -> f64;

    /// Queue a decoded chunk to begin playing at `start` (device-clock
    /// seconds). Must be called with monotonically non-decreasing starts.
    fn enqueue_at(&self, frame: AudioFrame, start: f64);

    /// Stop accepting chunks and drop everything not yet started.
    fn stop(&self);
}

#[derive(Default)]
struct SinkQueue {
    samples: VecDeque<f32>,
    /// Absolute (start, end) sample indices of each queued chunk, in the
    /// same numbering as `total_enqueued`. Padding between chunks is not
    /// covered by any entry.
    chunk_bounds: VecDeque<(u64, u64)>,
    /// Total samples ever enqueued, padding included.
    total_enqueued: u64,
    stopped: bool,
}

struct SinkShared {
    queue: Mutex<SinkQueue>,
    /// Samples rendered by the device callback since the stream started,
    /// advancing through underruns as well.
    clock_samples: AtomicU64,
}

enum SinkCommand {
    Shutdown,
}

/// cpal-backed sink. A dedicated thread owns the output stream; the shared
/// queue and clock are all the async side touches.
pub struct CpalSink {
    shared: Arc<SinkShared>,
    command_tx: Mutex<Option<std_mpsc::Sender<SinkCommand>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalSink {
    pub fn new() -> Result<Self, DeviceError> {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(SinkQueue::default()),
            clock_samples: AtomicU64::new(0),
        });

        let (command_tx, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let thread_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name("speaker-sink".into())
            .spawn(move || match build_output_stream(thread_shared) {
                Ok(stream) => {
                    if ready_tx.send(Ok(())).is_err() {
                        return;
                    }
                    let _ = command_rx.recv();
                    drop(stream);
                    log::info!("Playback: speaker released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| DeviceError::Stream(format!("sink thread spawn failed: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                command_tx: Mutex::new(Some(command_tx)),
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Stream(
                "sink thread exited before reporting readiness".into(),
            )),
        }
    }

    /// Release the output device. Idempotent.
    pub fn close(&self) {
        if let Some(tx) = self.command_tx.lock().unwrap().take() {
            let _ = tx.send(SinkCommand::Shutdown);
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                log::warn!("Playback: sink thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl PlaybackSink for CpalSink {
    fn clock_now(&self) -> f64 {
        self.shared.clock_samples.load(Ordering::Acquire) as f64 / PLAYBACK_SAMPLE_RATE as f64
    }

    fn enqueue_at(&self, frame: AudioFrame, start: f64) {
        let now = self.clock_now();
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.stopped {
            log::debug!("Playback: sink stopped, discarding late chunk");
            return;
        }

        let queue_end = now + queue.samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
        let gap = start - queue_end;
        if gap > 0.0 {
            let pad = (gap * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
            queue.samples.extend(std::iter::repeat(0.0).take(pad));
            queue.total_enqueued += pad as u64;
        }

        let chunk_start = queue.total_enqueued;
        queue.samples.extend(frame.samples.iter().copied());
        queue.total_enqueued += frame.samples.len() as u64;
        let chunk_end = queue.total_enqueued;
        queue.chunk_bounds.push_back((chunk_start, chunk_end));
    }

    fn stop(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.stopped = true;

        let front_abs = queue.total_enqueued - queue.samples.len() as u64;
        while let Some(&(_, end)) = queue.chunk_bounds.front() {
            if end <= front_abs {
                queue.chunk_bounds.pop_front();
            } else {
                break;
            }
        }

        // Keep only the chunk currently under the play head.
        let keep = match queue.chunk_bounds.front() {
            Some(&(start, end)) if start <= front_abs => (end - front_abs) as usize,
            _ => 0,
        };
        queue.samples.truncate(keep);
        queue.chunk_bounds.clear();
        log::debug!("Playback: stopped, {} tail samples left to drain", keep);
    }
}

fn build_output_stream(shared: Arc<SinkShared>) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::Unavailable("no default output device".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    if supported.sample_format() != SampleFormat::F32 {
        return Err(DeviceError::Config(format!(
            "unsupported output sample format: {:?}",
            supported.sample_format()
        )));
    }

    // Force the synthesis rate; chunks are queued at 24kHz and played as-is.
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(PLAYBACK_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = config.channels as usize;

    log::info!(
        "Playback: opening {:?} @ {}Hz, {} channels",
        device.name().unwrap_or_else(|_| "<unnamed>".into()),
        PLAYBACK_SAMPLE_RATE,
        channels
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = shared.queue.lock().unwrap();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.samples.pop_front().unwrap_or(0.0);
                    for channel in frame.iter_mut() {
                        *channel = sample;
                    }
                }
                // The clock advances through underruns too; silence is time.
                shared
                    .clock_samples
                    .fetch_add((data.len() / channels) as u64, Ordering::AcqRel);
            },
            |err| log::error!("Playback: stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    Ok(stream)
}

//! Microphone capture pipeline.
//!
//! cpal streams are not `Send`, so a dedicated thread owns the input stream
//! and its host handle. The device callback accumulates mono 16kHz samples
//! into fixed-size frames and pushes them through a bounded channel; the
//! async side only ever sees `AudioFrame`s. Frame cadence is driven by the
//! device itself, not a software timer.

use crate::audio::{AudioFrame, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, FromSample, Sample, SampleFormat, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;

/// Capacity of the frame channel between the device thread and the session
/// loop. At ~128ms per frame this buffers about four seconds.
const FRAME_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device name to capture from (None = default input device).
    pub device_name: Option<String>,
    /// Samples per delivered frame.
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

enum CaptureCommand {
    Stop,
}

/// Handle to a live microphone stream. Dropping or closing it releases the
/// device; `close()` is safe to call any number of times.
pub struct CaptureHandle {
    command_tx: Option<std_mpsc::Sender<CaptureCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Acquire the microphone and start frame delivery.
    ///
    /// Errors distinguish permission denial from plain unavailability so the
    /// session can choose between its two terminal failure states.
    pub fn open(
        config: CaptureConfig,
    ) -> Result<(CaptureHandle, mpsc::Receiver<AudioFrame>), DeviceError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread = thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                match build_capture_stream(&config, frame_tx) {
                    Ok(stream) => {
                        if ready_tx.send(Ok(())).is_err() {
                            return;
                        }
                        // Park until told to stop; the stream lives as long
                        // as this frame does.
                        let _ = command_rx.recv();
                        drop(stream);
                        log::info!("Capture: microphone released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| DeviceError::Stream(format!("capture thread spawn failed: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                CaptureHandle {
                    command_tx: Some(command_tx),
                    thread: Some(thread),
                },
                frame_rx,
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Stream(
                "capture thread exited before reporting readiness".into(),
            )),
        }
    }

    /// Stop frame delivery and release the microphone. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(CaptureCommand::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Capture: device thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_capture_stream(
    config: &CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();

    let device = if let Some(name) = &config.device_name {
        host.input_devices()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| DeviceError::Unavailable(format!("input device not found: {}", name)))?
    } else {
        host.default_input_device()
            .ok_or_else(|| DeviceError::Unavailable("no default input device".into()))?
    };

    let supported = device
        .default_input_config()
        .map_err(|e| classify_acquisition_error(&e.to_string()))?;

    // Force the 16kHz rate; the device keeps its native channel count and
    // the callback takes channel 0. Backends that cannot run 16kHz reject
    // the stream rather than silently resampling.
    let stream_config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(CAPTURE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    log::info!(
        "Capture: opening {:?} @ {}Hz, {} channels ({:?})",
        device.name().unwrap_or_else(|_| "<unnamed>".into()),
        CAPTURE_SAMPLE_RATE,
        stream_config.channels,
        supported.sample_format()
    );

    let channels = stream_config.channels as usize;
    let frame_samples = config.frame_samples;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, channels, frame_samples, frame_tx)
        }
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, channels, frame_samples, frame_tx)
        }
        SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, channels, frame_samples, frame_tx)
        }
        other => Err(DeviceError::Config(format!(
            "unsupported input sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    frame_samples: usize,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, DeviceError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut buffer: Vec<f32> = Vec::with_capacity(frame_samples);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Mono: take channel 0 of each interleaved frame.
                for frame in data.chunks(channels) {
                    buffer.push(f32::from_sample(frame[0]));
                    if buffer.len() >= frame_samples {
                        let samples = std::mem::replace(
                            &mut buffer,
                            Vec::with_capacity(frame_samples),
                        );
                        if frame_tx
                            .try_send(AudioFrame::new(samples, CAPTURE_SAMPLE_RATE))
                            .is_err()
                        {
                            log::debug!("Capture: frame channel full, dropping frame");
                        }
                    }
                }
            },
            |err| log::error!("Capture: stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

fn map_build_error(err: BuildStreamError) -> DeviceError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            DeviceError::Unavailable("input device disappeared".into())
        }
        BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Config("16kHz mono capture not supported by device".into())
        }
        other => classify_acquisition_error(&other.to_string()),
    }
}

/// Backends report permission denial as free-form text; keep the distinction
/// alive by inspecting the message.
fn classify_acquisition_error(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        DeviceError::PermissionDenied(message.to_string())
    } else {
        DeviceError::Unavailable(message.to_string())
    }
}

/// Enumerate input devices for the `--list-devices` front-end flag.
pub fn list_input_devices() -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

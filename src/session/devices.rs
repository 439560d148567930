//! Device and transport acquisition seam.
//!
//! The session controller only ever goes through `CallDevices` to get a
//! microphone, a speaker, and a live transport session, which keeps the
//! state machine testable against mocks and keeps exclusive handle ownership
//! in one place.

use crate::audio::capture::{CaptureConfig, CaptureHandle};
use crate::audio::sink::{CpalSink, PlaybackSink};
use crate::audio::AudioFrame;
use crate::config::{ApiConfig, CallConfig};
use crate::error::DeviceError;
use crate::lead;
use crate::session::prompts;
use crate::transport::gemini::{self, SessionSetup};
use crate::transport::{LiveSession, TransportError, TransportEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Control half of an open microphone. Closing releases the device and is
/// safe to repeat.
pub trait CaptureControl: Send {
    fn close(&mut self);
}

impl CaptureControl for CaptureHandle {
    fn close(&mut self) {
        CaptureHandle::close(self)
    }
}

#[async_trait]
pub trait CallDevices: Send + Sync {
    async fn open_capture(
        &self,
        config: &CallConfig,
    ) -> Result<(Box<dyn CaptureControl>, mpsc::Receiver<AudioFrame>), DeviceError>;

    async fn open_sink(&self) -> Result<Arc<dyn PlaybackSink>, DeviceError>;

    async fn connect_transport(
        &self,
        language: &str,
        config: &CallConfig,
    ) -> Result<(Box<dyn LiveSession>, mpsc::Receiver<TransportEvent>), TransportError>;
}

/// Production wiring: cpal devices plus the Gemini Live channel.
pub struct SystemDevices {
    api: ApiConfig,
}

impl SystemDevices {
    pub fn new(api: ApiConfig) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CallDevices for SystemDevices {
    async fn open_capture(
        &self,
        config: &CallConfig,
    ) -> Result<(Box<dyn CaptureControl>, mpsc::Receiver<AudioFrame>), DeviceError> {
        let capture_config = CaptureConfig {
            device_name: config.device_name.clone(),
            ..CaptureConfig::default()
        };
        // Device acquisition blocks on the capture thread's readiness.
        let (handle, frames) = tokio::task::spawn_blocking(move || CaptureHandle::open(capture_config))
            .await
            .map_err(|e| DeviceError::Stream(format!("capture open task failed: {}", e)))??;
        Ok((Box::new(handle), frames))
    }

    async fn open_sink(&self) -> Result<Arc<dyn PlaybackSink>, DeviceError> {
        let sink = tokio::task::spawn_blocking(CpalSink::new)
            .await
            .map_err(|e| DeviceError::Stream(format!("sink open task failed: {}", e)))??;
        Ok(Arc::new(sink))
    }

    async fn connect_transport(
        &self,
        language: &str,
        config: &CallConfig,
    ) -> Result<(Box<dyn LiveSession>, mpsc::Receiver<TransportEvent>), TransportError> {
        let setup = SessionSetup {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: prompts::system_instruction(language),
            tool_declarations: lead::tool_declarations(),
        };
        let (session, events) = gemini::connect(self.api.gemini_key(), setup).await?;
        Ok((Box::new(session), events))
    }
}

//! Session lifecycle controller.
//!
//! The controller owns the microphone, speaker, and transport handles for
//! the duration of a call and runs the single event-processing loop that
//! ties capture, gating, half-duplex arbitration, playback scheduling, tool
//! handling, and idle supervision together. Each `start_call` builds a fresh
//! call context; teardown drops it whole instead of resetting fields in
//! place.

pub mod devices;
pub mod prompts;

use crate::activity::{ActivityMonitor, IDLE_POLL_INTERVAL};
use crate::audio::codec;
use crate::audio::gate::{FrameClass, NoiseGate};
use crate::audio::half_duplex;
use crate::audio::playback::{self, SchedulerHandle};
use crate::audio::sink::PlaybackSink;
use crate::audio::AudioFrame;
use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::lead::{LeadSnapshot, LeadUpdate, END_CALL_TOOL, UPDATE_LEAD_TOOL};
use crate::session::devices::{CallDevices, CaptureControl};
use crate::transport::{LiveSession, ToolInvocation, TransportEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause before nudging the agent to speak first, giving the audio path a
/// moment to settle after the session opens.
const GREETING_DELAY: Duration = Duration::from_millis(500);

/// Connection lifecycle as published to the front-end. Transitions are
/// total: every external event maps to exactly one next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CallState {
    Disconnected,
    Connecting,
    Connected,
    Ended,
    Error,
    PermissionDenied,
}

/// Read side of everything the core publishes across the UI boundary.
#[derive(Clone)]
pub struct SessionEvents {
    pub state: watch::Receiver<CallState>,
    pub lead: watch::Receiver<LeadSnapshot>,
    /// Instantaneous input loudness, 0.0..=1.0, for a visualizer.
    pub volume: watch::Receiver<f32>,
    pub agent_speaking: watch::Receiver<bool>,
}

struct Shared {
    state_tx: watch::Sender<CallState>,
    lead_tx: watch::Sender<LeadSnapshot>,
    volume_tx: watch::Sender<f32>,
    speaking_tx: watch::Sender<bool>,
}

struct ActiveCall {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Everything a single call owns. Dropped as a unit at teardown.
struct CallContext {
    session: Box<dyn LiveSession>,
    events: mpsc::Receiver<TransportEvent>,
    frames: mpsc::Receiver<AudioFrame>,
    capture: Box<dyn CaptureControl>,
    sink: Arc<dyn PlaybackSink>,
    scheduler: SchedulerHandle,
    speaking_rx: watch::Receiver<bool>,
    gate: NoiseGate,
    monitor: ActivityMonitor,
}

enum CallOutcome {
    /// Normal end: idle timeout, remote close, or agent-initiated hang-up.
    Ended,
    /// Transport failure mid-call.
    Failed,
    /// `end_call` or a superseding `start_call` cancelled the call.
    Cancelled,
}

pub struct SessionController {
    devices: Arc<dyn CallDevices>,
    config: CallConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveCall>>,
    events: SessionEvents,
}

impl SessionController {
    pub fn new(devices: Arc<dyn CallDevices>, config: CallConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(CallState::Disconnected);
        let (lead_tx, lead_rx) = watch::channel(LeadSnapshot::default());
        let (volume_tx, volume_rx) = watch::channel(0.0);
        let (speaking_tx, speaking_rx) = watch::channel(false);

        Self {
            devices,
            config,
            shared: Arc::new(Shared {
                state_tx,
                lead_tx,
                volume_tx,
                speaking_tx,
            }),
            active: Mutex::new(None),
            events: SessionEvents {
                state: state_rx,
                lead: lead_rx,
                volume: volume_rx,
                agent_speaking: speaking_rx,
            },
        }
    }

    pub fn events(&self) -> SessionEvents {
        self.events.clone()
    }

    pub fn state(&self) -> CallState {
        *self.shared.state_tx.borrow()
    }

    /// Begin a call in the given language. Any previous call's handles are
    /// fully torn down first, so re-entrant calls never hold two live
    /// microphone or transport handles.
    pub async fn start_call(&self, language: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        teardown_stale(&mut active).await;

        self.shared.state_tx.send_replace(CallState::Connecting);
        self.shared.lead_tx.send_replace(LeadSnapshot::default());
        self.shared.volume_tx.send_replace(0.0);
        log::info!("Session: dialing ({})", language);

        let (capture, frames) = match self.devices.open_capture(&self.config).await {
            Ok(pair) => pair,
            Err(e) => {
                let state = if e.is_permission_denied() {
                    CallState::PermissionDenied
                } else {
                    CallState::Error
                };
                log::error!("Session: microphone acquisition failed: {}", e);
                self.shared.state_tx.send_replace(state);
                return Err(CallError::Device(e));
            }
        };

        let sink = match self.devices.open_sink().await {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("Session: speaker acquisition failed: {}", e);
                drop_capture(capture);
                self.shared.state_tx.send_replace(CallState::Error);
                return Err(CallError::Device(e));
            }
        };

        let (session, events) = match self
            .devices
            .connect_transport(language, &self.config)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Session: transport open failed: {}", e);
                drop_capture(capture);
                sink.stop();
                self.shared.state_tx.send_replace(CallState::Error);
                return Err(CallError::Transport(e));
            }
        };

        let cancel = CancellationToken::new();
        let (scheduler, speaking_rx) = playback::spawn_scheduler(
            Arc::clone(&sink),
            self.config.speaking_debounce,
            cancel.child_token(),
        );

        let ctx = CallContext {
            session,
            events,
            frames,
            capture,
            sink,
            scheduler,
            speaking_rx,
            gate: NoiseGate::new(self.config.gate_threshold),
            monitor: ActivityMonitor::new(self.config.idle_timeout),
        };

        self.shared.state_tx.send_replace(CallState::Connected);
        log::info!("Session: connected");

        let supervisor = tokio::spawn(supervise(ctx, Arc::clone(&self.shared), cancel.clone()));
        *active = Some(ActiveCall { cancel, supervisor });

        Ok(())
    }

    /// End the current call, if any. Safe to call from any state.
    pub async fn end_call(&self) {
        let mut active = self.active.lock().await;
        if active.is_some() {
            log::info!("Session: caller ended the call");
        }
        teardown_stale(&mut active).await;
    }

    /// Return to `Disconnected` and clear the lead snapshot. Ignored while a
    /// call is live; never touches devices.
    pub async fn reset(&self) {
        let active = self.active.lock().await;
        if active.is_some()
            && matches!(self.state(), CallState::Connecting | CallState::Connected)
        {
            log::warn!("Session: reset ignored while call is live");
            return;
        }
        self.shared.lead_tx.send_replace(LeadSnapshot::default());
        self.shared.volume_tx.send_replace(0.0);
        self.shared.state_tx.send_replace(CallState::Disconnected);
    }
}

/// Cancel a previous call and wait until its supervisor has released every
/// handle. Idempotent: no active call is a no-op.
async fn teardown_stale(active: &mut Option<ActiveCall>) {
    if let Some(call) = active.take() {
        call.cancel.cancel();
        if call.supervisor.await.is_err() {
            log::warn!("Session: call supervisor panicked during teardown");
        }
    }
}

fn drop_capture(mut capture: Box<dyn CaptureControl>) {
    capture.close();
}

/// Run one call to completion, then release all three device handles in
/// order, idempotently, and publish the terminal state.
async fn supervise(mut ctx: CallContext, shared: Arc<Shared>, cancel: CancellationToken) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => CallOutcome::Cancelled,
        outcome = run_call(&mut ctx, &shared, &cancel) => outcome,
    };

    // Teardown: the scheduler dies with the token, unstarted playback is
    // dropped, in-flight decodes are abandoned.
    cancel.cancel();
    ctx.capture.close();
    ctx.sink.stop();
    if let Err(e) = ctx.session.close().await {
        log::debug!("Session: transport close failed: {}", e);
    }
    shared.speaking_tx.send_replace(false);
    shared.volume_tx.send_replace(0.0);

    let state = match outcome {
        CallOutcome::Ended | CallOutcome::Cancelled => CallState::Ended,
        CallOutcome::Failed => CallState::Error,
    };
    shared.state_tx.send_replace(state);
    log::info!("Session: call finished ({})", state);
}

/// The single event-processing loop of a live call.
async fn run_call(
    ctx: &mut CallContext,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
) -> CallOutcome {
    // Force the agent to speak first rather than waiting on the human.
    tokio::time::sleep(GREETING_DELAY).await;
    if let Err(e) = ctx.session.send_turn(prompts::greeting_trigger()).await {
        log::error!("Session: greeting turn failed: {}", e);
        return CallOutcome::Failed;
    }

    let mut idle_poll = tokio::time::interval(IDLE_POLL_INTERVAL);

    loop {
        tokio::select! {
            maybe = ctx.frames.recv() => {
                let Some(frame) = maybe else {
                    log::warn!("Session: capture channel closed");
                    return CallOutcome::Ended;
                };
                if let Some(outcome) = handle_frame(ctx, shared, frame).await {
                    return outcome;
                }
            }

            maybe = ctx.events.recv() => {
                let Some(event) = maybe else {
                    return CallOutcome::Ended;
                };
                if let Some(outcome) = handle_event(ctx, shared, cancel, event).await {
                    return outcome;
                }
            }

            changed = ctx.speaking_rx.changed() => {
                if changed.is_err() {
                    return CallOutcome::Ended;
                }
                shared
                    .speaking_tx
                    .send_replace(*ctx.speaking_rx.borrow());
            }

            _ = idle_poll.tick() => {
                if *ctx.speaking_rx.borrow() {
                    // Agent speech counts as activity; never time out
                    // mid-sentence.
                    ctx.monitor.touch();
                }
                if ctx.monitor.is_idle() {
                    log::info!(
                        "Session: no activity for {:.0}s, ending call",
                        ctx.monitor.seconds_since_activity()
                    );
                    return CallOutcome::Ended;
                }
            }
        }
    }
}

/// Gate, arbitrate, and forward one capture frame.
async fn handle_frame(
    ctx: &mut CallContext,
    shared: &Arc<Shared>,
    frame: AudioFrame,
) -> Option<CallOutcome> {
    shared
        .volume_tx
        .send_replace((frame.rms() * 4.0).min(1.0));

    // Half-duplex: while the agent speaks, the frame is dropped outright.
    if !half_duplex::should_forward(*ctx.speaking_rx.borrow()) {
        return None;
    }

    let (gated, class) = ctx.gate.apply(frame);
    if class == FrameClass::Voice {
        ctx.monitor.touch();
    }

    let chunk = codec::encode(&gated);
    if let Err(e) = ctx.session.send_media(chunk).await {
        log::error!("Session: media send failed: {}", e);
        return Some(CallOutcome::Failed);
    }
    None
}

async fn handle_event(
    ctx: &mut CallContext,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    event: TransportEvent,
) -> Option<CallOutcome> {
    match event {
        TransportEvent::Audio(chunk) => {
            ctx.scheduler.submit(chunk);
            None
        }
        TransportEvent::ToolCalls(batch) => {
            let mut hang_up = false;
            for invocation in batch {
                if handle_tool_call(ctx, shared, invocation).await {
                    hang_up = true;
                }
            }
            if hang_up {
                log::info!("Session: agent requested hang-up");
                drain_goodbye(ctx, shared, cancel).await;
                Some(CallOutcome::Ended)
            } else {
                None
            }
        }
        TransportEvent::Closed => {
            log::info!("Session: transport closed");
            drain_goodbye(ctx, shared, cancel).await;
            Some(CallOutcome::Ended)
        }
        TransportEvent::Error(message) => {
            log::error!("Session: transport error: {}", message);
            Some(CallOutcome::Failed)
        }
    }
}

/// Apply one tool invocation and acknowledge it before any further event is
/// processed. Returns true when the agent asked to hang up.
async fn handle_tool_call(
    ctx: &mut CallContext,
    shared: &Arc<Shared>,
    invocation: ToolInvocation,
) -> bool {
    let mut hang_up = false;
    let response = match invocation.name.as_str() {
        UPDATE_LEAD_TOOL => match serde_json::from_value::<LeadUpdate>(invocation.args.clone()) {
            Ok(update) => {
                shared.lead_tx.send_modify(|lead| lead.merge(update));
                log::info!("Session: lead updated");
                json!({ "result": "Lead info updated" })
            }
            Err(e) => {
                log::warn!("Session: malformed lead update: {}", e);
                json!({ "error": "malformed arguments" })
            }
        },
        END_CALL_TOOL => {
            hang_up = true;
            json!({ "result": "ok" })
        }
        other => {
            log::warn!("Session: unknown tool call: {}", other);
            json!({ "error": "unknown tool" })
        }
    };

    // Acknowledgement failure is non-fatal: the local merge already
    // happened and is not rolled back.
    if let Err(e) = ctx
        .session
        .send_tool_response(&invocation.id, &invocation.name, response)
        .await
    {
        log::warn!(
            "Session: tool acknowledgement failed for {}: {}",
            invocation.name,
            e
        );
    }
    hang_up
}

/// Wait for the agent-speaking debounce to fall before tearing down, so
/// goodbye audio is not cut off. Pending audio events keep being scheduled
/// and trailing tool calls keep being acknowledged while we wait;
/// cancellation skips straight out.
async fn drain_goodbye(ctx: &mut CallContext, shared: &Arc<Shared>, cancel: &CancellationToken) {
    // The reader task drops its sender once the socket closes; stop polling
    // the event branch after that or recv() stays ready with None forever.
    let mut events_open = true;
    loop {
        let speaking = *ctx.speaking_rx.borrow_and_update();
        shared.speaking_tx.send_replace(speaking);
        if !speaking {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = ctx.speaking_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            maybe = ctx.events.recv(), if events_open => {
                match maybe {
                    Some(TransportEvent::Audio(chunk)) => ctx.scheduler.submit(chunk),
                    Some(TransportEvent::ToolCalls(batch)) => {
                        // The call is already ending; a second hang-up
                        // request changes nothing.
                        for invocation in batch {
                            handle_tool_call(ctx, shared, invocation).await;
                        }
                    }
                    Some(_) => {}
                    None => events_open = false,
                }
            }
        }
    }
}

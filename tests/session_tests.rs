//! Session controller tests against mock devices and a mock transport.

use async_trait::async_trait;
use call_agent_rs::audio::codec::{self, EncodedChunk};
use call_agent_rs::audio::sink::PlaybackSink;
use call_agent_rs::audio::{AudioFrame, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use call_agent_rs::config::CallConfig;
use call_agent_rs::error::DeviceError;
use call_agent_rs::session::devices::{CallDevices, CaptureControl};
use call_agent_rs::session::{CallState, SessionController};
use call_agent_rs::transport::{LiveSession, ToolInvocation, TransportError, TransportEvent};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Turn(String),
    Media,
    ToolResponse { id: String, name: String },
}

struct MockSessionState {
    sent: Mutex<Vec<Sent>>,
    closed: AtomicBool,
}

struct MockSession {
    state: Arc<MockSessionState>,
}

#[async_trait]
impl LiveSession for MockSession {
    async fn send_media(&mut self, _chunk: EncodedChunk) -> Result<(), TransportError> {
        self.state.sent.lock().unwrap().push(Sent::Media);
        Ok(())
    }

    async fn send_turn(&mut self, text: &str) -> Result<(), TransportError> {
        self.state
            .sent
            .lock()
            .unwrap()
            .push(Sent::Turn(text.to_string()));
        Ok(())
    }

    async fn send_tool_response(
        &mut self,
        id: &str,
        name: &str,
        _result: Value,
    ) -> Result<(), TransportError> {
        self.state.sent.lock().unwrap().push(Sent::ToolResponse {
            id: id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MockCapture {
    live: Arc<AtomicUsize>,
    open: bool,
}

impl CaptureControl for MockCapture {
    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct MockSink {
    stopped: AtomicBool,
}

impl PlaybackSink for MockSink {
    fn clock_now(&self) -> f64 {
        0.0
    }

    fn enqueue_at(&self, _frame: AudioFrame, _start: f64) {}

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// One call's worth of mock handles, exposed to the test body.
struct CallProbe {
    session: Arc<MockSessionState>,
    events: mpsc::Sender<TransportEvent>,
    frames: mpsc::Sender<AudioFrame>,
    sink: Arc<MockSink>,
}

struct MockDevices {
    deny_microphone: bool,
    capture_opens: AtomicUsize,
    live_captures: Arc<AtomicUsize>,
    probes: Mutex<Vec<CallProbe>>,
}

impl MockDevices {
    fn new() -> Arc<Self> {
        Self::with_denial(false)
    }

    fn denying_microphone() -> Arc<Self> {
        Self::with_denial(true)
    }

    fn with_denial(deny_microphone: bool) -> Arc<Self> {
        Arc::new(Self {
            deny_microphone,
            capture_opens: AtomicUsize::new(0),
            live_captures: Arc::new(AtomicUsize::new(0)),
            probes: Mutex::new(Vec::new()),
        })
    }

    /// Drop the stored event sender, as the transport reader task does once
    /// the socket closes. Any senders cloned out via `probe` must be dropped
    /// by the test for the channel to actually close.
    fn close_events(&self, index: usize) {
        self.probes.lock().unwrap()[index].events = mpsc::channel(1).0;
    }

    fn probe(&self, index: usize) -> CallProbe {
        let probes = self.probes.lock().unwrap();
        let p = &probes[index];
        CallProbe {
            session: Arc::clone(&p.session),
            events: p.events.clone(),
            frames: p.frames.clone(),
            sink: Arc::clone(&p.sink),
        }
    }
}

#[async_trait]
impl CallDevices for MockDevices {
    async fn open_capture(
        &self,
        _config: &CallConfig,
    ) -> Result<(Box<dyn CaptureControl>, mpsc::Receiver<AudioFrame>), DeviceError> {
        if self.deny_microphone {
            return Err(DeviceError::PermissionDenied("denied by user".into()));
        }
        self.capture_opens.fetch_add(1, Ordering::AcqRel);
        self.live_captures.fetch_add(1, Ordering::AcqRel);

        let (frame_tx, frame_rx) = mpsc::channel(32);
        self.probes.lock().unwrap().push(CallProbe {
            session: Arc::new(MockSessionState {
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            // Placeholder; swapped for the live sender in connect_transport.
            events: mpsc::channel(1).0,
            frames: frame_tx,
            sink: Arc::new(MockSink {
                stopped: AtomicBool::new(false),
            }),
        });

        Ok((
            Box::new(MockCapture {
                live: Arc::clone(&self.live_captures),
                open: true,
            }),
            frame_rx,
        ))
    }

    async fn open_sink(&self) -> Result<Arc<dyn PlaybackSink>, DeviceError> {
        let probes = self.probes.lock().unwrap();
        let sink = Arc::clone(&probes.last().unwrap().sink);
        Ok(sink)
    }

    async fn connect_transport(
        &self,
        _language: &str,
        _config: &CallConfig,
    ) -> Result<(Box<dyn LiveSession>, mpsc::Receiver<TransportEvent>), TransportError> {
        let (event_tx, event_rx) = mpsc::channel(32);
        let mut probes = self.probes.lock().unwrap();
        let probe = probes.last_mut().expect("capture opened before transport");
        probe.events = event_tx;

        Ok((
            Box::new(MockSession {
                state: Arc::clone(&probe.session),
            }),
            event_rx,
        ))
    }
}

fn test_config() -> CallConfig {
    CallConfig {
        idle_timeout: Duration::from_secs(60),
        speaking_debounce: Duration::from_millis(100),
        ..CallConfig::default()
    }
}

fn loud_frame() -> AudioFrame {
    AudioFrame::new(vec![0.5; 512], CAPTURE_SAMPLE_RATE)
}

fn speech_chunk(duration_secs: f64) -> EncodedChunk {
    let samples = (duration_secs * PLAYBACK_SAMPLE_RATE as f64) as usize;
    codec::encode(&AudioFrame::new(vec![0.2; samples], PLAYBACK_SAMPLE_RATE))
}

fn lead_call(id: &str, args: Value) -> ToolInvocation {
    ToolInvocation {
        id: id.to_string(),
        name: "updateLeadInfo".to_string(),
        args,
    }
}

fn hang_up_call(id: &str) -> ToolInvocation {
    ToolInvocation {
        id: id.to_string(),
        name: "endCall".to_string(),
        args: json!({}),
    }
}

fn count_media(probe: &CallProbe) -> usize {
    probe
        .session
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|s| matches!(s, Sent::Media))
        .count()
}

async fn wait_for_state(rx: &mut watch::Receiver<CallState>, wanted: CallState) {
    loop {
        if *rx.borrow_and_update() == wanted {
            return;
        }
        rx.changed().await.expect("state channel closed");
    }
}

async fn wait_for_speaking(rx: &mut watch::Receiver<bool>, wanted: bool) {
    loop {
        if *rx.borrow_and_update() == wanted {
            return;
        }
        rx.changed().await.expect("speaking channel closed");
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_call_connects_and_greets_first() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;

    // The greeting nudge goes out before any microphone media.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let probe = devices.probe(0);
    let sent = probe.session.sent.lock().unwrap().clone();
    assert!(matches!(&sent[0], Sent::Turn(text) if text.contains("start your script")));

    controller.end_call().await;
    wait_for_state(&mut events.state, CallState::Ended).await;
}

#[tokio::test(start_paused = true)]
async fn test_double_start_call_holds_one_live_handle() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;

    assert_eq!(devices.capture_opens.load(Ordering::Acquire), 2);
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 1);

    // The first attempt's transport was released too.
    assert!(devices.probe(0).session.closed.load(Ordering::Acquire));
    assert!(devices.probe(0).sink.stopped.load(Ordering::Acquire));
    assert!(!devices.probe(1).session.closed.load(Ordering::Acquire));

    controller.end_call().await;
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 0);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_is_terminal_state() {
    let devices = MockDevices::denying_microphone();
    let controller = SessionController::new(devices, test_config());
    let mut events = controller.events();

    assert!(controller.start_call("English").await.is_err());
    wait_for_state(&mut events.state, CallState::PermissionDenied).await;
}

#[tokio::test(start_paused = true)]
async fn test_tool_call_batches_accumulate_and_ack_in_order() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    probe
        .events
        .send(TransportEvent::ToolCalls(vec![lead_call(
            "call-1",
            json!({ "fullName": "Asha", "mobile": "9999" }),
        )]))
        .await
        .unwrap();
    probe
        .events
        .send(TransportEvent::ToolCalls(vec![lead_call(
            "call-2",
            json!({ "location": "Pune" }),
        )]))
        .await
        .unwrap();

    // Wait until the second merge is visible.
    loop {
        if events.lead.borrow_and_update().location.is_some() {
            break;
        }
        events.lead.changed().await.unwrap();
    }

    let lead = events.lead.borrow().clone();
    assert_eq!(lead.full_name.as_deref(), Some("Asha"));
    assert_eq!(lead.mobile.as_deref(), Some("9999"));
    assert_eq!(lead.location.as_deref(), Some("Pune"));

    let sent = probe.session.sent.lock().unwrap().clone();
    let acks: Vec<_> = sent
        .iter()
        .filter_map(|s| match s {
            Sent::ToolResponse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec!["call-1", "call-2"]);

    controller.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_tool_args_leave_lead_untouched() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    probe
        .events
        .send(TransportEvent::ToolCalls(vec![lead_call(
            "call-bad",
            json!({ "fullName": 42 }),
        )]))
        .await
        .unwrap();

    // The malformed call is still acknowledged so the agent can proceed.
    loop {
        let acked = probe
            .session
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|s| matches!(s, Sent::ToolResponse { id, .. } if id == "call-bad"));
        if acked {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(events.lead.borrow().is_empty());

    controller.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_mid_speech_end_call_stops_everything() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    probe
        .events
        .send(TransportEvent::Audio(speech_chunk(2.0)))
        .await
        .unwrap();
    wait_for_speaking(&mut events.agent_speaking, true).await;

    controller.end_call().await;
    wait_for_state(&mut events.state, CallState::Ended).await;

    assert!(probe.sink.stopped.load(Ordering::Acquire));
    assert!(probe.session.closed.load(Ordering::Acquire));
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 0);
    assert!(!*events.agent_speaking.borrow());
    assert_eq!(*events.volume.borrow(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_half_duplex_drops_mic_frames_while_agent_speaks() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    // Quiet channel: a loud frame goes out as media.
    probe.frames.send(loud_frame()).await.unwrap();
    loop {
        if count_media(&probe) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Agent speaking: frames are dropped, not sent.
    probe
        .events
        .send(TransportEvent::Audio(speech_chunk(5.0)))
        .await
        .unwrap();
    wait_for_speaking(&mut events.agent_speaking, true).await;

    probe.frames.send(loud_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count_media(&probe), 1);

    controller.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_ends_call_exactly_once() {
    let devices = MockDevices::new();
    let config = CallConfig {
        idle_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let controller = SessionController::new(devices.clone(), config);
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;

    // Nothing touches the activity clock; the 1Hz poll trips the timeout.
    wait_for_state(&mut events.state, CallState::Ended).await;
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 0);

    // And it stays ended; no second transition fires.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(*events.state.borrow(), CallState::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_lands_in_error_state() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;

    devices
        .probe(0)
        .events
        .send(TransportEvent::Error("socket reset".into()))
        .await
        .unwrap();

    wait_for_state(&mut events.state, CallState::Error).await;
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_ends_call() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;

    devices
        .probe(0)
        .events
        .send(TransportEvent::Closed)
        .await
        .unwrap();

    wait_for_state(&mut events.state, CallState::Ended).await;
    assert_eq!(devices.live_captures.load(Ordering::Acquire), 0);
}

#[tokio::test(start_paused = true)]
async fn test_goodbye_drain_survives_event_channel_closing() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let CallProbe {
        session,
        events: event_tx,
        frames: _frames,
        sink: _sink,
    } = devices.probe(0);

    // Goodbye audio, remote close, then the reader drops its sender, as the
    // production read loop does when the socket closes. The capture side
    // stays open so only the event channel ends.
    event_tx
        .send(TransportEvent::Audio(speech_chunk(1.0)))
        .await
        .unwrap();
    wait_for_speaking(&mut events.agent_speaking, true).await;
    event_tx.send(TransportEvent::Closed).await.unwrap();
    devices.close_events(0);
    drop(event_tx);

    // The drain must still finish once the speaking debounce falls.
    wait_for_state(&mut events.state, CallState::Ended).await;
    assert!(!*events.agent_speaking.borrow());
    assert!(session.closed.load(Ordering::Acquire));
}

#[tokio::test(start_paused = true)]
async fn test_tool_calls_during_goodbye_are_acknowledged() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    // A summary update trails in behind the hang-up request, while the
    // goodbye audio is still sounding.
    probe
        .events
        .send(TransportEvent::Audio(speech_chunk(2.0)))
        .await
        .unwrap();
    wait_for_speaking(&mut events.agent_speaking, true).await;
    probe
        .events
        .send(TransportEvent::ToolCalls(vec![hang_up_call("call-bye")]))
        .await
        .unwrap();
    probe
        .events
        .send(TransportEvent::ToolCalls(vec![lead_call(
            "call-late",
            json!({ "summary": "Wants a round diamond" }),
        )]))
        .await
        .unwrap();

    wait_for_state(&mut events.state, CallState::Ended).await;

    assert_eq!(
        events.lead.borrow().summary.as_deref(),
        Some("Wants a round diamond")
    );
    let sent = probe.session.sent.lock().unwrap().clone();
    assert!(sent
        .iter()
        .any(|s| matches!(s, Sent::ToolResponse { id, .. } if id == "call-late")));
}

#[tokio::test(start_paused = true)]
async fn test_agent_hang_up_waits_for_goodbye_audio() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    // Goodbye audio, then the hang-up tool call.
    probe
        .events
        .send(TransportEvent::Audio(speech_chunk(1.0)))
        .await
        .unwrap();
    wait_for_speaking(&mut events.agent_speaking, true).await;
    probe
        .events
        .send(TransportEvent::ToolCalls(vec![hang_up_call("call-bye")]))
        .await
        .unwrap();

    wait_for_state(&mut events.state, CallState::Ended).await;
    assert!(!*events.agent_speaking.borrow());

    let sent = probe.session.sent.lock().unwrap().clone();
    assert!(sent
        .iter()
        .any(|s| matches!(s, Sent::ToolResponse { id, .. } if id == "call-bye")));
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_lead_after_ended() {
    let devices = MockDevices::new();
    let controller = SessionController::new(devices.clone(), test_config());
    let mut events = controller.events();

    controller.start_call("English").await.unwrap();
    wait_for_state(&mut events.state, CallState::Connected).await;
    let probe = devices.probe(0);

    probe
        .events
        .send(TransportEvent::ToolCalls(vec![lead_call(
            "call-1",
            json!({ "fullName": "Asha" }),
        )]))
        .await
        .unwrap();
    loop {
        if events.lead.borrow_and_update().full_name.is_some() {
            break;
        }
        events.lead.changed().await.unwrap();
    }

    controller.end_call().await;
    wait_for_state(&mut events.state, CallState::Ended).await;

    // The lead survives the end of the call for the report view.
    assert!(events.lead.borrow().full_name.is_some());

    // Reset clears it and returns to the idle state.
    controller.reset().await;
    wait_for_state(&mut events.state, CallState::Disconnected).await;
    assert!(events.lead.borrow().is_empty());
}

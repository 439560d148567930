//! Playback scheduling.
//!
//! Inbound chunks are stamped with a sequence number the moment they arrive
//! from the transport. Decodes run as independent tasks and may finish out
//! of order; results are funneled through one channel and reordered by
//! sequence before anything reaches the sink, so chunk *n+1* never starts
//! before chunk *n* even when its decode finished first. A chunk that fails
//! to decode is logged and dropped but still advances the sequence, so one
//! bad payload cannot stall the whole queue.
//!
//! The scheduler is the only writer of the `is_agent_speaking` flag. The
//! flag rises when a chunk is scheduled and falls only after a debounce
//! delay past the last chunk's end, so rapid-fire chunks do not flicker it.

use crate::audio::codec::{self, EncodedChunk};
use crate::audio::sink::PlaybackSink;
use crate::audio::AudioFrame;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default delay between the last chunk's scheduled end and the speaking
/// flag dropping.
pub const DEFAULT_SPEAKING_DEBOUNCE: Duration = Duration::from_millis(250);

const DECODED_CHANNEL_CAPACITY: usize = 64;

/// Monotonically advancing "next start time" cursor on the device clock.
#[derive(Debug)]
pub struct ScheduleCursor {
    next_start: f64,
}

impl ScheduleCursor {
    pub fn new(now: f64) -> Self {
        Self { next_start: now }
    }

    /// Reserve a start time for a chunk of the given duration. If the cursor
    /// fell behind the device clock (underrun), it is clamped forward to
    /// `now` first; otherwise the chunk lands exactly at the previous
    /// chunk's end.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        if self.next_start < now {
            self.next_start = now;
        }
        let start = self.next_start;
        self.next_start += duration;
        start
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

/// Feed side of the scheduler, held by the transport event loop. Sequence
/// numbers are assigned here, in arrival order.
pub struct SchedulerHandle {
    next_seq: u64,
    decoded_tx: mpsc::Sender<(u64, Option<AudioFrame>)>,
}

impl SchedulerHandle {
    /// Submit a chunk for decode and eventual playback. Must be called in
    /// transport arrival order.
    pub fn submit(&mut self, chunk: EncodedChunk) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let tx = self.decoded_tx.clone();
        tokio::spawn(async move {
            let decoded = tokio::task::spawn_blocking(move || codec::decode(&chunk)).await;
            let frame = match decoded {
                Ok(Ok(frame)) => Some(frame),
                Ok(Err(e)) => {
                    log::warn!("Playback: dropping undecodable chunk {}: {}", seq, e);
                    None
                }
                Err(e) => {
                    log::warn!("Playback: decode task for chunk {} failed: {}", seq, e);
                    None
                }
            };
            // Failed decodes still advance the sequence; a closed channel
            // means the call is over and the result is moot.
            let _ = tx.send((seq, frame)).await;
        });
    }
}

/// Spawn the scheduler task. Returns the submit handle and the single-writer
/// speaking flag.
pub fn spawn_scheduler(
    sink: Arc<dyn PlaybackSink>,
    debounce: Duration,
    cancel: CancellationToken,
) -> (SchedulerHandle, watch::Receiver<bool>) {
    let (decoded_tx, decoded_rx) = mpsc::channel(DECODED_CHANNEL_CAPACITY);
    let (speaking_tx, speaking_rx) = watch::channel(false);

    tokio::spawn(run_scheduler(sink, debounce, cancel, decoded_rx, speaking_tx));

    (
        SchedulerHandle {
            next_seq: 0,
            decoded_tx,
        },
        speaking_rx,
    )
}

async fn run_scheduler(
    sink: Arc<dyn PlaybackSink>,
    debounce: Duration,
    cancel: CancellationToken,
    mut decoded_rx: mpsc::Receiver<(u64, Option<AudioFrame>)>,
    speaking_tx: watch::Sender<bool>,
) {
    let mut cursor = ScheduleCursor::new(sink.clock_now());
    let mut pending: BTreeMap<u64, Option<AudioFrame>> = BTreeMap::new();
    let mut next_expected: u64 = 0;
    // Armed while the speaking flag is up; re-armed on every scheduled chunk.
    let mut quiet_deadline: Option<Instant> = None;

    loop {
        let deadline = quiet_deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = cancel.cancelled() => break,

            maybe = decoded_rx.recv() => {
                let Some((seq, frame)) = maybe else { break };
                pending.insert(seq, frame);

                // Drain strictly in sequence order, holes stall the drain.
                while let Some(frame) = pending.remove(&next_expected) {
                    next_expected += 1;
                    let Some(frame) = frame else { continue };

                    let now = sink.clock_now();
                    let duration = frame.duration_secs();
                    let start = cursor.schedule(now, duration);
                    let end = start + duration;
                    sink.enqueue_at(frame, start);

                    if speaking_tx.send(true).is_err() {
                        return;
                    }
                    let until_end = (end - sink.clock_now()).max(0.0);
                    quiet_deadline =
                        Some(Instant::now() + Duration::from_secs_f64(until_end) + debounce);
                }
            }

            _ = tokio::time::sleep_until(deadline), if quiet_deadline.is_some() => {
                quiet_deadline = None;
                if speaking_tx.send(false).is_err() {
                    return;
                }
            }
        }
    }

    let _ = speaking_tx.send(false);
    log::debug!("Playback: scheduler stopped");
}

//! Effect runner for the recording lifecycle
//!
//! This module executes effects produced by the state machine. Effects run
//! in order on the state loop and are awaited, so a cancelled tick task has
//! been joined before the loop accepts the next event. Ticks and playback
//! completion are fed back to the loop through an `EventSink`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::playback::{PlaybackEnd, PlaybackEngine, PlaybackTicket};
use crate::audio::{AmplitudeRingBuffer, CaptureEngine};
use crate::clip::RecordedClip;
use crate::error::Result;
use crate::lifecycle::Envelope;
use crate::notify::{Notification, Notifier};
use crate::state_machine::{Effect, Event};

/// Default lifecycle tick period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one effect.
#[derive(Debug)]
pub enum EffectOutput {
    Done,
    /// The engine refused the request (e.g. a capture was already active)
    Rejected,
    /// A capture stopped; `None` if nothing was recording.
    Clip(Option<RecordedClip>),
}

/// Sends internally generated events back into the state loop.
///
/// Holds a weak sender so background tasks never keep the loop alive.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::WeakSender<Envelope>,
}

impl EventSink {
    pub fn new(tx: &mpsc::Sender<Envelope>) -> Self {
        Self {
            tx: tx.downgrade(),
        }
    }

    /// Deliver `event`; false once the loop is gone.
    pub async fn send(&self, event: Event) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(Envelope::internal(event)).await.is_ok(),
            None => false,
        }
    }
}

/// Trait for running effects on the state loop.
pub trait EffectRunner: Send + 'static {
    fn run(
        &mut self,
        effect: Effect,
        events: &EventSink,
    ) -> impl Future<Output = Result<EffectOutput>> + Send;

    /// Release every background task and device. Called once when the loop ends.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// A supervised background task.
struct TaskSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskSlot {
    async fn cancel_and_join(self, what: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::error!("{} task failed: {}", what, e);
        }
    }
}

/// Effect runner driving the capture and playback engines.
pub struct AudioEffectRunner {
    capture: Arc<CaptureEngine>,
    playback: Arc<PlaybackEngine>,
    notifier: Notifier,
    amplitude: Arc<AmplitudeRingBuffer>,
    tick_interval: Duration,
    tick: Option<TaskSlot>,
    watcher: Option<TaskSlot>,
}

impl AudioEffectRunner {
    pub fn new(
        capture: Arc<CaptureEngine>,
        playback: Arc<PlaybackEngine>,
        notifier: Notifier,
        amplitude: Arc<AmplitudeRingBuffer>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            capture,
            playback,
            notifier,
            amplitude,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            tick: None,
            watcher: None,
        }
    }

    async fn cancel_tick(&mut self) {
        if let Some(tick) = self.tick.take() {
            tick.cancel_and_join("Tick").await;
        }
    }

    async fn cancel_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.cancel_and_join("Playback watcher").await;
        }
    }

    fn start_tick(&mut self, id: Uuid, events: &EventSink) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.tick_interval;
        let events = events.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = Instant::now();
                let step = now - last;
                last = now;

                // Never block on a full channel once cancelled
                let delivered = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    delivered = events.send(Event::Tick { id, step }) => delivered,
                };
                if !delivered {
                    log::debug!("Tick {} stopping - loop closed", id);
                    break;
                }
            }
            log::debug!("Tick {} stopped", id);
        });

        self.tick = Some(TaskSlot { cancel, handle });
    }

    fn watch_playback(&mut self, id: Uuid, ticket: PlaybackTicket, events: &EventSink) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let playback = Arc::clone(&self.playback);
        let events = events.clone();

        let handle = tokio::spawn(async move {
            let end = playback.wait(&ticket, &token).await;
            log::debug!("Playback {} ended: {:?}", id, end);
            if end == PlaybackEnd::Finished {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = events.send(Event::PlaybackFinished { id }) => {}
                }
            }
        });

        self.watcher = Some(TaskSlot { cancel, handle });
    }

    async fn start_playback(
        &mut self,
        id: Uuid,
        path: &std::path::Path,
        from: Duration,
        events: &EventSink,
    ) -> Result<EffectOutput> {
        self.cancel_watcher().await;
        let ticket = self.playback.start(path, from).await?;
        self.watch_playback(id, ticket, events);
        Ok(EffectOutput::Done)
    }
}

impl EffectRunner for AudioEffectRunner {
    async fn run(&mut self, effect: Effect, events: &EventSink) -> Result<EffectOutput> {
        match effect {
            Effect::StartCapture {
                session_name,
                metadata,
            } => {
                if self.capture.start(&session_name, metadata).await? {
                    Ok(EffectOutput::Done)
                } else {
                    Ok(EffectOutput::Rejected)
                }
            }

            Effect::StopCapture => Ok(EffectOutput::Clip(self.capture.stop().await?)),

            Effect::StartPlayback { id, path, from } => {
                self.start_playback(id, &path, from, events).await
            }

            Effect::PausePlayback => {
                if !self.playback.pause() {
                    log::warn!("Pause requested but no stream is playing");
                }
                Ok(EffectOutput::Done)
            }

            Effect::ResumePlayback { id, path, from } => {
                if self.playback.resume() {
                    Ok(EffectOutput::Done)
                } else {
                    log::info!("Paused stream is gone, reopening {:?} at {:?}", path, from);
                    self.start_playback(id, &path, from, events).await
                }
            }

            Effect::StopPlayback => {
                self.cancel_watcher().await;
                self.playback.stop();
                Ok(EffectOutput::Done)
            }

            Effect::SeekPlayback { position } => {
                if !self.playback.seek(position)? {
                    log::debug!("Seek to {:?} with no open stream", position);
                }
                Ok(EffectOutput::Done)
            }

            Effect::StartTick { id } => {
                self.cancel_tick().await;
                self.start_tick(id, events);
                Ok(EffectOutput::Done)
            }

            Effect::CancelTick => {
                self.cancel_tick().await;
                Ok(EffectOutput::Done)
            }

            Effect::PublishTime { elapsed } => {
                self.notifier.publish(Notification::TimeUpdated(elapsed));
                Ok(EffectOutput::Done)
            }

            Effect::PublishAmplitude => {
                self.notifier
                    .publish(Notification::AmplitudeUpdated(self.amplitude.latest()));
                Ok(EffectOutput::Done)
            }

            Effect::EmitState { .. } => {
                // Handled in the state loop, not here
                log::warn!("EmitState reached the effect runner");
                Ok(EffectOutput::Done)
            }
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_tick().await;
        self.cancel_watcher().await;
        self.playback.stop();
        match self.capture.stop().await {
            Ok(Some(clip)) => log::warn!(
                "Capture finalized during shutdown without an owner: {:?}",
                clip.file_path
            ),
            Ok(None) => {}
            Err(e) => log::error!("Capture cleanup failed during shutdown: {}", e),
        }
    }
}

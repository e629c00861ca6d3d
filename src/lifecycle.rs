//! Recording lifecycle coordinator
//!
//! One state loop task owns the lifecycle `State`. Callers talk to it through
//! a cloneable `LifecycleHandle`; every request is an event carrying a reply
//! channel, so transitions are serialized and each caller learns whether its
//! request was accepted. The loop ends on `Exit` or once every handle is gone.

use std::mem::discriminant;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::playback::probe_duration;
use crate::audio::AmplitudeRingBuffer;
use crate::clip::{Metadata, RecordedClip};
use crate::effects::{EffectOutput, EffectRunner, EventSink};
use crate::error::{AudioError, Result};
use crate::notify::{Notification, Notifier, Subscription};
use crate::state_machine::{reduce, Effect, Event, LifecycleState, SeekTarget, State};

/// Capacity of the event channel feeding the state loop.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What a request did.
#[derive(Debug, Default)]
pub struct Outcome {
    /// False when the event changed nothing (wrong state, repeated request).
    pub accepted: bool,
    /// The finished clip, when the event stopped a recording.
    pub clip: Option<RecordedClip>,
}

/// An event on its way to the state loop.
pub struct Envelope {
    event: Event,
    reply: Option<oneshot::Sender<Result<Outcome>>>,
}

impl Envelope {
    /// Event generated inside the coordinator; nobody waits for the outcome.
    pub(crate) fn internal(event: Event) -> Self {
        Self { event, reply: None }
    }
}

/// Point-in-time view of the coordinator for pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    /// Elapsed recording time or playback cursor as of the last event.
    pub elapsed: Duration,
    /// Clip being played or paused.
    pub clip_path: Option<PathBuf>,
    pub clip_duration: Option<Duration>,
}

impl StatusSnapshot {
    fn of(state: &State) -> Self {
        let clip_path = match state {
            State::Playing { path, .. } | State::Paused { path, .. } => Some(path.clone()),
            _ => None,
        };
        Self {
            state: state.lifecycle(),
            elapsed: state.elapsed(),
            clip_path,
            clip_duration: state.clip_duration(),
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::of(&State::Idle)
    }
}

/// Effects whose failure means the transition did not happen.
fn is_fallible(effect: &Effect) -> bool {
    matches!(
        effect,
        Effect::StartCapture { .. }
            | Effect::StartPlayback { .. }
            | Effect::ResumePlayback { .. }
            | Effect::SeekPlayback { .. }
    )
}

/// Run the state loop until `Exit` or until every sender is dropped.
async fn run_state_loop<R: EffectRunner>(
    mut rx: mpsc::Receiver<Envelope>,
    events: EventSink,
    mut runner: R,
    notifier: Notifier,
    status: watch::Sender<StatusSnapshot>,
) {
    let mut state = State::default();
    let mut published = LifecycleState::Idle;

    // Emit initial state
    notifier.publish(Notification::StateChanged(published));
    log::info!("State loop started");

    while let Some(Envelope { event, reply }) = rx.recv().await {
        let exit = matches!(event, Event::Exit);
        if !matches!(event, Event::Tick { .. }) {
            log::debug!("Received event: {:?}", event);
        }

        let (next, effects) = reduce(&state, event);
        let accepted = !effects.is_empty();
        let previous = std::mem::replace(&mut state, next);

        let mut clip = None;
        let mut failure: Option<AudioError> = None;
        let mut rolled_back = false;

        // Execute effects
        for effect in effects {
            if let Effect::EmitState { state: lifecycle } = effect {
                if lifecycle != published {
                    notifier.publish(Notification::StateChanged(lifecycle));
                    published = lifecycle;
                }
                continue;
            }

            let fallible = is_fallible(&effect);
            match runner.run(effect, &events).await {
                Ok(EffectOutput::Done) => {}
                Ok(EffectOutput::Clip(finished)) => clip = finished,
                Ok(EffectOutput::Rejected) => {
                    rolled_back = true;
                    break;
                }
                Err(e) if fallible => {
                    log::error!("Transition to {} failed: {}", state.lifecycle(), e);
                    failure = Some(e);
                    rolled_back = true;
                    break;
                }
                Err(e) => {
                    // Cleanup keeps going; the caller sees the first error
                    log::error!("Effect failed during {}: {}", state.lifecycle(), e);
                    failure.get_or_insert(e);
                }
            }
        }

        if rolled_back {
            state = previous;
        } else if discriminant(&previous) != discriminant(&state) {
            log::info!(
                "State transition: {} -> {}",
                previous.lifecycle(),
                state.lifecycle()
            );
        }

        status.send_replace(StatusSnapshot::of(&state));

        if let Some(reply) = reply {
            let outcome = match failure {
                Some(e) => Err(e),
                None => Ok(Outcome {
                    accepted: accepted && !rolled_back,
                    clip,
                }),
            };
            // Caller may have given up waiting
            let _ = reply.send(outcome);
        }

        if exit {
            log::info!("Exit requested, shutting down state loop");
            break;
        }
    }

    runner.shutdown().await;
    if published != LifecycleState::Idle {
        notifier.publish(Notification::StateChanged(LifecycleState::Idle));
    }
    status.send_replace(StatusSnapshot::default());
    log::info!("State loop ended");
}

/// Cloneable front door of the coordinator.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<Envelope>,
    status: watch::Receiver<StatusSnapshot>,
    notifier: Notifier,
    amplitude: Arc<AmplitudeRingBuffer>,
}

impl LifecycleHandle {
    /// Spawn the state loop on the current runtime.
    pub fn spawn<R: EffectRunner>(
        runner: R,
        notifier: Notifier,
        amplitude: Arc<AmplitudeRingBuffer>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let events = EventSink::new(&tx);

        let task = tokio::spawn(run_state_loop(
            rx,
            events,
            runner,
            notifier.clone(),
            status_tx,
        ));

        (
            Self {
                tx,
                status: status_rx,
                notifier,
                amplitude,
            },
            task,
        )
    }

    /// Send an event and wait for the loop to finish its effects.
    pub async fn send(&self, event: Event) -> Result<Outcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                event,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| AudioError::CoordinatorClosed)?;
        reply_rx.await.map_err(|_| AudioError::CoordinatorClosed)?
    }

    /// Start recording. `Ok(false)` if not idle.
    pub async fn start_recording(&self, session_name: &str, metadata: Metadata) -> Result<bool> {
        let outcome = self
            .send(Event::StartRecording {
                session_name: session_name.to_string(),
                metadata,
            })
            .await?;
        Ok(outcome.accepted)
    }

    /// Stop recording and return the clip. `Ok(None)` if nothing was recording.
    pub async fn stop_recording(&self) -> Result<Option<RecordedClip>> {
        Ok(self.send(Event::StopRecording).await?.clip)
    }

    /// Play a clip from the start. `Ok(false)` if not idle, or if the clip is
    /// missing or empty.
    pub async fn start_playback(&self, path: &Path) -> Result<bool> {
        let seconds = probe_duration(path).await;
        if seconds <= 0.0 {
            log::warn!("Nothing to play in {:?}", path);
            return Ok(false);
        }
        let outcome = self
            .send(Event::StartPlayback {
                path: path.to_path_buf(),
                duration: Duration::from_secs_f64(seconds),
            })
            .await?;
        Ok(outcome.accepted)
    }

    pub async fn pause(&self) -> Result<bool> {
        Ok(self.send(Event::Pause).await?.accepted)
    }

    pub async fn resume(&self) -> Result<bool> {
        Ok(self.send(Event::Resume).await?.accepted)
    }

    /// Stop playback and reset the cursor.
    pub async fn stop(&self) -> Result<bool> {
        Ok(self.send(Event::Stop).await?.accepted)
    }

    pub async fn seek(&self, target: SeekTarget) -> Result<bool> {
        Ok(self.send(Event::Seek { target }).await?.accepted)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every processed event.
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    /// Chronological amplitude history for waveform rendering.
    pub fn amplitude(&self) -> Vec<f32> {
        self.amplitude.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop whatever is active and end the loop. Returns the clip if a
    /// recording was in progress.
    pub async fn shutdown(&self) -> Result<Option<RecordedClip>> {
        match self.send(Event::Exit).await {
            Ok(outcome) => Ok(outcome.clip),
            Err(AudioError::CoordinatorClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Runner that records effects and can be told to fail capture start.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        log: Arc<Mutex<Vec<Effect>>>,
        fail_capture: bool,
        shut_down: Arc<Mutex<bool>>,
    }

    impl EffectRunner for ScriptedRunner {
        async fn run(&mut self, effect: Effect, _events: &EventSink) -> Result<EffectOutput> {
            self.log.lock().push(effect.clone());
            match effect {
                Effect::StartCapture { .. } if self.fail_capture => {
                    Err(AudioError::device("unplugged"))
                }
                Effect::StopCapture => Ok(EffectOutput::Clip(None)),
                _ => Ok(EffectOutput::Done),
            }
        }

        async fn shutdown(&mut self) {
            *self.shut_down.lock() = true;
        }
    }

    fn spawn(runner: ScriptedRunner) -> (LifecycleHandle, JoinHandle<()>, Subscription) {
        let notifier = Notifier::new(64);
        let sub = notifier.subscribe();
        let (handle, task) =
            LifecycleHandle::spawn(runner, notifier, Arc::new(AmplitudeRingBuffer::new(4)));
        (handle, task, sub)
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let runner = ScriptedRunner::default();
        let (handle, _task, mut sub) = spawn(runner.clone());

        assert!(handle.start_recording("S", Metadata::new()).await.unwrap());
        assert_eq!(handle.status().state, LifecycleState::Recording);
        assert!(!handle.start_recording("S", Metadata::new()).await.unwrap());

        handle.stop_recording().await.unwrap();
        assert_eq!(handle.status().state, LifecycleState::Idle);

        let states: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Idle,
                LifecycleState::Recording,
                LifecycleState::Idle
            ]
        );

        let log = runner.log.lock();
        assert!(matches!(log[0], Effect::StartCapture { .. }));
        assert!(log.contains(&Effect::CancelTick));
    }

    #[tokio::test]
    async fn failed_capture_rolls_back_to_idle() {
        let runner = ScriptedRunner {
            fail_capture: true,
            ..Default::default()
        };
        let (handle, _task, mut sub) = spawn(runner.clone());

        let result = handle.start_recording("S", Metadata::new()).await;
        assert!(matches!(result, Err(AudioError::Device(_))));
        assert_eq!(handle.status().state, LifecycleState::Idle);

        // Nothing after the failed effect ran, and only the initial state was announced
        assert_eq!(runner.log.lock().len(), 1);
        assert_eq!(
            sub.drain(),
            vec![Notification::StateChanged(LifecycleState::Idle)]
        );
    }

    #[tokio::test]
    async fn shutdown_ends_loop_and_releases_runner() {
        let runner = ScriptedRunner::default();
        let (handle, task, _) = spawn(runner.clone());

        assert!(handle.start_recording("S", Metadata::new()).await.unwrap());
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(*runner.shut_down.lock());
        assert!(runner.log.lock().contains(&Effect::StopCapture));
        assert!(matches!(
            handle.pause().await,
            Err(AudioError::CoordinatorClosed)
        ));
        assert_eq!(handle.shutdown().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_every_handle_ends_loop() {
        let runner = ScriptedRunner::default();
        let (handle, task, _) = spawn(runner.clone());
        drop(handle);
        task.await.unwrap();
        assert!(*runner.shut_down.lock());
    }

    #[tokio::test]
    async fn missing_clip_is_not_played() {
        let (handle, _task, _) = spawn(ScriptedRunner::default());
        assert!(!handle
            .start_playback(Path::new("/nonexistent/clip.wav"))
            .await
            .unwrap());
        assert_eq!(handle.status().state, LifecycleState::Idle);
    }
}

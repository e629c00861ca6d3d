//! Recording lifecycle state machine
//!
//! This module implements the lifecycle state machine using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::clip::Metadata;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Recording,
    Paused,
    Playing,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Recording => "recording",
            LifecycleState::Paused => "paused",
            LifecycleState::Playing => "playing",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal state of the lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Recording {
        session_id: Uuid,
        session_name: String,
        started_at: Instant,
    },
    Playing {
        session_id: Uuid,
        path: PathBuf,
        duration: Duration,
        cursor: Duration,
    },
    Paused {
        session_id: Uuid,
        path: PathBuf,
        duration: Duration,
        cursor: Duration,
    },
}

impl State {
    pub fn lifecycle(&self) -> LifecycleState {
        match self {
            State::Idle => LifecycleState::Idle,
            State::Recording { .. } => LifecycleState::Recording,
            State::Playing { .. } => LifecycleState::Playing,
            State::Paused { .. } => LifecycleState::Paused,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Recording { session_id, .. }
            | State::Playing { session_id, .. }
            | State::Paused { session_id, .. } => Some(*session_id),
        }
    }

    /// Playback cursor, or elapsed recording time.
    pub fn elapsed(&self) -> Duration {
        match self {
            State::Idle => Duration::ZERO,
            State::Recording { started_at, .. } => started_at.elapsed(),
            State::Playing { cursor, .. } | State::Paused { cursor, .. } => *cursor,
        }
    }

    /// Length of the clip being played, if any.
    pub fn clip_duration(&self) -> Option<Duration> {
        match self {
            State::Playing { duration, .. } | State::Paused { duration, .. } => Some(*duration),
            _ => None,
        }
    }
}

/// Where a seek should land, resolved against the current cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Start,
    End,
    To(Duration),
    Forward(Duration),
    Backward(Duration),
}

impl SeekTarget {
    /// Resolve to an absolute position clamped to [0, duration].
    pub fn resolve(self, cursor: Duration, duration: Duration) -> Duration {
        let position = match self {
            SeekTarget::Start => Duration::ZERO,
            SeekTarget::End => duration,
            SeekTarget::To(position) => position,
            SeekTarget::Forward(step) => cursor.saturating_add(step),
            SeekTarget::Backward(step) => cursor.saturating_sub(step),
        };
        position.min(duration)
    }
}

/// Events that can trigger state transitions.
/// These are sent from the lifecycle handle, the tick task and the playback watcher.
#[derive(Debug, Clone)]
pub enum Event {
    StartRecording {
        session_name: String,
        metadata: Metadata,
    },
    StopRecording,
    /// Duration is probed before the event is sent
    StartPlayback {
        path: PathBuf,
        duration: Duration,
    },
    Pause,
    Resume,
    /// Stop playback (Playing or Paused)
    Stop,
    Seek {
        target: SeekTarget,
    },
    /// Periodic tick (includes id to prevent stale ticks)
    Tick {
        id: Uuid,
        step: Duration,
    },
    /// Playback device ran out of audio
    PlaybackFinished {
        id: Uuid,
    },
    /// Application exit requested
    Exit,
}

/// Effects to be executed after a state transition.
/// The effect runner handles these in order; fallible ones come before `EmitState`.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartCapture {
        session_name: String,
        metadata: Metadata,
    },
    StopCapture,
    StartPlayback {
        id: Uuid,
        path: PathBuf,
        from: Duration,
    },
    PausePlayback,
    /// Resume the paused stream, reopening at `from` if the device lost it
    ResumePlayback {
        id: Uuid,
        path: PathBuf,
        from: Duration,
    },
    StopPlayback,
    SeekPlayback {
        position: Duration,
    },
    /// Start sending Tick events while recording or playing
    StartTick {
        id: Uuid,
    },
    /// Cancel and join the tick task
    CancelTick,
    PublishTime {
        elapsed: Duration,
    },
    /// Republish the latest amplitude sample
    PublishAmplitude,
    EmitState {
        state: LifecycleState,
    },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore ticks and completions with stale session IDs
/// - An event that changes nothing yields no effects
/// - Leaving Recording or Playing cancels the tick before anything else
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (
            Idle,
            StartRecording {
                session_name,
                metadata,
            },
        ) => {
            let id = Uuid::new_v4();
            (
                Recording {
                    session_id: id,
                    session_name: session_name.clone(),
                    started_at: Instant::now(),
                },
                vec![
                    StartCapture {
                        session_name,
                        metadata,
                    },
                    EmitState {
                        state: LifecycleState::Recording,
                    },
                    PublishAmplitude,
                    StartTick { id },
                ],
            )
        }
        (Idle, Event::StartPlayback { path, duration }) if !duration.is_zero() => {
            let id = Uuid::new_v4();
            (
                Playing {
                    session_id: id,
                    path: path.clone(),
                    duration,
                    cursor: Duration::ZERO,
                },
                vec![
                    Effect::StartPlayback {
                        id,
                        path,
                        from: Duration::ZERO,
                    },
                    EmitState {
                        state: LifecycleState::Playing,
                    },
                    PublishAmplitude,
                    StartTick { id },
                ],
            )
        }

        // -----------------
        // Recording
        // -----------------
        (Recording { .. }, StopRecording) | (Recording { .. }, Exit) => (
            Idle,
            vec![
                CancelTick,
                StopCapture,
                EmitState {
                    state: LifecycleState::Idle,
                },
            ],
        ),
        (
            Recording {
                session_id,
                started_at,
                ..
            },
            Tick { id, .. },
        ) if *session_id == id => (
            state.clone(),
            vec![
                PublishTime {
                    elapsed: started_at.elapsed(),
                },
                PublishAmplitude,
            ],
        ),

        // -----------------
        // Playing
        // -----------------
        (
            Playing {
                session_id,
                path,
                duration,
                cursor,
            },
            Tick { id, step },
        ) if *session_id == id => {
            let cursor = cursor.saturating_add(step).min(*duration);
            (
                Playing {
                    session_id: *session_id,
                    path: path.clone(),
                    duration: *duration,
                    cursor,
                },
                vec![PublishTime { elapsed: cursor }, PublishAmplitude],
            )
        }
        (
            Playing {
                session_id,
                path,
                duration,
                cursor,
            },
            Pause,
        ) => (
            Paused {
                session_id: *session_id,
                path: path.clone(),
                duration: *duration,
                cursor: *cursor,
            },
            vec![
                CancelTick,
                PausePlayback,
                EmitState {
                    state: LifecycleState::Paused,
                },
            ],
        ),
        (Playing { session_id, .. }, PlaybackFinished { id }) if *session_id == id => {
            (Idle, stop_playback_effects())
        }

        // -----------------
        // Paused
        // -----------------
        (
            Paused {
                session_id,
                path,
                duration,
                cursor,
            },
            Resume,
        ) => (
            Playing {
                session_id: *session_id,
                path: path.clone(),
                duration: *duration,
                cursor: *cursor,
            },
            vec![
                ResumePlayback {
                    id: *session_id,
                    path: path.clone(),
                    from: *cursor,
                },
                EmitState {
                    state: LifecycleState::Playing,
                },
                PublishAmplitude,
                StartTick { id: *session_id },
            ],
        ),

        // -----------------
        // Playing / Paused
        // -----------------
        (Playing { .. } | Paused { .. }, Stop | Exit) => (Idle, stop_playback_effects()),
        (
            Playing {
                cursor, duration, ..
            }
            | Paused {
                cursor, duration, ..
            },
            Seek { target },
        ) => {
            let position = target.resolve(*cursor, *duration);
            if position == *cursor {
                return (state.clone(), vec![]);
            }
            (
                with_cursor(state, position),
                vec![
                    SeekPlayback { position },
                    PublishTime { elapsed: position },
                ],
            )
        }

        // -----------------
        // Stale ticks/completions and repeated requests: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Playing/Paused -> Idle. The cursor is dropped with the session.
fn stop_playback_effects() -> Vec<Effect> {
    vec![
        Effect::CancelTick,
        Effect::StopPlayback,
        Effect::EmitState {
            state: LifecycleState::Idle,
        },
    ]
}

fn with_cursor(state: &State, position: Duration) -> State {
    match state {
        State::Playing {
            session_id,
            path,
            duration,
            ..
        } => State::Playing {
            session_id: *session_id,
            path: path.clone(),
            duration: *duration,
            cursor: position,
        },
        State::Paused {
            session_id,
            path,
            duration,
            ..
        } => State::Paused {
            session_id: *session_id,
            path: path.clone(),
            duration: *duration,
            cursor: position,
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(cursor_ms: u64) -> (State, Uuid) {
        let id = Uuid::new_v4();
        (
            State::Playing {
                session_id: id,
                path: PathBuf::from("/tmp/test.wav"),
                duration: Duration::from_secs(10),
                cursor: Duration::from_millis(cursor_ms),
            },
            id,
        )
    }

    fn start_recording() -> Event {
        Event::StartRecording {
            session_name: "Session1".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn idle_start_recording_transitions_to_recording() {
        let (next, effects) = reduce(&State::Idle, start_recording());
        assert!(matches!(next, State::Recording { .. }));
        assert!(matches!(effects[0], Effect::StartCapture { .. }));
        assert!(effects.contains(&Effect::EmitState {
            state: LifecycleState::Recording
        }));
        assert!(effects.contains(&Effect::PublishAmplitude));

        // The tick belongs to the new session
        let id = next.session_id().unwrap();
        assert!(effects.contains(&Effect::StartTick { id }));
    }

    #[test]
    fn repeated_start_recording_is_a_no_op() {
        let (recording, _) = reduce(&State::Idle, start_recording());
        let (next, effects) = reduce(&recording, start_recording());
        assert!(matches!(next, State::Recording { .. }));
        assert_eq!(next.session_id(), recording.session_id());
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_recording_cancels_tick_first() {
        let (recording, _) = reduce(&State::Idle, start_recording());
        let (next, effects) = reduce(&recording, Event::StopRecording);
        assert!(matches!(next, State::Idle));
        assert_eq!(
            effects,
            vec![
                Effect::CancelTick,
                Effect::StopCapture,
                Effect::EmitState {
                    state: LifecycleState::Idle
                }
            ]
        );
    }

    #[test]
    fn stop_with_nothing_active_is_ignored() {
        let (next, effects) = reduce(&State::Idle, Event::StopRecording);
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());

        let (next, effects) = reduce(&State::Idle, Event::Stop);
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_tick_is_ignored() {
        let (recording, _) = reduce(&State::Idle, start_recording());
        let (next, effects) = reduce(
            &recording,
            Event::Tick {
                id: Uuid::new_v4(),
                step: Duration::from_millis(100),
            },
        );
        // Should stay in Recording, no effects
        assert!(matches!(next, State::Recording { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn recording_tick_publishes_time_and_amplitude() {
        let (recording, _) = reduce(&State::Idle, start_recording());
        let id = recording.session_id().unwrap();
        let (_, effects) = reduce(
            &recording,
            Event::Tick {
                id,
                step: Duration::from_millis(100),
            },
        );
        assert!(matches!(effects[0], Effect::PublishTime { .. }));
        assert_eq!(effects[1], Effect::PublishAmplitude);
    }

    #[test]
    fn zero_length_clip_does_not_start_playback() {
        let (next, effects) = reduce(
            &State::Idle,
            Event::StartPlayback {
                path: PathBuf::from("/tmp/empty.wav"),
                duration: Duration::ZERO,
            },
        );
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn start_playback_begins_at_zero() {
        let path = PathBuf::from("/tmp/test.wav");
        let (next, effects) = reduce(
            &State::Idle,
            Event::StartPlayback {
                path: path.clone(),
                duration: Duration::from_secs(3),
            },
        );
        let id = next.session_id().unwrap();
        assert_eq!(next.lifecycle(), LifecycleState::Playing);
        assert_eq!(
            effects[0],
            Effect::StartPlayback {
                id,
                path,
                from: Duration::ZERO
            }
        );
        assert!(effects.contains(&Effect::StartTick { id }));
    }

    #[test]
    fn playing_tick_advances_cursor_and_clamps() {
        let (state, id) = playing(9_950);
        let (next, effects) = reduce(
            &state,
            Event::Tick {
                id,
                step: Duration::from_millis(100),
            },
        );
        assert_eq!(next.elapsed(), Duration::from_secs(10));
        assert_eq!(
            effects[0],
            Effect::PublishTime {
                elapsed: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn pause_and_resume_keep_cursor_and_session() {
        let (state, id) = playing(1_500);
        let (paused, effects) = reduce(&state, Event::Pause);
        assert_eq!(paused.lifecycle(), LifecycleState::Paused);
        assert_eq!(effects[0], Effect::CancelTick);
        assert!(effects.contains(&Effect::PausePlayback));

        let (resumed, effects) = reduce(&paused, Event::Resume);
        assert_eq!(resumed.lifecycle(), LifecycleState::Playing);
        assert_eq!(resumed.session_id(), Some(id));
        assert!(matches!(
            effects[0],
            Effect::ResumePlayback { from, .. } if from == Duration::from_millis(1_500)
        ));
        assert!(effects.contains(&Effect::StartTick { id }));
    }

    #[test]
    fn pause_while_paused_is_a_no_op() {
        let (state, _) = playing(0);
        let (paused, _) = reduce(&state, Event::Pause);
        let (next, effects) = reduce(&paused, Event::Pause);
        assert_eq!(next.lifecycle(), LifecycleState::Paused);
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_from_paused_returns_to_idle() {
        let (state, _) = playing(2_000);
        let (paused, _) = reduce(&state, Event::Pause);
        let (next, effects) = reduce(&paused, Event::Stop);
        assert!(matches!(next, State::Idle));
        assert_eq!(next.elapsed(), Duration::ZERO);
        assert_eq!(effects, stop_playback_effects());
    }

    #[test]
    fn playback_finished_only_for_current_session() {
        let (state, id) = playing(0);
        let (next, effects) = reduce(
            &state,
            Event::PlaybackFinished {
                id: Uuid::new_v4(),
            },
        );
        assert_eq!(next.lifecycle(), LifecycleState::Playing);
        assert!(effects.is_empty());

        let (next, _) = reduce(&state, Event::PlaybackFinished { id });
        assert!(matches!(next, State::Idle));
    }

    #[test]
    fn seek_targets_are_clamped() {
        let cursor = Duration::from_secs(4);
        let duration = Duration::from_secs(10);
        assert_eq!(SeekTarget::Start.resolve(cursor, duration), Duration::ZERO);
        assert_eq!(SeekTarget::End.resolve(cursor, duration), duration);
        assert_eq!(
            SeekTarget::To(Duration::from_secs(30)).resolve(cursor, duration),
            duration
        );
        assert_eq!(
            SeekTarget::Forward(Duration::from_secs(5)).resolve(cursor, duration),
            Duration::from_secs(9)
        );
        assert_eq!(
            SeekTarget::Backward(Duration::from_secs(5)).resolve(cursor, duration),
            Duration::ZERO
        );
    }

    #[test]
    fn seek_moves_cursor_in_paused_state() {
        let (state, _) = playing(1_000);
        let (paused, _) = reduce(&state, Event::Pause);
        let (next, effects) = reduce(
            &paused,
            Event::Seek {
                target: SeekTarget::Forward(Duration::from_secs(2)),
            },
        );
        assert_eq!(next.lifecycle(), LifecycleState::Paused);
        assert_eq!(next.elapsed(), Duration::from_secs(3));
        assert_eq!(
            effects[0],
            Effect::SeekPlayback {
                position: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn seek_to_current_position_is_a_no_op() {
        let (state, _) = playing(0);
        let (_, effects) = reduce(
            &state,
            Event::Seek {
                target: SeekTarget::Start,
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn exit_from_recording_stops_capture() {
        let (recording, _) = reduce(&State::Idle, start_recording());
        let (next, effects) = reduce(&recording, Event::Exit);
        assert!(matches!(next, State::Idle));
        assert!(effects.contains(&Effect::StopCapture));
    }
}

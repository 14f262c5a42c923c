//! Track transitions: when they start and how the gains move.
//!
//! The engine plays on two element/graph pairs, a primary and a secondary.
//! A transition loads the next track on the secondary, ramps the gains of
//! both with an equal-power curve and then swaps their roles. This module
//! holds the parts of that which do not touch the pairs themselves:
//!
//! * the trigger policy, evaluated on every position report
//! * the ramp, which moves two [`GainHandle`]s in fixed steps
//! * the [`Orchestrator`], which tracks the one transition that may be active
//!
//! # Trigger Policy
//!
//! With `remaining` the time left of the primary:
//! * crossfade enabled: `crossfade_floor < remaining ≤ crossfade_duration`
//! * otherwise, gapless enabled:
//!   `gapless_window_end < remaining ≤ gapless_window_start`
//!
//! Each track triggers at most once.
//!
//! # Equal Power
//!
//! At progress `p` the primary is at `V·cos(p·π/2)` and the secondary at
//! `V·sin(p·π/2)`. The squares always sum to `V²`, so the perceived loudness
//! stays put while the tracks trade places.

use std::{f32::consts::FRAC_PI_2, fmt, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Transitions,
    graph::GainHandle,
    settings::AudioSettings,
    util::ToF32,
};

/// The kind of transition that triggered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Trigger {
    Crossfade,
    Gapless,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crossfade => write!(f, "crossfade"),
            Self::Gapless => write!(f, "gapless"),
        }
    }
}

/// Whether a transition should start at `current` into a track of
/// `duration`.
#[must_use]
pub fn should_trigger(
    settings: &AudioSettings,
    transitions: &Transitions,
    current: Duration,
    duration: Duration,
) -> Option<Trigger> {
    let remaining = duration.checked_sub(current)?;

    if settings.crossfade_enabled {
        return (remaining > transitions.crossfade_floor
            && remaining <= settings.crossfade_duration)
            .then_some(Trigger::Crossfade);
    }

    if settings.gapless_playback
        && remaining > transitions.gapless_window_end
        && remaining <= transitions.gapless_window_start
    {
        return Some(Trigger::Gapless);
    }

    None
}

/// Length of the transition the settings call for.
#[must_use]
pub fn fade_duration(settings: &AudioSettings, transitions: &Transitions) -> Duration {
    if settings.crossfade_enabled {
        settings.crossfade_duration
    } else {
        transitions.gapless_fade
    }
}

/// Number of gain steps for a fade of `duration`.
#[must_use]
pub fn step_count(duration: Duration, transitions: &Transitions) -> u32 {
    let steps = (duration.as_secs_f64() * f64::from(transitions.ticks_per_second)).round();
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let steps = steps.min(f64::from(u32::MAX)) as u32;
    steps.max(transitions.min_steps).max(1)
}

/// `(primary, secondary)` gains at `progress` through a fade from `volume`.
#[must_use]
pub fn equal_power(progress: f32, volume: f32) -> (f32, f32) {
    let angle = progress.clamp(0.0, 1.0) * FRAC_PI_2;
    (volume * angle.cos(), volume * angle.sin())
}

/// Steps through a fade of `duration` in `steps` equal steps.
///
/// Calls `on_step` with the progress of each step, from `0.0` right away to
/// `1.0` after `duration`. Stops early when `token` is cancelled or
/// `on_step` returns `false`. Returns whether the last step was taken.
pub async fn ramp<F>(duration: Duration, steps: u32, token: CancellationToken, mut on_step: F) -> bool
where
    F: FnMut(f32) -> bool,
{
    let steps = steps.max(1);
    let mut ticker = tokio::time::interval((duration / steps).max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    for step in 0..=steps {
        tokio::select! {
            biased;
            () = token.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        if !on_step(step.to_f32_lossy() / steps.to_f32_lossy()) {
            return false;
        }
    }

    true
}

/// Sets both gains for `progress` through a fade from `volume`.
pub fn apply_step(primary: &GainHandle, secondary: &GainHandle, volume: f32, progress: f32) {
    let (outgoing, incoming) = equal_power(progress, volume);
    primary.set(outgoing);
    secondary.set(incoming);
}

/// Whether a transition is under way, and whether the current track has
/// triggered one.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CrossfadeState {
    pub is_active: bool,
    pub triggered: bool,
}

/// Phase of an active transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    /// The next track is loading on the secondary.
    Preparing,
    /// Both tracks play and the gains are moving.
    Ramping,
}

#[derive(Debug)]
struct Fade {
    generation: u64,
    target: Url,
    phase: Phase,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Keeps track of the one transition that may be active.
///
/// Every transition gets a generation number. Work that finishes after its
/// transition was cancelled or replaced finds its generation outdated and
/// must not touch anything.
#[derive(Debug, Default)]
pub struct Orchestrator {
    state: CrossfadeState,
    fade: Option<Fade>,
    generation: u64,
}

impl Orchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> CrossfadeState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active
    }

    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.fade.as_ref().map(|fade| fade.phase)
    }

    /// The URL being faded to.
    #[must_use]
    pub fn target(&self) -> Option<&Url> {
        self.fade.as_ref().map(|fade| &fade.target)
    }

    /// Whether `generation` is the active transition.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.fade
            .as_ref()
            .is_some_and(|fade| fade.generation == generation)
    }

    /// Evaluates the trigger policy, firing at most once per track.
    pub fn check(
        &mut self,
        settings: &AudioSettings,
        transitions: &Transitions,
        current: Duration,
        duration: Duration,
    ) -> Option<Trigger> {
        if self.state.triggered || self.state.is_active {
            return None;
        }

        let trigger = should_trigger(settings, transitions, current, duration)?;
        self.state.triggered = true;
        Some(trigger)
    }

    /// Allows the current track to trigger again.
    pub fn rearm(&mut self) {
        self.state.triggered = false;
    }

    /// Starts a transition to `target`.
    ///
    /// Any active transition must be cancelled first. Returns the generation
    /// and the token that cancels the transition.
    pub fn begin(&mut self, target: Url) -> (u64, CancellationToken) {
        debug_assert!(self.fade.is_none(), "a transition is already active");
        if let Some(fade) = self.fade.take() {
            fade.token.cancel();
        }

        self.generation = self.generation.wrapping_add(1);
        let token = CancellationToken::new();
        self.fade = Some(Fade {
            generation: self.generation,
            target,
            phase: Phase::Preparing,
            token: token.clone(),
            task: None,
        });
        self.state.is_active = true;

        (self.generation, token)
    }

    /// Records that the gains are moving, driven by `task`.
    pub fn ramping(&mut self, generation: u64, task: JoinHandle<()>) {
        match self.fade.as_mut() {
            Some(fade) if fade.generation == generation => {
                fade.phase = Phase::Ramping;
                fade.task = Some(task);
            }
            _ => task.abort(),
        }
    }

    /// Cancels the active transition. Returns its phase, if there was one.
    ///
    /// The triggered flag stays, so the track does not trigger again.
    pub fn cancel(&mut self) -> Option<Phase> {
        let fade = self.fade.take()?;
        fade.token.cancel();
        self.state.is_active = false;
        Some(fade.phase)
    }

    /// Ends the active transition after the swap and starts afresh.
    pub fn finish(&mut self) {
        if let Some(fade) = self.fade.take() {
            fade.token.cancel();
        }
        self.state = CrossfadeState::default();
    }

    /// Starts afresh for a newly loaded track.
    pub fn reset(&mut self) {
        self.finish();
    }

    /// Whether a ramp task is still running.
    #[must_use]
    pub fn has_running_task(&self) -> bool {
        self.fade
            .as_ref()
            .and_then(|fade| fade.task.as_ref())
            .is_some_and(|task| !task.is_finished())
    }
}

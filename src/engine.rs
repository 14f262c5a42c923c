//! The playback engine.
//!
//! The engine plays one track at a time on a *primary* element and fades to
//! the next track on a *secondary* element. After a fade the two swap roles,
//! so the elements are reused for the whole session. All audio passes
//! through a [`ProcessingGraph`] per element. Master volume lives in the
//! graph's gain stage, never in the elements.
//!
//! # Clock
//!
//! While playing, a clock task ticks every `time_update_interval`. Each tick:
//! 1. Reports position and end of track for the primary
//! 2. Resets element volumes that something moved away from unity
//! 3. Relinks graphs that lost their destination
//! 4. Checks whether the next track is due
//!
//! The clock holds a weak reference, so it stops by itself once the last
//! engine handle is dropped.
//!
//! # Transitions
//!
//! When the next track is due the engine emits
//! [`Event::CrossfadeStart`]. The listener answers with
//! [`crossfade_to`](Engine::crossfade_to), which loads the track on the
//! secondary and moves both gains along an equal-power curve. Every step
//! is applied under the engine lock and only for the transition that is
//! still current, so a cancelled transition never touches the gains again.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crossfader::{config::Config, context::DeviceBackend, engine::Engine, http::Client, registry::Registry};
//!
//! # async fn example() -> crossfader::error::Result<()> {
//! let config = Config::default();
//! let engine = Engine::new(
//!     config.clone(),
//!     Arc::new(Registry::new()),
//!     Arc::new(DeviceBackend::new(None)),
//!     Arc::new(Client::new(&config)?),
//! )?;
//!
//! engine.load("https://example.com/track.mp3", false).await;
//! engine.play()?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{sync::mpsc::UnboundedSender, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    blob::Blob,
    capture::Captures,
    config::Config,
    context::Backend,
    crossfade::{self, CrossfadeState, Orchestrator, Phase},
    element::{LoadResult, PlaybackElement},
    error::{Error, Result},
    events::{self, Event},
    graph::{pin_unity, GainHandle, GraphOptions, ProcessingGraph, Stage},
    http::Fetch,
    registry::Registry,
    settings::{AudioSettings, AudioSettingsUpdate, EqPreset, EqSettings, EqSettingsUpdate},
    track::{parse_network_url, Track},
    util::round_volume,
};

/// Source of the master volume, consulted before every volume decision.
pub type VolumeGetter = Box<dyn Fn() -> f32 + Send + Sync>;

/// Snapshot of the playback state.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_time: Duration,
    pub duration: Option<Duration>,
    pub src: Option<Url>,
    pub volume: f32,
    pub muted: bool,
}

struct Pair {
    element: PlaybackElement,
    graph: ProcessingGraph,
}

struct PendingLoad {
    url: Url,
    token: CancellationToken,
}

struct Prefetch {
    url: Url,
    blob: Option<Blob>,
    token: CancellationToken,
}

struct State {
    primary: Pair,
    secondary: Pair,

    settings: AudioSettings,
    eq: EqSettings,

    /// Master volume as last read from the volume authority.
    volume: f32,
    volume_getter: Option<VolumeGetter>,

    /// Master volume the running fade ends at.
    fade_volume: f32,

    orchestrator: Orchestrator,
    load: Option<PendingLoad>,
    prefetch: Option<Prefetch>,

    /// Duration of the current track as known before decoding.
    duration_hint: Option<Duration>,

    listener: Option<UnboundedSender<Event>>,
    clock: Option<CancellationToken>,
    captures: Captures,
}

impl State {
    fn options(&self, config: &Config) -> GraphOptions {
        GraphOptions::new(&self.settings, &self.eq, &config.compressor)
    }

    /// Re-reads the master volume from its authority, if there is one.
    fn sync_volume(&mut self) -> f32 {
        if let Some(getter) = &self.volume_getter {
            self.volume = round_volume(getter());
        }
        self.volume
    }

    /// The URL that is loading or loaded on the primary.
    fn current_src(&self) -> Option<Url> {
        self.load
            .as_ref()
            .map(|load| load.url.clone())
            .or_else(|| self.primary.element.src())
    }

    fn duration(&self) -> Option<Duration> {
        self.primary.element.duration().or(self.duration_hint)
    }

    /// Takes the preloaded blob of `url`, if it finished downloading.
    fn take_prefetched(&mut self, url: &Url) -> Option<Blob> {
        let prefetch = self.prefetch.as_mut()?;
        if &prefetch.url != url || prefetch.blob.is_none() {
            return None;
        }
        let blob = prefetch.blob.take();
        self.prefetch = None;
        debug!("using preloaded {url}");
        blob
    }

    fn cancel_load(&mut self) {
        if let Some(load) = self.load.take() {
            debug!("cancelling load of {}", load.url);
            load.token.cancel();
        }
    }

    fn emit(&self, event: Event) {
        events::emit(self.listener.as_ref(), event);
    }
}

struct Inner {
    config: Config,
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    fetch: Arc<dyn Fetch>,
    state: Mutex<State>,
}

/// Handle to the playback engine.
///
/// Cloning is cheap and all clones control the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine with the elements of `registry`.
    ///
    /// Elements are looked up by their configured ids and only created if
    /// the registry has none yet. Nothing is bound and no audio context is
    /// created until playback starts.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the primary and secondary ids are equal.
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        fetch: Arc<dyn Fetch>,
    ) -> Result<Self> {
        if config.primary_id == config.secondary_id {
            return Err(Error::invalid_argument(format!(
                "primary and secondary element share the id {}",
                config.primary_id
            )));
        }

        let element = |id: &str| {
            registry.element(id, || {
                PlaybackElement::new(id, Arc::clone(&fetch), &config)
            })
        };
        let primary = element(&config.primary_id);
        let secondary = element(&config.secondary_id);

        let settings = config.audio.clone();
        let eq = config.equalizer.clone();
        let options = GraphOptions::new(&settings, &eq, &config.compressor);

        let state = State {
            primary: Pair {
                element: primary,
                graph: ProcessingGraph::new(options.clone(), 1.0),
            },
            secondary: Pair {
                element: secondary,
                graph: ProcessingGraph::new(options, 0.0),
            },
            settings,
            eq,
            volume: 1.0,
            volume_getter: None,
            fade_volume: 1.0,
            orchestrator: Orchestrator::new(),
            load: None,
            prefetch: None,
            duration_hint: None,
            listener: None,
            clock: None,
            captures: Captures::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                backend,
                fetch,
                state: Mutex::new(state),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Loads `url` on the primary element.
    ///
    /// Non-network URLs and the URL that is already current are skipped,
    /// the latter unless `force` is set. A newer load supersedes an older
    /// one, which then returns `Aborted` without side effects. Loading
    /// during a transition completes or cancels the transition first; the
    /// target of a ramping transition then plays already and is skipped.
    pub async fn load(&self, url: &str, force: bool) -> LoadResult {
        let Some(url) = parse_network_url(url) else {
            debug!("not loading {url}: not a network url");
            return LoadResult::Skipped;
        };
        self.load_url(url, None, force).await
    }

    /// Loads `track` on the primary element, like [`load`](Self::load).
    ///
    /// The track's duration is used until the decoder knows better.
    pub async fn load_track(&self, track: &Track, force: bool) -> LoadResult {
        self.load_url(track.stream_url().clone(), track.duration(), force)
            .await
    }

    async fn load_url(&self, url: Url, hint: Option<Duration>, force: bool) -> LoadResult {
        let (element, token, blob) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.orchestrator.is_active() {
                let swapped = state.orchestrator.phase() == Some(Phase::Ramping);
                let is_target = state.orchestrator.target() == Some(&url);
                self.complete_now(state);
                if swapped && is_target {
                    debug!("{url} is already the transition target");
                    return LoadResult::Skipped;
                }
            }

            if !force && state.current_src().as_ref() == Some(&url) {
                debug!("{url} is already loaded");
                return LoadResult::Skipped;
            }

            state.cancel_load();
            let token = CancellationToken::new();
            state.load = Some(PendingLoad {
                url: url.clone(),
                token: token.clone(),
            });

            (
                state.primary.element.clone(),
                token,
                state.take_prefetched(&url),
            )
        };

        let result = match blob {
            Some(blob) => element.load_blob(blob, &url, &token),
            None => element.load(&url, &token).await,
        };

        let mut state = self.lock();
        if token.is_cancelled() {
            return LoadResult::Aborted;
        }
        state.load = None;

        if result.is_loaded() {
            state.orchestrator.reset();
            state.duration_hint = hint;
            if state.primary.graph.is_bound() {
                pin_unity(&element);
            }
        }
        result
    }

    /// Starts or resumes playback of the primary.
    ///
    /// Creates and resumes the audio context and connects the primary to its
    /// graph if that did not happen yet.
    ///
    /// # Errors
    ///
    /// * `ContextUnavailable` if the audio output cannot be brought up
    /// * `GraphMismatch` if the primary is bound elsewhere
    /// * `FailedPrecondition` if no track is loaded, or when called outside
    ///   of a tokio runtime
    pub fn play(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let context = self
            .inner
            .registry
            .context(&self.inner.backend, &self.inner.config)?;
        context.resume();

        let options = state.options(&self.inner.config);
        let volume = state.sync_volume();
        state.primary.graph.connect(
            &context,
            &self.inner.registry,
            &state.primary.element,
            &options,
        )?;
        if state.orchestrator.phase() != Some(Phase::Ramping) {
            state.primary.graph.set_volume(volume);
        }

        state.primary.element.play()?;
        self.start_clock(state)
    }

    /// Pauses the primary. Cancels any transition first.
    pub fn pause(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        self.cancel_fade(state);
        state.primary.element.pause();
    }

    /// Pauses and rewinds the primary. Cancels pending loads and any
    /// transition.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.cancel_load();
        self.cancel_fade(state);
        state.primary.element.stop();
    }

    /// Seeks the primary to `position`, clamped to the track duration.
    ///
    /// Seeking back before the transition window lets the track trigger
    /// its transition again.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` during a transition, or while the
    /// duration is not known from the track or its decoder.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.orchestrator.is_active() {
            return Err(Error::failed_precondition("cannot seek during a crossfade"));
        }
        let duration = state
            .duration()
            .ok_or_else(|| Error::failed_precondition("duration not known yet"))?;

        let position = state.primary.element.seek(position.min(duration))?;
        let due = crossfade::should_trigger(
            &state.settings,
            &self.inner.config.transitions,
            position,
            duration,
        );
        if due.is_none() && position < duration {
            state.orchestrator.rearm();
        }

        Ok(())
    }

    /// Seeks the primary to `percent` of the track, clamped to `[0, 100]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a percentage that is not a number, and
    /// `FailedPrecondition` while the duration is unknown.
    pub fn seek_percent(&self, percent: f32) -> Result<()> {
        if percent.is_nan() {
            return Err(Error::invalid_argument("seek percentage is not a number"));
        }

        let duration = self
            .duration()
            .ok_or_else(|| Error::failed_precondition("duration not known yet"))?;
        let position = duration.mul_f32(percent.clamp(0.0, 100.0) / 100.0);
        self.seek(position)
    }

    /// Sets the master volume, clamped to `[0.0, 1.0]` and rounded to four
    /// decimals.
    ///
    /// During a fade the volume is cached and applied when the fade ends.
    /// Returns whether the gain stage of the primary changed.
    pub fn set_volume(&self, volume: f32) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        let volume = round_volume(volume);
        state.volume = volume;
        state.captures.set_volume(volume);

        if state.orchestrator.phase() == Some(Phase::Ramping) {
            trace!("volume {volume} applies after the crossfade");
            return false;
        }

        let changed = state.primary.graph.set_volume(volume);
        if changed {
            debug!("volume set to {volume}");
        }
        changed
    }

    /// The master volume, re-read from the volume authority if there is one.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.lock().sync_volume()
    }

    /// Makes `getter` the authority on the master volume.
    ///
    /// The getter is called with the engine locked and must not call back
    /// into the engine.
    pub fn set_volume_getter<F>(&self, getter: F)
    where
        F: Fn() -> f32 + Send + Sync + 'static,
    {
        let volume = {
            let mut state = self.lock();
            state.volume_getter = Some(Box::new(getter));
            state.sync_volume()
        };
        self.set_volume(volume);
    }

    /// Mutes or unmutes both elements.
    pub fn set_muted(&self, muted: bool) {
        let state = self.lock();
        state.primary.element.set_muted(muted);
        state.secondary.element.set_muted(muted);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.lock().primary.element.is_muted()
    }

    /// Applies a partial update of the audio settings and returns the
    /// result.
    ///
    /// Toggling normalization rebuilds the topology of every graph. Changes
    /// to the crossfade take effect from the next trigger on.
    pub fn update_settings(&self, update: &AudioSettingsUpdate) -> AudioSettings {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.settings.apply(update) {
            info!("normalization {}", on_off(state.settings.volume_normalization));
        }
        self.apply_options(state);
        state.settings.clone()
    }

    #[must_use]
    pub fn settings(&self) -> AudioSettings {
        self.lock().settings.clone()
    }

    /// Applies a partial update of the equalizer settings and returns the
    /// result.
    pub fn update_eq_settings(&self, update: &EqSettingsUpdate) -> EqSettings {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.eq.apply(update) {
            info!("equalizer {}", on_off(state.eq.enabled));
        }
        self.apply_options(state);
        state.eq.clone()
    }

    #[must_use]
    pub fn eq_settings(&self) -> EqSettings {
        self.lock().eq.clone()
    }

    /// Sets the band at `frequency` and switches to the custom preset.
    ///
    /// Returns the gain set after clamping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if there is no band at `frequency`.
    pub fn set_eq_band(&self, frequency: u32, gain_db: f32) -> Result<f32> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let gain_db = state.eq.gains.set(frequency, gain_db).ok_or_else(|| {
            Error::invalid_argument(format!("no equalizer band at {frequency} Hz"))
        })?;
        state.eq.preset = EqPreset::Custom;

        state.primary.graph.set_eq_band(frequency, gain_db);
        state.secondary.graph.set_eq_band(frequency, gain_db);
        state.captures.set_eq_band(frequency, gain_db);

        debug!("equalizer band {frequency} Hz set to {gain_db} dB");
        Ok(gain_db)
    }

    /// Applies the preset called `name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown preset name.
    pub fn apply_eq_preset(&self, name: &str) -> Result<()> {
        let preset: EqPreset = name.parse()?;
        self.update_eq_settings(&EqSettingsUpdate {
            preset: Some(preset),
            ..Default::default()
        });
        info!("equalizer preset {preset}");
        Ok(())
    }

    fn apply_options(&self, state: &mut State) {
        let options = state.options(&self.inner.config);
        state.primary.graph.set_options(&options);
        state.secondary.graph.set_options(&options);
        state.captures.set_options(&options);
    }

    /// Downloads `url` ahead of time, so a following load or transition to
    /// it needs no network. Failures are logged and otherwise ignored.
    pub async fn preload_next(&self, url: &str) {
        let Some(url) = parse_network_url(url) else {
            debug!("not preloading {url}: not a network url");
            return;
        };

        let token = {
            let mut state = self.lock();
            if state.prefetch.as_ref().is_some_and(|prefetch| prefetch.url == url) {
                trace!("{url} is already preloading");
                return;
            }
            if let Some(previous) = state.prefetch.take() {
                previous.token.cancel();
            }

            let token = CancellationToken::new();
            state.prefetch = Some(Prefetch {
                url: url.clone(),
                blob: None,
                token: token.clone(),
            });
            token
        };

        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => return,
            fetched = self.inner.fetch.fetch(&url) => fetched,
        };

        let mut state = self.lock();
        if token.is_cancelled() {
            return;
        }
        match fetched {
            Ok(blob) => {
                if let Some(prefetch) = state.prefetch.as_mut() {
                    debug!("preloaded {url} ({} bytes)", blob.len());
                    prefetch.blob = Some(blob);
                }
            }
            Err(e) => {
                debug!("preloading {url} failed: {e}");
                state.prefetch = None;
            }
        }
    }

    /// Fades from the current track to `track`.
    ///
    /// Loads the track on the secondary and waits up to `ready_timeout` for
    /// it to become playable. Then both elements play while the gains move
    /// along an equal-power curve. When the ramp completes, the secondary
    /// becomes the primary and [`Event::TrackChanged`] is emitted. This
    /// returns once the ramp has started.
    ///
    /// A transition that is already active is cancelled first.
    ///
    /// # Errors
    ///
    /// * `FadeFailure` if the track cannot be fetched, decoded or made
    ///   ready in time, or if the primary is not connected
    /// * `Aborted` if another transition or load superseded this one
    /// * `GraphMismatch` if the secondary is bound elsewhere
    ///
    /// After an error the primary plays on at the master volume.
    pub async fn crossfade_to(&self, track: &Track) -> Result<()> {
        let url = track.stream_url().clone();

        let (element, generation, token, blob) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            self.cancel_fade(state);
            state.cancel_load();

            let (generation, token) = state.orchestrator.begin(url.clone());
            state.secondary.element.stop();
            state.secondary.graph.silence();

            info!("fading to {track}");
            (
                state.secondary.element.clone(),
                generation,
                token,
                state.take_prefetched(&url),
            )
        };

        let ready = async {
            match blob {
                Some(blob) => element.load_blob(blob, &url, &token),
                None => element.load(&url, &token).await,
            }
        };
        let loaded = tokio::time::timeout(self.inner.config.ready_timeout, ready).await;

        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.orchestrator.is_current(generation) {
            return Err(Error::aborted(format!("crossfade to {url} superseded")));
        }

        let ready = match loaded {
            Ok(LoadResult::Loaded) => Ok(()),
            Ok(LoadResult::Failed(e)) => Err(Error::fade_failure(e)),
            Ok(other) => Err(Error::fade_failure(format!("next track {other}"))),
            Err(_) => Err(Error::fade_failure(format!(
                "next track not ready after {:.1}s",
                self.inner.config.ready_timeout.as_secs_f32()
            ))),
        };

        if let Err(e) = ready.and_then(|()| self.start_ramp(state, generation, token, track)) {
            warn!("crossfade to {url} failed: {e}");
            self.cancel_fade(state);
            return Err(e);
        }

        Ok(())
    }

    fn start_ramp(
        &self,
        state: &mut State,
        generation: u64,
        token: CancellationToken,
        track: &Track,
    ) -> Result<()> {
        let context = self
            .inner
            .registry
            .current_context()
            .ok_or_else(|| Error::fade_failure("no audio context"))?;
        if !state.primary.graph.is_connected(&state.primary.element) {
            return Err(Error::fade_failure("current track is not playing"));
        }

        let options = state.options(&self.inner.config);
        state.secondary.graph.connect(
            &context,
            &self.inner.registry,
            &state.secondary.element,
            &options,
        )?;
        state.secondary.graph.silence();

        let (Some(outgoing), Some(incoming)) = (state.primary.graph.gain(), state.secondary.graph.gain())
        else {
            return Err(Error::fade_failure("processing graph is not connected"));
        };

        pin_unity(&state.primary.element);
        state.fade_volume = state.sync_volume();
        state.secondary.element.play()?;

        let transitions = &self.inner.config.transitions;
        let duration = crossfade::fade_duration(&state.settings, transitions);
        let steps = crossfade::step_count(duration, transitions);
        debug!(
            "ramping over {:.1}s in {steps} steps to {}",
            duration.as_secs_f32(),
            track.id()
        );

        let engine = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let completed = crossfade::ramp(duration, steps, token, |progress| {
                with_engine(&engine, |engine| {
                    engine.step_fade(generation, progress, &outgoing, &incoming)
                })
                .unwrap_or(false)
            })
            .await;

            if completed {
                with_engine(&engine, |engine| engine.finish_fade(generation));
            }
        });

        state.orchestrator.ramping(generation, task);
        Ok(())
    }

    fn step_fade(
        &self,
        generation: u64,
        progress: f32,
        outgoing: &GainHandle,
        incoming: &GainHandle,
    ) -> bool {
        let state = self.lock();
        if !state.orchestrator.is_current(generation) {
            return false;
        }
        crossfade::apply_step(outgoing, incoming, state.fade_volume, progress);
        true
    }

    fn finish_fade(&self, generation: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.orchestrator.is_current(generation) {
            self.swap(state);
        }
    }

    /// Hands the primary role to the secondary.
    fn swap(&self, state: &mut State) {
        state.orchestrator.finish();
        std::mem::swap(&mut state.primary, &mut state.secondary);

        if let Some(listener) = state.secondary.element.detach() {
            state.primary.element.attach(listener);
        }

        state.primary.graph.set_volume(state.volume);
        state.secondary.graph.silence();
        state.secondary.element.stop();
        state.duration_hint = None;
        state.cancel_load();

        if let Some(src) = state.primary.element.src() {
            info!("now playing {src}");
        }
        state.emit(Event::TrackChanged);
        if let Some(duration) = state.primary.element.duration() {
            state.emit(Event::DurationChange(duration));
        }
    }

    /// Ends an active transition at once: a ramping one by swapping, one
    /// that is still loading by cancelling it.
    fn complete_now(&self, state: &mut State) {
        match state.orchestrator.phase() {
            Some(Phase::Ramping) => {
                debug!("completing crossfade early");
                self.swap(state);
            }
            Some(Phase::Preparing) => {
                self.cancel_fade(state);
            }
            None => {}
        }
    }

    fn cancel_fade(&self, state: &mut State) -> bool {
        let Some(phase) = state.orchestrator.cancel() else {
            return false;
        };

        state.secondary.graph.silence();
        state.secondary.element.stop();
        if phase == Phase::Ramping {
            state.primary.graph.set_volume(state.volume);
        }

        debug!("crossfade cancelled while {}", match phase {
            Phase::Preparing => "preparing",
            Phase::Ramping => "ramping",
        });
        true
    }

    /// Cancels the active transition, if any.
    ///
    /// The current track plays on at the master volume and does not trigger
    /// again. Returns whether a transition was active.
    pub fn cancel_crossfade(&self) -> bool {
        let mut guard = self.lock();
        self.cancel_fade(&mut guard)
    }

    #[must_use]
    pub fn crossfade_state(&self) -> CrossfadeState {
        self.lock().orchestrator.state()
    }

    #[must_use]
    pub fn is_crossfading(&self) -> bool {
        self.lock().orchestrator.is_active()
    }

    /// Whether a ramp task is still running.
    #[must_use]
    pub fn has_fade_task(&self) -> bool {
        self.lock().orchestrator.has_running_task()
    }

    /// Gain stage values of the primary and the secondary.
    #[must_use]
    pub fn gains(&self) -> (f32, f32) {
        let state = self.lock();
        let gain = |pair: &Pair| pair.graph.gain().map_or(0.0, |gain| gain.get());
        (gain(&state.primary), gain(&state.secondary))
    }

    /// Stages the primary's audio passes through, as the audio thread sees
    /// them.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.lock().primary.graph.live_stages()
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        let mut state = self.lock();
        let volume = state.sync_volume();
        PlaybackState {
            is_playing: state.primary.element.is_playing(),
            current_time: state.primary.element.current_time(),
            duration: state.duration(),
            src: state.primary.element.src(),
            volume,
            muted: state.primary.element.is_muted(),
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.lock().primary.element.is_playing()
    }

    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.lock().primary.element.current_time()
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.lock().duration()
    }

    /// Whether the primary is bound to its graph and audible.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.primary.graph.is_connected(&state.primary.element)
    }

    #[must_use]
    pub fn primary(&self) -> PlaybackElement {
        self.lock().primary.element.clone()
    }

    #[must_use]
    pub fn secondary(&self) -> PlaybackElement {
        self.lock().secondary.element.clone()
    }

    /// Sends events to `listener` from now on.
    pub fn set_event_handler(&self, listener: UnboundedSender<Event>) {
        let mut state = self.lock();
        state.secondary.element.detach();
        state.primary.element.attach(listener.clone());
        state.listener = Some(listener);
    }

    /// Processes `element` with this engine's settings and volume.
    ///
    /// Returns `false` if it was captured already.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the audio output cannot be brought
    /// up, and `GraphMismatch` if the element is bound elsewhere.
    pub fn capture(&self, element: &PlaybackElement) -> Result<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let context = self
            .inner
            .registry
            .context(&self.inner.backend, &self.inner.config)?;
        let options = state.options(&self.inner.config);
        let volume = state.sync_volume();
        state
            .captures
            .capture(&context, &self.inner.registry, element, &options, volume)
    }

    /// Stops processing the element with `id`. Returns whether it was
    /// captured.
    pub fn release(&self, id: &str) -> bool {
        self.lock().captures.release(id)
    }

    #[must_use]
    pub fn is_captured(&self, id: &str) -> bool {
        self.lock().captures.is_captured(id)
    }

    /// Stops playback and releases the audio output.
    ///
    /// Bindings stay in the registry, so an engine created later on the same
    /// registry picks up the elements again.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;

        state.cancel_load();
        if let Some(prefetch) = state.prefetch.take() {
            prefetch.token.cancel();
        }
        self.cancel_fade(state);
        if let Some(clock) = state.clock.take() {
            clock.cancel();
        }

        for pair in [&state.primary, &state.secondary] {
            pair.element.stop();
            pair.element.detach();
            pair.graph.unlink();
        }
        state.listener = None;

        info!("engine shut down");
    }

    fn start_clock(&self, state: &mut State) -> Result<()> {
        if state.clock.as_ref().is_some_and(|clock| !clock.is_cancelled()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::failed_precondition(e.to_string()))?;
        let token = CancellationToken::new();
        runtime.spawn(clock(
            Arc::downgrade(&self.inner),
            self.inner.config.time_update_interval,
            token.clone(),
        ));
        state.clock = Some(token);
        Ok(())
    }

    fn tick(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;

        // The outgoing track may run out before the ramp does. Its end stays
        // pending: the swap discards it, a cancel lets the next tick report it.
        if state.orchestrator.phase() == Some(Phase::Ramping) {
            state.primary.element.poll_time();
        } else {
            state.primary.element.poll();
        }

        for pair in [&state.primary, &state.secondary] {
            if pair.graph.is_bound() {
                pin_unity(&pair.element);
                if let Err(e) = pair.graph.relink() {
                    warn!("{}: {e}", pair.element.id());
                }
            }
        }
        state.captures.repair();

        if !state.primary.element.is_playing() {
            return;
        }
        let Some(duration) = state.duration() else {
            return;
        };

        let current = state.primary.element.current_time();
        if let Some(trigger) = state.orchestrator.check(
            &state.settings,
            &self.inner.config.transitions,
            current,
            duration,
        ) {
            info!(
                "{trigger} due at {:.1}s of {:.1}s",
                current.as_secs_f32(),
                duration.as_secs_f32()
            );
            state.emit(Event::CrossfadeStart);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Engine")
            .field("primary", &state.primary.element.id())
            .field("secondary", &state.secondary.element.id())
            .field("volume", &state.volume)
            .field("crossfade", &state.orchestrator.state())
            .finish_non_exhaustive()
    }
}

/// Runs `f` on the engine if it still exists.
fn with_engine<F, T>(inner: &Weak<Inner>, f: F) -> Option<T>
where
    F: FnOnce(&Engine) -> T,
{
    inner.upgrade().map(|inner| f(&Engine { inner }))
}

async fn clock(inner: Weak<Inner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if with_engine(&inner, Engine::tick).is_none() {
            break;
        }
    }

    trace!("clock stopped");
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

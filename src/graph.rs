//! Processing graphs: element → equalizer → compressor → gain → output.
//!
//! A graph binds one [`PlaybackElement`] to a destination of an
//! [`AudioContext`]. The binding is made once per element, through the
//! [`Registry`], and is never remade. What happens between the binding and
//! the destination is the *topology*: an ordered list of [`Stage`]s that is
//! rebuilt as a whole whenever the equalizer or normalization is switched on
//! or off. The gain stage is always present and always last.
//!
//! # Audio Thread
//!
//! The samples are processed by a [`GraphSource`] on the output thread. The
//! graph talks to it through shared [`Controls`]:
//! * the gain is an atomic, so automation never waits
//! * topology and filter parameters are published under a revision number and
//!   picked up at the next frame boundary, without ever blocking the output
//!
//! # Example
//!
//! ```rust,ignore
//! use crossfader::graph::{GraphOptions, ProcessingGraph};
//!
//! let mut graph = ProcessingGraph::new(GraphOptions::default(), 1.0);
//! graph.connect(&context, &registry, &element, &options)?;
//! assert!(graph.is_connected(&element));
//!
//! // Same value twice: the gain stage changes only once.
//! assert!(graph.set_volume(0.5));
//! assert!(!graph.set_volume(0.5));
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, TryLockError,
    },
    time::Duration,
};

use rodio::Source;

use crate::{
    context::AudioContext,
    element::{ElementSource, PlaybackElement},
    equalizer::FilterBank,
    error::{Error, Result},
    normalize::{Compressor, CompressorParams},
    registry::{Registry, SourceBinding},
    settings::{AudioSettings, EqGains, EqSettings},
    util::{round_volume, AtomicF32},
};

/// A processing stage between the source binding and the destination.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    /// The ten band filter bank.
    Equalizer,
    /// The loudness compressor.
    Compressor,
    /// Master volume and crossfade automation.
    Gain,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equalizer => write!(f, "equalizer"),
            Self::Compressor => write!(f, "compressor"),
            Self::Gain => write!(f, "gain"),
        }
    }
}

/// What a graph processes with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphOptions {
    pub eq_enabled: bool,
    pub eq_gains: EqGains,
    pub normalization: bool,
    pub compressor: CompressorParams,
}

impl GraphOptions {
    #[must_use]
    pub fn new(audio: &AudioSettings, eq: &EqSettings, compressor: &CompressorParams) -> Self {
        Self {
            eq_enabled: eq.enabled,
            eq_gains: eq.gains,
            normalization: audio.volume_normalization,
            compressor: compressor.clone(),
        }
    }

    /// Whether going from `self` to `other` changes which stages exist.
    #[must_use]
    pub fn is_structural_change(&self, other: &Self) -> bool {
        self.eq_enabled != other.eq_enabled || self.normalization != other.normalization
    }

    /// The stages these options call for, in signal order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        if self.eq_enabled {
            stages.push(Stage::Equalizer);
        }
        if self.normalization {
            stages.push(Stage::Compressor);
        }
        stages.push(Stage::Gain);
        stages
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Topology {
    stages: Vec<Stage>,
    eq_gains: EqGains,
    compressor: CompressorParams,
}

/// Parameters shared between a graph and its audio thread.
pub(crate) struct Controls {
    gain: AtomicF32,
    /// The running flag of the context the binding was made in.
    running: Arc<AtomicBool>,
    revision: AtomicU64,
    topology: Mutex<Topology>,
}

impl Controls {
    pub(crate) fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            gain: AtomicF32::new(0.0),
            running,
            revision: AtomicU64::new(0),
            topology: Mutex::new(Topology {
                stages: vec![Stage::Gain],
                ..Topology::default()
            }),
        }
    }

    fn publish(&self, stages: &[Stage], options: &GraphOptions) {
        let mut topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
        topology.stages = stages.to_vec();
        topology.eq_gains = options.eq_gains;
        topology.compressor.clone_from(&options.compressor);
        self.revision.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn stages(&self) -> Vec<Stage> {
        self.topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stages
            .clone()
    }
}

/// Handle to the gain stage of a connected graph.
///
/// Cheap to clone and safe to use from any task. Setting the gain through a
/// handle bypasses the graph's cached volume, which is what automation wants.
#[derive(Clone)]
pub struct GainHandle(Arc<Controls>);

impl GainHandle {
    #[must_use]
    pub fn get(&self) -> f32 {
        self.0.gain.load()
    }

    pub fn set(&self, gain: f32) {
        self.0.gain.store(gain);
    }
}

impl fmt::Debug for GainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GainHandle").field(&self.get()).finish()
    }
}

/// The audio side of a graph: runs an element's output through the stages.
pub struct GraphSource {
    input: ElementSource,
    controls: Arc<Controls>,

    revision: u64,
    stages: Vec<Stage>,
    filters: FilterBank,
    compressor: Compressor,
    compressor_params: CompressorParams,

    gain: f32,
    channel: usize,
    channels: u16,
    sample_rate: u32,
}

impl GraphSource {
    pub(crate) fn new(input: ElementSource, controls: Arc<Controls>) -> Self {
        let channels = input.channels();
        let sample_rate = input.sample_rate();
        let compressor_params = CompressorParams::default();

        Self {
            input,
            controls,
            revision: 0,
            stages: vec![Stage::Gain],
            filters: FilterBank::new(&EqGains::default(), sample_rate, channels),
            compressor: Compressor::new(&compressor_params, sample_rate, channels),
            compressor_params,
            gain: 0.0,
            channel: 0,
            channels,
            sample_rate,
        }
    }

    /// Picks up new parameters. Called at frame boundaries only.
    fn sync(&mut self) {
        self.gain = self.controls.gain.load();

        if self.controls.revision.load(Ordering::Acquire) == self.revision {
            return;
        }

        // Try again next frame rather than wait for the control side.
        let topology = match self.controls.topology.try_lock() {
            Ok(topology) => topology,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };

        if topology.stages.contains(&Stage::Equalizer) && !self.stages.contains(&Stage::Equalizer) {
            self.filters.reset();
        }
        self.filters.set_gains(&topology.eq_gains);

        if topology.compressor != self.compressor_params {
            self.compressor_params.clone_from(&topology.compressor);
            self.compressor = Compressor::new(&self.compressor_params, self.sample_rate, self.channels);
        } else if topology.stages.contains(&Stage::Compressor)
            && !self.stages.contains(&Stage::Compressor)
        {
            self.compressor.reset();
        }

        self.stages.clone_from(&topology.stages);
        self.revision = self.controls.revision.load(Ordering::Acquire);
    }
}

impl Iterator for GraphSource {
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.channel == 0 {
            self.sync();
        }
        let channel = self.channel;
        self.channel = (self.channel + 1) % usize::from(self.channels.max(1));

        // A suspended context pulls nothing, so the element does not advance.
        if !self.controls.running.load(Ordering::Relaxed) {
            return Some(0.0);
        }

        let mut sample = self.input.next()?;
        for stage in &self.stages {
            sample = match stage {
                Stage::Equalizer => self.filters.process(sample, channel),
                Stage::Compressor => self.compressor.process(sample, channel),
                Stage::Gain => sample * self.gain,
            };
        }

        Some(sample)
    }
}

impl Source for GraphSource {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// A processing graph for one element.
pub struct ProcessingGraph {
    options: GraphOptions,

    /// Master volume, applied to the gain stage on connect.
    volume: f32,

    binding: Option<Arc<SourceBinding>>,
    context: Option<Arc<AudioContext>>,
    stages: Vec<Stage>,
}

impl ProcessingGraph {
    #[must_use]
    pub fn new(options: GraphOptions, volume: f32) -> Self {
        Self {
            options,
            volume: round_volume(volume),
            binding: None,
            context: None,
            stages: Vec::new(),
        }
    }

    /// Connects `element` to a destination of `context`.
    ///
    /// Calling this again for the same element and context only repairs a
    /// lost link and applies `options`. The first call binds the element
    /// through `registry`, reusing an existing binding if there is one, and
    /// pins the element's own volume to unity.
    ///
    /// # Errors
    ///
    /// Returns `GraphMismatch` if this graph is bound to another element, or
    /// if `element` is bound in another context. Returns `ContextUnavailable`
    /// if a destination cannot be opened.
    pub fn connect(
        &mut self,
        context: &Arc<AudioContext>,
        registry: &Registry,
        element: &PlaybackElement,
        options: &GraphOptions,
    ) -> Result<()> {
        if let Some(binding) = &self.binding {
            if !binding.element().ptr_eq(element) {
                return Err(Error::graph_mismatch(format!(
                    "graph is bound to {}, not to {}",
                    binding.element().id(),
                    element.id()
                )));
            }
            if binding.context_id() != context.id() {
                return Err(Error::graph_mismatch(format!(
                    "{} is bound in audio context {}",
                    element.id(),
                    binding.context_id()
                )));
            }

            self.set_options(options);
            self.relink()?;
            pin_unity(element);
            return Ok(());
        }

        let binding = registry.bind(element, context)?;
        debug!("connecting {} to a processing graph", element.id());

        self.options = options.clone();
        self.binding = Some(Arc::clone(&binding));
        self.context = Some(Arc::clone(context));

        pin_unity(element);
        binding.controls().gain.store(self.volume);
        self.reconnect();
        self.relink()?;

        Ok(())
    }

    /// Rebuilds the topology from the current options.
    ///
    /// The stage list is replaced as a whole, so no stage can end up in the
    /// signal path twice.
    pub fn reconnect(&mut self) {
        let Some(binding) = &self.binding else {
            return;
        };

        let stages = self.options.stages();
        if stages != self.stages {
            debug!(
                "{}: topology {}",
                binding.element().id(),
                stages
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" → ")
            );
        }
        self.stages = stages;
        binding.controls().publish(&self.stages, &self.options);
    }

    /// Links the binding to a new destination if it lost its link.
    ///
    /// Returns whether the binding is linked afterwards. It is not while the
    /// previous destination still holds on to the audio.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if a destination cannot be opened.
    pub fn relink(&self) -> Result<bool> {
        match (&self.binding, &self.context) {
            (Some(binding), Some(context)) => binding.link(context),
            _ => Ok(false),
        }
    }

    /// Releases the destination. The binding itself stays.
    pub fn unlink(&self) {
        if let Some(binding) = &self.binding {
            binding.unlink();
        }
    }

    /// Sets the master volume, clamped to `[0.0, 1.0]` and rounded.
    ///
    /// Applies to the gain stage right away if connected, and on connect
    /// otherwise. Returns whether that changed anything.
    pub fn set_volume(&mut self, volume: f32) -> bool {
        let volume = round_volume(volume);
        let cached = std::mem::replace(&mut self.volume, volume);

        match &self.binding {
            Some(binding) => {
                let previous = binding.controls().gain.swap(volume);
                (previous - volume).abs() > f32::EPSILON
            }
            None => (cached - volume).abs() > f32::EPSILON,
        }
    }

    /// The cached master volume.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the gain stage to zero, leaving the cached volume alone.
    pub fn silence(&self) {
        if let Some(gain) = self.gain() {
            gain.set(0.0);
        }
    }

    /// The gain stage, once connected.
    #[must_use]
    pub fn gain(&self) -> Option<GainHandle> {
        self.binding
            .as_ref()
            .map(|binding| GainHandle(Arc::clone(binding.controls())))
    }

    /// Sets the gain of the band at `frequency`, clamped to ±12 dB.
    ///
    /// Returns the gain set, or `None` if there is no such band.
    pub fn set_eq_band(&mut self, frequency: u32, gain_db: f32) -> Option<f32> {
        let gain_db = self.options.eq_gains.set(frequency, gain_db)?;
        if let Some(binding) = &self.binding {
            binding.controls().publish(&self.stages, &self.options);
        }
        Some(gain_db)
    }

    /// Applies `options`, rebuilding the topology only if stages come or go.
    ///
    /// Returns whether the topology was rebuilt.
    pub fn set_options(&mut self, options: &GraphOptions) -> bool {
        let structural = self.options.is_structural_change(options);
        self.options.clone_from(options);

        if structural {
            self.reconnect();
        } else if let Some(binding) = &self.binding {
            binding.controls().publish(&self.stages, &self.options);
        }
        structural
    }

    #[must_use]
    pub fn options(&self) -> &GraphOptions {
        &self.options
    }

    /// The stages between the binding and the destination.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The stages the audio thread was handed.
    #[must_use]
    pub fn live_stages(&self) -> Vec<Stage> {
        self.binding
            .as_ref()
            .map(|binding| binding.controls().stages())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn binding(&self) -> Option<&Arc<SourceBinding>> {
        self.binding.as_ref()
    }

    /// Whether `element` is bound to this graph *and* its audio reaches a
    /// destination.
    #[must_use]
    pub fn is_connected(&self, element: &PlaybackElement) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.element().ptr_eq(element) && binding.is_linked())
    }

    /// Whether this graph is bound to any element, linked or not.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

impl fmt::Debug for ProcessingGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingGraph")
            .field("element", &self.binding.as_ref().map(|b| b.element().id().to_owned()))
            .field("volume", &self.volume)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Resets the element's own volume to unity if anything changed it.
///
/// Once bound, all volume lives in the gain stage; anything else would
/// multiply with it.
pub fn pin_unity(element: &PlaybackElement) {
    let volume = element.volume();
    if (volume - 1.0).abs() > f32::EPSILON {
        warn!(
            "{}: element volume was {volume}, resetting to unity",
            element.id()
        );
        element.set_volume(1.0);
    }
}

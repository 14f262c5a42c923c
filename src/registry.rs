//! Resources that live as long as the application: elements, their source
//! bindings and the audio context.
//!
//! An element's audio output can be taken only once, so the binding made
//! from it must be found again rather than made again. The registry is the
//! single place that knows about bindings. Every lookup happens before any
//! creation, under the same lock.
//!
//! The registry is meant to be created by the composition root and shared
//! through an `Arc` with everything that plays audio, so that an engine can
//! be torn down and recreated without losing its elements.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rodio::{Sink, Source};
use uuid::Uuid;

use crate::{
    config::Config,
    context::{AudioContext, Backend},
    element::PlaybackElement,
    error::{Error, Result},
    graph::{Controls, GraphSource},
};

/// The one-time attachment of an element to the processing of a context.
pub struct SourceBinding {
    element: PlaybackElement,
    context_id: Uuid,
    controls: Arc<Controls>,

    sink: Mutex<Option<Sink>>,

    /// The processed audio while it is not linked to a destination.
    detached: Arc<Mutex<Option<GraphSource>>>,
}

impl SourceBinding {
    #[must_use]
    pub fn element(&self) -> &PlaybackElement {
        &self.element
    }

    #[must_use]
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub(crate) fn controls(&self) -> &Arc<Controls> {
        &self.controls
    }

    fn sink(&self) -> MutexGuard<'_, Option<Sink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detached(&self) -> MutexGuard<'_, Option<GraphSource>> {
        self.detached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the audio reaches a destination.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        let sink = self.sink();
        sink.as_ref().is_some_and(|sink| !sink.empty()) && self.detached().is_none()
    }

    /// Links the audio to a new destination of `context`, unless it already
    /// is linked.
    ///
    /// Returns `false` if the audio is still held by a previous destination
    /// that has not let go of it yet.
    ///
    /// # Errors
    ///
    /// Returns `GraphMismatch` if `context` is not the context of this
    /// binding, and `ContextUnavailable` if no destination can be opened.
    pub fn link(&self, context: &AudioContext) -> Result<bool> {
        if context.id() != self.context_id {
            return Err(Error::graph_mismatch(format!(
                "{} is bound in audio context {}",
                self.element.id(),
                self.context_id
            )));
        }

        let mut sink = self.sink();
        let mut detached = self.detached();

        let Some(source) = detached.take() else {
            let linked = sink.as_ref().is_some_and(|sink| !sink.empty());
            if !linked {
                warn!("{}: output is still held by its previous destination", self.element.id());
            }
            return Ok(linked);
        };

        let destination = match context.open_destination() {
            Ok(destination) => destination,
            Err(e) => {
                *detached = Some(source);
                return Err(e);
            }
        };

        destination.append(Link {
            source: Some(source),
            home: Arc::clone(&self.detached),
        });
        if let Some(previous) = sink.replace(destination) {
            previous.stop();
        }

        debug!("{}: linked to destination", self.element.id());
        Ok(true)
    }

    /// Releases the destination. The audio returns to the binding once the
    /// destination lets go of it.
    pub fn unlink(&self) {
        if let Some(sink) = self.sink().take() {
            sink.stop();
            debug!("{}: unlinked from destination", self.element.id());
        }
    }
}

impl fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBinding")
            .field("element", &self.element.id())
            .field("context_id", &self.context_id)
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}

/// The processed audio as appended to a destination.
///
/// When the destination drops it, the audio goes back to its binding so it
/// can be linked again.
struct Link {
    source: Option<GraphSource>,
    home: Arc<Mutex<Option<GraphSource>>>,
}

impl Iterator for Link {
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.source.as_mut()?.next()
    }
}

impl Source for Link {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.source.as_ref().map_or(1, Source::channels)
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.source.as_ref().map_or(1, Source::sample_rate)
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            *self.home.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
        }
    }
}

/// Directory of elements, bindings and the audio context.
#[derive(Default)]
pub struct Registry {
    elements: Mutex<HashMap<String, PlaybackElement>>,
    bindings: Mutex<HashMap<String, Arc<SourceBinding>>>,
    context: Mutex<Option<Arc<AudioContext>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the element with `id`, or creates it with `init`.
    pub fn element<F>(&self, id: &str, init: F) -> PlaybackElement
    where
        F: FnOnce() -> PlaybackElement,
    {
        let mut elements = self.elements.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(element) = elements.get(id) {
            trace!("found element {id}");
            return element.clone();
        }

        let element = init();
        debug!("created element {id}");
        elements.insert(id.to_owned(), element.clone());
        element
    }

    /// Finds the audio context, or creates one on `backend`.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the context has to be created and the
    /// backend fails to start. The next call tries again.
    pub fn context(&self, backend: &Arc<dyn Backend>, config: &Config) -> Result<Arc<AudioContext>> {
        let mut context = self.context.lock()?;
        if let Some(context) = context.as_ref() {
            return Ok(Arc::clone(context));
        }

        let created = Arc::new(AudioContext::new(Arc::clone(backend), config)?);
        *context = Some(Arc::clone(&created));
        Ok(created)
    }

    /// The audio context, if one was created.
    #[must_use]
    pub fn current_context(&self) -> Option<Arc<AudioContext>> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The binding of the element with `id`, if it was bound.
    #[must_use]
    pub fn binding(&self, id: &str) -> Option<Arc<SourceBinding>> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of bindings ever made.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Finds the binding of `element`, or makes it in `context`.
    ///
    /// The binding is not linked to a destination yet.
    ///
    /// # Errors
    ///
    /// Returns `GraphMismatch` if the element is bound in another context,
    /// if another element with the same id is bound, or if the element's
    /// output was taken outside of the registry.
    pub(crate) fn bind(
        &self,
        element: &PlaybackElement,
        context: &AudioContext,
    ) -> Result<Arc<SourceBinding>> {
        let mut bindings = self.bindings.lock()?;

        if let Some(binding) = bindings.get(element.id()) {
            if !binding.element().ptr_eq(element) {
                return Err(Error::graph_mismatch(format!(
                    "another element with id {} is bound",
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
            trace!("reusing binding of {}", element.id());
            return Ok(Arc::clone(binding));
        }

        let tap = element.take_tap().ok_or_else(|| {
            Error::graph_mismatch(format!("output of {} is taken elsewhere", element.id()))
        })?;

        let controls = Arc::new(Controls::new(context.running_flag()));
        let binding = Arc::new(SourceBinding {
            element: element.clone(),
            context_id: context.id(),
            controls: Arc::clone(&controls),
            sink: Mutex::new(None),
            detached: Arc::new(Mutex::new(Some(GraphSource::new(tap, controls)))),
        });

        debug!("bound {} in audio context {}", element.id(), context.id());
        bindings.insert(element.id().to_owned(), Arc::clone(&binding));
        Ok(binding)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("bindings", &self.binding_count())
            .field("context", &self.current_context())
            .finish_non_exhaustive()
    }
}

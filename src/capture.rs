//! Capturing elements the engine does not own.
//!
//! Audio played by other elements, like previews, would otherwise bypass the
//! equalizer, normalization and master volume. Capturing such an element
//! connects it to a processing graph of its own on the engine's context. The
//! one-time binding rule holds for captured elements like for any other: a
//! captured element is bound through the same registry and never rebound.

use std::{collections::HashMap, sync::Arc};

use crate::{
    context::AudioContext,
    element::PlaybackElement,
    error::Result,
    graph::{pin_unity, GraphOptions, ProcessingGraph},
    registry::Registry,
};

struct Captured {
    element: PlaybackElement,
    graph: ProcessingGraph,
}

/// Captured elements and their graphs, by element id.
#[derive(Default)]
pub struct Captures {
    captured: HashMap<String, Captured>,
}

impl Captures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `element` to a graph of its own.
    ///
    /// Returns `false` if the element was captured already, in which case
    /// nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `GraphMismatch` if the element is bound in another context,
    /// and `ContextUnavailable` if no destination can be opened.
    pub fn capture(
        &mut self,
        context: &Arc<AudioContext>,
        registry: &Registry,
        element: &PlaybackElement,
        options: &GraphOptions,
        volume: f32,
    ) -> Result<bool> {
        if self
            .captured
            .get(element.id())
            .is_some_and(|captured| captured.element.ptr_eq(element))
        {
            trace!("{} is captured already", element.id());
            return Ok(false);
        }

        let mut graph = ProcessingGraph::new(options.clone(), volume);
        graph.connect(context, registry, element, options)?;

        info!("captured {}", element.id());
        self.captured.insert(
            element.id().to_owned(),
            Captured {
                element: element.clone(),
                graph,
            },
        );
        Ok(true)
    }

    /// Stops processing the element with `id`.
    ///
    /// The element stays bound and plays on unprocessed at unity gain.
    /// Returns whether it was captured.
    pub fn release(&mut self, id: &str) -> bool {
        let Some(mut captured) = self.captured.remove(id) else {
            return false;
        };

        let passthrough = GraphOptions {
            eq_enabled: false,
            normalization: false,
            ..captured.graph.options().clone()
        };
        captured.graph.set_options(&passthrough);
        captured.graph.set_volume(1.0);

        info!("released {id}");
        true
    }

    #[must_use]
    pub fn is_captured(&self, id: &str) -> bool {
        self.captured.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.captured.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    pub fn set_volume(&mut self, volume: f32) {
        for captured in self.captured.values_mut() {
            captured.graph.set_volume(volume);
        }
    }

    pub fn set_options(&mut self, options: &GraphOptions) {
        for captured in self.captured.values_mut() {
            captured.graph.set_options(options);
        }
    }

    pub fn set_eq_band(&mut self, frequency: u32, gain_db: f32) {
        for captured in self.captured.values_mut() {
            captured.graph.set_eq_band(frequency, gain_db);
        }
    }

    /// Restores unity element volume and lost links.
    pub fn repair(&self) {
        for captured in self.captured.values() {
            pin_unity(&captured.element);
            if let Err(e) = captured.graph.relink() {
                warn!("{}: {e}", captured.element.id());
            }
        }
    }

    /// The graph of the element with `id`.
    #[must_use]
    pub fn graph(&self, id: &str) -> Option<&ProcessingGraph> {
        self.captured.get(id).map(|captured| &captured.graph)
    }
}

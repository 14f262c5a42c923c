mod common;

use std::sync::Arc;

use crossfader::{
    context::{AudioContext, Backend, IdleBackend},
    element::PlaybackElement,
    error::ErrorKind,
    graph::{GraphOptions, ProcessingGraph, Stage},
    http::Fetch,
    registry::Registry,
};

use common::{config, ScriptedFetch};

struct Setup {
    registry: Registry,
    context: Arc<AudioContext>,
    backend: Arc<dyn Backend>,
    fetch: Arc<dyn Fetch>,
}

fn setup() -> Setup {
    let backend: Arc<dyn Backend> = Arc::new(IdleBackend::new());
    let registry = Registry::new();
    let context = registry.context(&backend, &config()).unwrap();
    Setup {
        registry,
        context,
        backend,
        fetch: Arc::new(ScriptedFetch::default()),
    }
}

impl Setup {
    fn element(&self, id: &str) -> PlaybackElement {
        self.registry
            .element(id, || PlaybackElement::new(id, Arc::clone(&self.fetch), &config()))
    }
}

#[test]
fn registry_finds_before_it_creates() {
    let setup = setup();
    let first = setup.element("primary");
    let second = setup.element("primary");
    assert!(first.ptr_eq(&second));
    assert!(!first.ptr_eq(&setup.element("secondary")));

    let context = setup.registry.context(&setup.backend, &config()).unwrap();
    assert!(Arc::ptr_eq(&context, &setup.context));
}

#[test]
fn second_connect_reuses_the_binding() {
    let setup = setup();
    let element = setup.element("primary");
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    graph
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();
    let binding = Arc::clone(graph.binding().unwrap());

    graph
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();
    assert!(Arc::ptr_eq(graph.binding().unwrap(), &binding));

    // A graph made later finds the same binding.
    let mut other = ProcessingGraph::new(options.clone(), 1.0);
    other
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();
    assert!(Arc::ptr_eq(other.binding().unwrap(), &binding));

    assert_eq!(setup.registry.binding_count(), 1);
    assert!(element.is_tapped());
    assert!(graph.is_connected(&element));
}

#[test]
fn graph_stays_with_its_element() {
    let setup = setup();
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    graph
        .connect(&setup.context, &setup.registry, &setup.element("primary"), &options)
        .unwrap();

    let error = graph
        .connect(&setup.context, &setup.registry, &setup.element("secondary"), &options)
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::GraphMismatch);
    assert_eq!(setup.registry.binding_count(), 1);
}

#[test]
fn element_stays_with_its_context() {
    let setup = setup();
    let element = setup.element("primary");
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    graph
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();

    let elsewhere = Arc::new(AudioContext::new(Arc::clone(&setup.backend), &config()).unwrap());
    let mut other = ProcessingGraph::new(options.clone(), 1.0);
    let error = other
        .connect(&elsewhere, &setup.registry, &element, &options)
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::GraphMismatch);

    let error = graph
        .connect(&elsewhere, &setup.registry, &element, &options)
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::GraphMismatch);
}

#[test]
fn same_id_different_element_is_rejected() {
    let setup = setup();
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    graph
        .connect(&setup.context, &setup.registry, &setup.element("primary"), &options)
        .unwrap();

    let impostor = PlaybackElement::new("primary", Arc::clone(&setup.fetch), &config());
    let mut other = ProcessingGraph::new(options.clone(), 1.0);
    let error = other
        .connect(&setup.context, &setup.registry, &impostor, &options)
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::GraphMismatch);
    assert!(!impostor.is_tapped());
}

#[test]
fn topology_follows_the_options() {
    let setup = setup();
    let element = setup.element("primary");
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    graph
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();
    assert_eq!(graph.stages(), [Stage::Gain]);

    let processed = GraphOptions {
        eq_enabled: true,
        normalization: true,
        ..options.clone()
    };
    assert!(graph.set_options(&processed));
    assert!(!graph.set_options(&processed));
    assert_eq!(
        graph.stages(),
        [Stage::Equalizer, Stage::Compressor, Stage::Gain]
    );
    assert_eq!(graph.live_stages(), graph.stages());

    assert_eq!(graph.set_eq_band(64, 3.0), Some(3.0));
    let retuned = GraphOptions {
        eq_gains: graph.options().eq_gains,
        ..processed
    };
    assert!(!graph.set_options(&retuned));
    assert_eq!(graph.options().eq_gains.get(64), Some(3.0));

    assert!(graph.set_options(&options));
    assert_eq!(graph.stages(), [Stage::Gain]);
}

#[test]
fn volume_is_cached_until_connected() {
    let setup = setup();
    let element = setup.element("primary");
    let options = GraphOptions::default();

    let mut graph = ProcessingGraph::new(options.clone(), 1.0);
    assert!(graph.gain().is_none());
    assert!(graph.set_volume(0.25));
    assert!(!graph.set_volume(0.25));

    element.set_volume(0.6);
    graph
        .connect(&setup.context, &setup.registry, &element, &options)
        .unwrap();
    assert_eq!(graph.gain().unwrap().get(), 0.25);
    assert_eq!(element.volume(), 1.0);

    graph.silence();
    assert_eq!(graph.gain().unwrap().get(), 0.0);
    assert_eq!(graph.volume(), 0.25);
}

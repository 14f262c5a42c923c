#![allow(dead_code)]

use std::{
    collections::HashMap,
    f32::consts::TAU,
    io::Cursor,
    sync::{Arc, Mutex},
    time::Duration,
};

use rodio::queue::SourcesQueueOutput;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use url::Url;

use crossfader::{
    blob::Blob,
    config::Config,
    context::{Backend, IdleBackend},
    engine::Engine,
    error::Error,
    events::Event,
    http::{Fetch, FetchFuture},
    registry::Registry,
    settings::AudioSettings,
};

pub const SAMPLE_RATE: u32 = 8_000;

/// Peak of the test tone.
pub const AMPLITUDE: f32 = 0.5;

pub const A: &str = "https://cdn.test/a.wav";
pub const B: &str = "https://cdn.test/b.wav";
pub const C: &str = "https://cdn.test/c.wav";

/// Small output format so rendering seconds of audio stays cheap.
pub fn config() -> Config {
    Config {
        sample_rate: SAMPLE_RATE,
        channels: 1,
        time_update_interval: Duration::from_millis(100),
        ready_timeout: Duration::from_secs(2),
        audio: AudioSettings {
            crossfade_enabled: true,
            crossfade_duration: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A mono 440 Hz tone of `seconds`, as a WAV file.
pub fn tone(seconds: f32) -> Blob {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    let samples = (seconds * SAMPLE_RATE as f32) as u32;
    for i in 0..samples {
        let t = i as f32 / SAMPLE_RATE as f32;
        let sample = (TAU * 440.0 * t).sin() * AMPLITUDE;
        writer.write_sample((sample * f32::from(i16::MAX)) as i16).unwrap();
    }
    writer.finalize().unwrap();

    Blob::new(cursor.into_inner(), Some("audio/wav".to_owned()))
}

/// A FLAC stream that does not state its length.
///
/// Stream info with a total of zero samples, then the header of a single
/// frame. Enough to probe; not meant to be played.
pub fn unknown_length() -> Blob {
    let mut bytes = b"fLaC".to_vec();

    // The last metadata block: 34 bytes of stream info.
    bytes.extend([0x80, 0x00, 0x00, 34]);
    bytes.extend(256_u16.to_be_bytes());
    bytes.extend(256_u16.to_be_bytes());
    bytes.extend([0; 6]);
    // Sample rate, mono, 16 bits and zero total samples.
    let format = (u64::from(SAMPLE_RATE) << 44) | (15 << 36);
    bytes.extend(format.to_be_bytes());
    bytes.extend([0; 16]);

    // Fixed blocking, 256 samples, rate and width from the stream info.
    let header = [0xff, 0xf8, 0x80, 0x08, 0x00];
    bytes.extend(header);
    bytes.push(crc8(&header));
    bytes.extend([0; 64]);

    Blob::new(bytes, Some("audio/flac".to_owned()))
}

fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |crc, byte| {
        (0..8).fold(crc ^ byte, |crc, _| {
            if crc & 0x80 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x07
            }
        })
    })
}

#[derive(Clone)]
enum Route {
    Audio { blob: Blob, delay: Duration },
    Gone,
}

/// A fetcher that answers from a script and counts requests.
#[derive(Default)]
pub struct ScriptedFetch {
    routes: Mutex<HashMap<String, Route>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetch {
    /// Serves a tone of `seconds` at `url` after `delay`.
    pub fn audio(&self, url: &str, seconds: f32, delay: Duration) {
        let route = Route::Audio {
            blob: tone(seconds),
            delay,
        };
        self.routes.lock().unwrap().insert(key(url), route);
    }

    /// Serves `blob` at `url` right away.
    pub fn serve(&self, url: &str, blob: Blob) {
        let route = Route::Audio {
            blob,
            delay: Duration::ZERO,
        };
        self.routes.lock().unwrap().insert(key(url), route);
    }

    /// Answers `url` with 410 Gone.
    pub fn gone(&self, url: &str) {
        self.routes.lock().unwrap().insert(key(url), Route::Gone);
    }

    pub fn count(&self, url: &str) -> usize {
        self.counts.lock().unwrap().get(&key(url)).copied().unwrap_or(0)
    }
}

fn key(url: &str) -> String {
    Url::parse(url).unwrap().to_string()
}

impl Fetch for ScriptedFetch {
    fn fetch<'a>(&'a self, url: &'a Url) -> FetchFuture<'a> {
        Box::pin(async move {
            *self.counts.lock().unwrap().entry(url.to_string()).or_default() += 1;
            let route = self.routes.lock().unwrap().get(url.as_str()).cloned();

            match route {
                Some(Route::Audio { blob, delay }) => {
                    tokio::time::sleep(delay).await;
                    Ok(blob)
                }
                Some(Route::Gone) => Err(Error::resource_expired(format!("{url} is gone"))),
                None => Err(Error::network_failure(format!("404 Not Found: {url}"))),
            }
        })
    }
}

/// An engine on an idle backend, with its outputs and events at hand.
pub struct Harness {
    pub engine: Engine,
    pub fetch: Arc<ScriptedFetch>,
    pub backend: Arc<IdleBackend>,
    pub registry: Arc<Registry>,
    pub events: UnboundedReceiver<Event>,
    outputs: Vec<SourcesQueueOutput<f32>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(config(), Arc::new(IdleBackend::new()), Arc::new(Registry::new()))
    }

    pub fn with(config: Config, backend: Arc<IdleBackend>, registry: Arc<Registry>) -> Self {
        let fetch = Arc::new(ScriptedFetch::default());
        let engine = Engine::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::clone(&fetch) as Arc<dyn Fetch>,
        )
        .unwrap();

        let (tx, events) = mpsc::unbounded_channel();
        engine.set_event_handler(tx);

        Self {
            engine,
            fetch,
            backend,
            registry,
            events,
            outputs: Vec::new(),
        }
    }

    /// Pulls `duration` of audio from every destination opened so far.
    ///
    /// Returns the samples of each destination, oldest first. Destinations
    /// that ran dry are dropped afterwards, like a mixer would.
    pub fn render(&mut self, duration: Duration) -> Vec<Vec<f32>> {
        self.outputs.extend(self.backend.take_outputs());
        let samples = (duration.as_secs_f32() * SAMPLE_RATE as f32) as usize;
        let rendered: Vec<Vec<f32>> = self
            .outputs
            .iter_mut()
            .map(|output| output.by_ref().take(samples).collect())
            .collect();

        let mut exhausted = rendered.iter().map(|output| output.len() < samples);
        self.outputs.retain(|_| !exhausted.next().unwrap_or(false));
        rendered
    }

    /// Events received so far.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Loads a tone of `seconds` at `url` and starts playing it.
    pub async fn play(&mut self, url: &str, seconds: f32) {
        self.fetch.audio(url, seconds, Duration::ZERO);
        assert!(self.engine.load(url, false).await.is_loaded());
        self.engine.play().unwrap();
    }
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0, |peak, sample| f32::max(peak, sample.abs()))
}

pub fn count(events: &[Event], wanted: &Event) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

pub async fn sleep(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

use std::{error::Error, path::Path, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, trace, warn, LevelFilter};
use tokio::sync::mpsc;

use crossfader::{
    config::Config,
    context::{Backend, DeviceBackend},
    element::LoadResult,
    engine::Engine,
    events::Event,
    http::{self, Fetch},
    registry::Registry,
    settings::{AudioSettingsUpdate, EqSettingsUpdate},
    signal::{self, Signal},
    track::Track,
};

/// Build profile, shown in the startup line.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Build profile, shown in the startup line.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// `-q` and `-v` exclude each other.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments.
#[derive(Clone, Debug, Default, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tracks to play, in order
    #[arg(value_name = "URL", value_hint = ValueHint::Url, required_unless_present = "list_devices")]
    urls: Vec<String>,

    /// Configuration file
    ///
    /// Settings in this file are read again on SIGHUP.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<String>,

    /// Output device
    ///
    /// [default: system default output]
    #[arg(short, long, env = "CROSSFADER_DEVICE")]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long, default_value_t = false)]
    list_devices: bool,

    /// Master volume, from 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Crossfade duration in seconds; 0 disables crossfading
    #[arg(long, value_name = "SECONDS")]
    crossfade: Option<f32>,

    /// Disable the short fade between tracks when not crossfading
    #[arg(long, default_value_t = false)]
    no_gapless: bool,

    /// Enable volume normalization
    #[arg(long, default_value_t = false)]
    normalize: bool,

    /// Equalizer preset, for example "rock" or "bass boost"
    #[arg(long, value_name = "PRESET")]
    eq_preset: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Sets up `env_logger`.
///
/// `-q` and `-v` win over `RUST_LOG`, which wins over the `info` default.
/// Only this crate's level follows the flags; dependencies stay at the
/// `RUST_LOG` level.
///
/// # Panics
///
/// Panics when called twice.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Keep in step with the flag levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Without `-v` this can only be `-q`.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        logger.filter_module("crossfader", level);
    }

    logger.init();
}

/// Builds the configuration from the configuration file and the command
/// line, the latter taking precedence.
fn load_config(args: &Args) -> crossfader::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(device) = &args.device {
        config.device = Some(device.clone());
    }
    if let Some(seconds) = args.crossfade {
        config.audio.crossfade_enabled = seconds > 0.0;
        if seconds > 0.0 {
            config.audio.crossfade_duration = Duration::from_secs_f32(seconds);
        }
    }
    if args.no_gapless {
        config.audio.gapless_playback = false;
    }
    if args.normalize {
        config.audio.volume_normalization = true;
    }

    Ok(config)
}

/// Re-reads the audio and equalizer settings from `path`.
fn reload(engine: &Engine, path: Option<&str>) {
    let Some(path) = path else {
        info!("no configuration file to reload");
        return;
    };

    match Config::from_file(Path::new(path)) {
        Ok(config) => {
            engine.update_settings(&AudioSettingsUpdate::from(&config.audio));
            engine.update_eq_settings(&EqSettingsUpdate::from(&config.equalizer));
            info!("reloaded settings from {path}");
        }
        Err(e) => error!("cannot reload {path}: {e}"),
    }
}

/// A list of tracks played in order.
struct Queue {
    tracks: Vec<Track>,
    position: usize,
}

impl Queue {
    fn current(&self) -> Option<&Track> {
        self.tracks.get(self.position)
    }

    fn next(&self) -> Option<&Track> {
        self.tracks.get(self.position + 1)
    }

    /// Loads and plays the current track, moving on past tracks that fail.
    ///
    /// Returns `false` when the queue ran out.
    async fn start(&mut self, engine: &Engine) -> bool {
        while let Some(track) = self.current().cloned() {
            match engine.load_track(&track, true).await {
                // Skipped: already current, or a transition to it just
                // completed.
                LoadResult::Loaded | LoadResult::Skipped => match engine.play() {
                    Ok(()) => {
                        info!("playing {track}");
                        self.preload_next(engine);
                        return true;
                    }
                    Err(e) => error!("cannot play {track}: {e}"),
                },
                LoadResult::Expired => warn!("{track}: stream url expired"),
                result => error!("cannot load {track}: {result}"),
            }
            self.position += 1;
        }

        false
    }

    fn preload_next(&self, engine: &Engine) {
        if let Some(next) = self.next() {
            let engine = engine.clone();
            let url = next.stream_url().to_string();
            tokio::spawn(async move { engine.preload_next(&url).await });
        }
    }

    fn crossfade(&self, engine: &Engine) {
        if let Some(next) = self.next().cloned() {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.crossfade_to(&next).await {
                    warn!("{e}; {next} plays when the current track ends");
                }
            });
        }
    }
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when the configuration or a track URL is invalid, or
/// when the audio output cannot be brought up.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.list_devices {
        for device in DeviceBackend::devices()? {
            println!("{device}");
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    let tracks = args
        .urls
        .iter()
        .enumerate()
        .map(|(i, url)| Track::new(format!("{}", i + 1), url))
        .collect::<Result<Vec<_>, _>>()?;

    let registry = Arc::new(Registry::new());
    let backend: Arc<dyn Backend> = Arc::new(DeviceBackend::new(config.device.clone()));
    let fetch: Arc<dyn Fetch> = Arc::new(http::Client::new(&config)?);
    let engine = Engine::new(config, registry, backend, fetch)?;

    if let Some(volume) = args.volume {
        engine.set_volume(volume);
    }
    if let Some(preset) = &args.eq_preset {
        engine.apply_eq_preset(preset)?;
    }

    let (tx, mut events) = mpsc::unbounded_channel();
    engine.set_event_handler(tx);
    let mut signals = signal::Handler::new()?;

    let mut queue = Queue {
        tracks,
        position: 0,
    };
    if !queue.start(&engine).await {
        engine.shutdown();
        return Err("nothing to play".into());
    }

    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => match signal {
                Signal::Reload => reload(&engine, args.config.as_deref()),
                Signal::Interrupt | Signal::Terminate => {
                    info!("{signal} received, shutting down gracefully");
                    break;
                }
            },

            Some(event) = events.recv() => match event {
                Event::CrossfadeStart => queue.crossfade(&engine),
                Event::TrackChanged => {
                    queue.position += 1;
                    if let Some(track) = queue.current() {
                        info!("playing {track}");
                    }
                    queue.preload_next(&engine);
                }
                Event::Ended => {
                    queue.position += 1;
                    if !queue.start(&engine).await {
                        info!("end of queue");
                        break;
                    }
                }
                Event::TimeUpdate { .. } => trace!("{event}"),
                event => debug!("{event}"),
            },

            else => break,
        }
    }

    engine.shutdown();
    Ok(())
}

/// Parses the arguments, sets up logging and runs the player until the
/// queue ends or a signal stops it.
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

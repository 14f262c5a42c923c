//! Engine configuration.
//!
//! Holds the output format, the HTTP client identity and the tuning constants
//! of the transition logic. Everything has a default, so a configuration file
//! only needs to name what it overrides:
//!
//! ```toml
//! device = "USB Audio"
//!
//! [transitions]
//! crossfade_floor = 0.75
//!
//! [audio]
//! crossfade_enabled = true
//! crossfade_duration = 4.0
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    error::Result,
    normalize::CompressorParams,
    settings::{AudioSettings, EqSettings},
    util::seconds,
};

/// Runtime configuration of the engine.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Output sample rate in Hz; every track is converted to it.
    pub sample_rate: u32,

    /// Output channel count; every track is converted to it.
    pub channels: u16,

    /// Name of the output device, or the system default when unset.
    pub device: Option<String>,

    /// `User-Agent` sent when fetching tracks.
    pub user_agent: String,

    /// Stable ids of the two elements the engine plays on.
    pub primary_id: String,
    pub secondary_id: String,

    /// Interval between position reports, which also paces the transition
    /// trigger checks.
    #[serde(with = "seconds")]
    pub time_update_interval: Duration,

    /// Time a secondary track may take to become playable during a fade.
    #[serde(with = "seconds")]
    pub ready_timeout: Duration,

    /// Timeout for reads while fetching tracks.
    #[serde(with = "seconds")]
    pub read_timeout: Duration,

    pub transitions: Transitions,

    pub compressor: CompressorParams,

    /// Settings the engine starts with, until the caller pushes its own.
    pub audio: AudioSettings,
    pub equalizer: EqSettings,
}

/// When transitions trigger and how their gain automation is paced.
///
/// The defaults are empirical: they are what sounds right on real material,
/// not values derived from first principles.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Transitions {
    /// A crossfade does not start with less than this much of the track left.
    #[serde(with = "seconds")]
    pub crossfade_floor: Duration,

    /// Gapless handoff fires when the remaining time is in
    /// `(gapless_window_end, gapless_window_start]`.
    #[serde(with = "seconds")]
    pub gapless_window_start: Duration,
    #[serde(with = "seconds")]
    pub gapless_window_end: Duration,

    /// Fade length used for gapless handoffs.
    #[serde(with = "seconds")]
    pub gapless_fade: Duration,

    /// Gain automation ticks per second of fade.
    pub ticks_per_second: u32,

    /// Gain automation never uses fewer ticks than this.
    pub min_steps: u32,
}

impl Transitions {
    pub const CROSSFADE_FLOOR: Duration = Duration::from_millis(500);
    pub const GAPLESS_WINDOW_START: Duration = Duration::from_millis(300);
    pub const GAPLESS_WINDOW_END: Duration = Duration::from_millis(100);
    pub const GAPLESS_FADE: Duration = Duration::from_millis(100);
    pub const TICKS_PER_SECOND: u32 = 20;
    pub const MIN_STEPS: u32 = 20;
}

impl Default for Transitions {
    fn default() -> Self {
        Self {
            crossfade_floor: Self::CROSSFADE_FLOOR,
            gapless_window_start: Self::GAPLESS_WINDOW_START,
            gapless_window_end: Self::GAPLESS_WINDOW_END,
            gapless_fade: Self::GAPLESS_FADE,
            ticks_per_second: Self::TICKS_PER_SECOND,
            min_steps: Self::MIN_STEPS,
        }
    }
}

impl Config {
    /// Default output sample rate in Hz.
    pub const SAMPLE_RATE: u32 = 44_100;

    /// Default output channel count.
    pub const CHANNELS: u16 = 2;

    /// Reads a configuration file, falling back to defaults for every field
    /// the file does not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses a configuration from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not valid TOML or has fields of the
    /// wrong type.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        trace!("config: {config:#?}");
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");
        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };

        Self {
            sample_rate: Self::SAMPLE_RATE,
            channels: Self::CHANNELS,
            device: None,
            user_agent: format!("{app_name}/{app_version} (Rust; {os_name})"),
            primary_id: String::from("primary"),
            secondary_id: String::from("secondary"),
            time_update_interval: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            transitions: Transitions::default(),
            compressor: CompressorParams::default(),
            audio: AudioSettings::default(),
            equalizer: EqSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.transitions.crossfade_floor, Duration::from_millis(500));
    }

    #[test]
    fn overrides_are_partial() {
        let config = Config::from_toml(
            r#"
            device = "USB Audio"
            time_update_interval = 0.25

            [transitions]
            gapless_window_start = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.device.as_deref(), Some("USB Audio"));
        assert_eq!(config.time_update_interval, Duration::from_millis(250));
        assert_eq!(
            config.transitions.gapless_window_start,
            Duration::from_millis(500)
        );
        assert_eq!(
            config.transitions.gapless_window_end,
            Transitions::GAPLESS_WINDOW_END
        );
    }

    #[test]
    fn initial_settings() {
        let config = Config::from_toml(
            r#"
            [audio]
            crossfade_enabled = true
            crossfade_duration = 4.0

            [equalizer]
            enabled = true
            preset = "rock"
            "#,
        )
        .unwrap();

        assert!(config.audio.crossfade_enabled);
        assert_eq!(config.audio.crossfade_duration, Duration::from_secs(4));
        assert!(config.audio.gapless_playback);
        assert!(config.equalizer.enabled);
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(Config::from_toml("ready_timeout = -1.0").is_err());
    }
}

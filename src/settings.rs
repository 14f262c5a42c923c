//! Playback and equalizer settings pushed by the caller.
//!
//! The engine keeps the authoritative in-memory copy. Persisting settings is
//! the caller's business; both types (de)serialize so they can be stored as is.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    equalizer::{BAND_COUNT, FREQUENCIES, MAX_GAIN_DB, MIN_GAIN_DB},
    error::Error,
    util::seconds,
};

/// Transition and loudness settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub crossfade_enabled: bool,

    /// Length of a crossfade, within [`Self::MAX_CROSSFADE`].
    #[serde(with = "seconds")]
    pub crossfade_duration: Duration,

    pub volume_normalization: bool,

    pub gapless_playback: bool,
}

impl AudioSettings {
    pub const MAX_CROSSFADE: Duration = Duration::from_secs(12);

    /// Applies the fields set in `update`.
    ///
    /// Returns `true` if a flag changed that requires the processing graphs
    /// to be rebuilt.
    pub fn apply(&mut self, update: &AudioSettingsUpdate) -> bool {
        if let Some(enabled) = update.crossfade_enabled {
            self.crossfade_enabled = enabled;
        }
        if let Some(duration) = update.crossfade_duration {
            self.crossfade_duration = duration.min(Self::MAX_CROSSFADE);
        }
        if let Some(gapless) = update.gapless_playback {
            self.gapless_playback = gapless;
        }

        match update.volume_normalization {
            Some(normalization) if normalization != self.volume_normalization => {
                self.volume_normalization = normalization;
                true
            }
            _ => false,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            crossfade_enabled: false,
            crossfade_duration: Duration::from_secs(6),
            volume_normalization: false,
            gapless_playback: true,
        }
    }
}

/// Partial update of [`AudioSettings`]; unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioSettingsUpdate {
    pub crossfade_enabled: Option<bool>,

    /// In seconds, like [`AudioSettings::crossfade_duration`].
    #[serde(deserialize_with = "seconds::deserialize_option")]
    pub crossfade_duration: Option<Duration>,

    pub volume_normalization: Option<bool>,
    pub gapless_playback: Option<bool>,
}

/// An update that makes any settings equal to `settings`.
impl From<&AudioSettings> for AudioSettingsUpdate {
    fn from(settings: &AudioSettings) -> Self {
        Self {
            crossfade_enabled: Some(settings.crossfade_enabled),
            crossfade_duration: Some(settings.crossfade_duration),
            volume_normalization: Some(settings.volume_normalization),
            gapless_playback: Some(settings.gapless_playback),
        }
    }
}

/// Gains of the ten equalizer bands in dB.
///
/// Always holds exactly one entry per band. It (de)serializes as a map of
/// center frequency to gain: missing bands default to 0 dB, unknown
/// frequencies are dropped and gains are clamped to ±12 dB.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<u32, f32>", into = "BTreeMap<u32, f32>")]
pub struct EqGains([f32; BAND_COUNT]);

impl EqGains {
    #[must_use]
    pub fn new(gains: [f32; BAND_COUNT]) -> Self {
        Self(gains.map(clamp_gain))
    }

    /// Gain of the band centered at `frequency`.
    #[must_use]
    pub fn get(&self, frequency: u32) -> Option<f32> {
        band_index(frequency).map(|i| self.0[i])
    }

    /// Sets the gain of the band centered at `frequency`.
    ///
    /// Returns the clamped gain, or `None` if there is no such band.
    pub fn set(&mut self, frequency: u32, gain_db: f32) -> Option<f32> {
        let index = band_index(frequency)?;
        let gain_db = clamp_gain(gain_db);
        self.0[index] = gain_db;
        Some(gain_db)
    }

    #[must_use]
    pub fn by_index(&self, index: usize) -> f32 {
        self.0.get(index).copied().unwrap_or_default()
    }

    /// `(frequency, gain)` pairs from low to high.
    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        FREQUENCIES.iter().copied().zip(self.0.iter().copied())
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.0.iter().all(|gain| *gain == 0.0)
    }
}

impl From<BTreeMap<u32, f32>> for EqGains {
    fn from(map: BTreeMap<u32, f32>) -> Self {
        let mut gains = Self::default();
        for (frequency, gain_db) in map {
            if gains.set(frequency, gain_db).is_none() {
                debug!("ignoring gain for unknown band {frequency} Hz");
            }
        }
        gains
    }
}

impl From<EqGains> for BTreeMap<u32, f32> {
    fn from(gains: EqGains) -> Self {
        gains.iter().collect()
    }
}

fn band_index(frequency: u32) -> Option<usize> {
    FREQUENCIES.iter().position(|f| *f == frequency)
}

fn clamp_gain(gain_db: f32) -> f32 {
    if gain_db.is_nan() {
        return 0.0;
    }
    gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB)
}

/// Named equalizer curves.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqPreset {
    #[default]
    Flat,
    BassBoost,
    TrebleBoost,
    Vocal,
    Rock,
    Pop,
    Jazz,
    Classical,
    Electronic,
    Acoustic,
    /// Gains set band by band.
    Custom,
}

impl EqPreset {
    pub const ALL: [EqPreset; 11] = [
        Self::Flat,
        Self::BassBoost,
        Self::TrebleBoost,
        Self::Vocal,
        Self::Rock,
        Self::Pop,
        Self::Jazz,
        Self::Classical,
        Self::Electronic,
        Self::Acoustic,
        Self::Custom,
    ];

    /// Band gains of the preset, or `None` for [`Custom`](Self::Custom).
    #[must_use]
    pub fn gains(self) -> Option<EqGains> {
        let gains = match self {
            Self::Flat => [0.0; BAND_COUNT],
            Self::BassBoost => [6.0, 5.0, 4.0, 2.5, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            Self::TrebleBoost => [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.5, 4.0, 5.0, 6.0],
            Self::Vocal => [-2.0, -1.5, -1.0, 1.0, 3.0, 3.5, 3.0, 1.5, 0.0, -1.0],
            Self::Rock => [4.5, 3.5, 2.0, 0.5, -1.0, -0.5, 1.5, 3.0, 3.5, 4.0],
            Self::Pop => [-1.0, 0.5, 2.0, 3.5, 4.0, 3.0, 1.0, 0.0, -0.5, -1.0],
            Self::Jazz => [3.0, 2.0, 1.0, 2.0, -1.0, -1.0, 0.0, 1.0, 2.0, 3.0],
            Self::Classical => [4.0, 3.0, 2.0, 1.0, -1.0, -1.0, 0.0, 2.0, 3.0, 4.0],
            Self::Electronic => [5.0, 4.0, 1.5, 0.0, -1.5, 1.0, 0.0, 1.5, 4.0, 5.0],
            Self::Acoustic => [3.5, 3.0, 2.0, 1.0, 1.5, 1.5, 2.5, 3.0, 2.5, 1.5],
            Self::Custom => return None,
        };
        Some(EqGains::new(gains))
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::BassBoost => "bass_boost",
            Self::TrebleBoost => "treble_boost",
            Self::Vocal => "vocal",
            Self::Rock => "rock",
            Self::Pop => "pop",
            Self::Jazz => "jazz",
            Self::Classical => "classical",
            Self::Electronic => "electronic",
            Self::Acoustic => "acoustic",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for EqPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses preset names case-insensitively, accepting `-`, `_` or spaces
/// between words.
impl FromStr for EqPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|preset| preset.name() == normalized)
            .ok_or_else(|| Error::invalid_argument(format!("unknown equalizer preset: {s}")))
    }
}

/// Equalizer settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqSettings {
    pub enabled: bool,
    pub preset: EqPreset,
    pub gains: EqGains,
}

impl EqSettings {
    /// Applies the fields set in `update`.
    ///
    /// A preset other than [`Custom`](EqPreset::Custom) replaces the gains;
    /// explicit gains in the same update are applied on top and turn the
    /// preset into `Custom`. Returns `true` if the equalizer was switched on
    /// or off, which requires the processing graphs to be rebuilt.
    pub fn apply(&mut self, update: &EqSettingsUpdate) -> bool {
        if let Some(preset) = update.preset {
            self.preset = preset;
            if let Some(gains) = preset.gains() {
                self.gains = gains;
            }
        }

        if let Some(gains) = &update.gains {
            for (frequency, gain_db) in gains {
                if self.gains.set(*frequency, *gain_db).is_some() {
                    self.preset = EqPreset::Custom;
                }
            }
        }

        match update.enabled {
            Some(enabled) if enabled != self.enabled => {
                self.enabled = enabled;
                true
            }
            _ => false,
        }
    }
}

/// Partial update of [`EqSettings`]; unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EqSettingsUpdate {
    pub enabled: Option<bool>,
    pub preset: Option<EqPreset>,
    pub gains: Option<BTreeMap<u32, f32>>,
}

/// An update that makes any settings equal to `settings`.
///
/// A named preset stands for its own gains, so gains are only carried for
/// [`Custom`](EqPreset::Custom).
impl From<&EqSettings> for EqSettingsUpdate {
    fn from(settings: &EqSettings) -> Self {
        let gains = match settings.preset {
            EqPreset::Custom => Some(settings.gains.iter().collect()),
            _ => None,
        };
        Self {
            enabled: Some(settings.enabled),
            preset: Some(settings.preset),
            gains,
        }
    }
}

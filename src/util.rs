//! Numeric helpers shared by the signal chain and the engine.
//!
//! * Decibel ↔ ratio conversion for the equalizer and compressor
//! * Lossy float conversion without sprinkling `as` casts around
//! * An atomic `f32` for parameters shared with the audio thread

use std::sync::atomic::{AtomicU32, Ordering};

/// Zero decibels, or unity gain.
pub const ZERO_DB: f32 = 0.0;

/// Converts a linear amplitude ratio to decibels.
#[must_use]
#[inline]
pub fn ratio_to_db(ratio: f32) -> f32 {
    ratio.log10() * 20.0
}

/// Converts decibels to a linear amplitude ratio.
#[must_use]
#[inline]
pub fn db_to_ratio(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// Clamps a volume to `[0.0, 1.0]` and rounds it to four decimals.
///
/// Rounding keeps repeated conversions from the caller's percentage or slider
/// values from producing gain changes nobody can hear. `NaN` becomes silence.
#[must_use]
pub fn round_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    (volume.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Lossy conversion to `f32`.
///
/// Audio parameters do not need more than `f32` precision, and this makes the
/// intent explicit at the call site.
pub trait ToF32 {
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for f64 {
    #[expect(clippy::cast_possible_truncation)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for u32 {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for u64 {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for usize {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

/// An `f32` that can be shared between threads without locking.
///
/// Stored as its bit pattern in an `AtomicU32`. Relaxed ordering is enough:
/// every value stands on its own and nothing is synchronized through it.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    #[must_use]
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Stores `value` and returns the previous value.
    #[inline]
    pub fn swap(&self, value: f32) -> f32 {
        f32::from_bits(self.0.swap(value.to_bits(), Ordering::Relaxed))
    }
}

/// (De)serializes a `Duration` as fractional seconds.
///
/// Use with `#[serde(with = "crate::util::seconds")]`.
pub mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[expect(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    /// Like [`deserialize`], for optional fields. `null` is `None`.
    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

//! Loudness normalization through feedforward compression.
//!
//! This module implements a feedforward compressor in the log domain, based on:
//! Giannoulis, D., Massberg, M., & Reiss, J.D. (2012). Digital Dynamic
//! Range Compressor Design—A Tutorial and Analysis. Journal of The Audio
//! Engineering Society, 60, 399-408.
//!
//! The defaults are tuned for gentle normalization of program material rather
//! than for aggressive limiting:
//! * Soft knee for transparent onset
//! * Moderate ratio above the threshold
//! * Decoupled peak detection, linked across channels
//!
//! # Architecture
//!
//! The compressor processes audio in these steps:
//! 1. Half-wave rectification and dB conversion
//! 2. Soft-knee gain computation
//! 3. Smoothed peak detection
//! 4. Gain reduction application

use std::time::Duration;

use serde::Deserialize;

use crate::util::{self, ToF32, ZERO_DB};

/// Compressor tuning.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompressorParams {
    /// Level where compression begins (dB)
    pub threshold: f32,

    /// Range over which compression gradually increases (dB)
    pub knee_width: f32,

    /// Input-to-output slope above the threshold
    pub ratio: f32,

    /// Time to respond to level increases (ms)
    pub attack_ms: u32,

    /// Time to recover after level decreases (ms)
    pub release_ms: u32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold: -24.0,
            knee_width: 12.0,
            ratio: 3.0,
            attack_ms: 3,
            release_ms: 250,
        }
    }
}

/// Converts a time duration to a smoothing coefficient.
///
/// Used for attack/release filtering:
/// * Longer times = higher coefficients = slower response
/// * Shorter times = lower coefficients = faster response
#[must_use]
fn duration_to_coefficient(duration: Duration, sample_rate: u32) -> f32 {
    f32::exp(-1.0 / (duration.as_secs_f32() * sample_rate.to_f32_lossy()))
}

/// Feedforward soft-knee compressor over interleaved samples.
#[derive(Clone, Debug)]
pub struct Compressor {
    threshold: f32,
    knee_width: f32,

    /// Fraction of the overshoot that is removed: `1 - 1 / ratio`
    slope: f32,

    /// Attack smoothing coefficient
    attack: f32,

    /// Release smoothing coefficient
    release: f32,

    /// Per-channel peak detector integrator states (dB)
    integrators: Vec<f32>,

    /// Per-channel smoothed peak levels (dB)
    peaks: Vec<f32>,
}

impl Compressor {
    #[must_use]
    pub fn new(params: &CompressorParams, sample_rate: u32, channels: u16) -> Self {
        let attack = Duration::from_millis(params.attack_ms.into());
        let release = Duration::from_millis(params.release_ms.into());
        let channels = usize::from(channels.max(1));

        Self {
            threshold: params.threshold,
            knee_width: params.knee_width.max(0.0),
            slope: 1.0 - 1.0 / params.ratio.max(1.0),
            attack: duration_to_coefficient(attack, sample_rate),
            release: duration_to_coefficient(release, sample_rate),
            integrators: vec![ZERO_DB; channels],
            peaks: vec![ZERO_DB; channels],
        }
    }

    /// Static gain reduction in dB for a sample at `level_db`.
    #[must_use]
    fn gain_computer(&self, level_db: f32) -> f32 {
        let bias_db = level_db - self.threshold;
        let knee_boundary_db = bias_db * 2.0;
        let knee_db = self.knee_width;

        if knee_boundary_db < -knee_db {
            ZERO_DB
        } else if knee_boundary_db.abs() <= knee_db && knee_db > 0.0 {
            // Textbook:
            // ```
            // (1 - 1/R) * (x - T + W/2)^2 / (2 * W)
            // ```
            self.slope * (knee_boundary_db + knee_db).powi(2) / (8.0 * knee_db)
        } else {
            self.slope * bias_db
        }
    }

    /// Processes one sample of `channel`.
    #[inline]
    pub fn process(&mut self, sample: f32, channel: usize) -> f32 {
        // Silence needs no compression, and `ratio_to_db(0.0)` returns `-inf`
        // which would get the peak detector stuck. Also catch the unlikely
        // case where a sample is decoded as `NaN` or some other non-normal
        // value.
        let reduction_db = if sample.is_normal() {
            self.gain_computer(util::ratio_to_db(sample.abs()))
        } else {
            ZERO_DB
        };

        // Spare the CPU unless:
        // 1. the compressor is engaged, or
        // 2. we were in attack, or
        // 3. we were in release,
        // ...and that attack/release were not finished yet.
        if reduction_db > ZERO_DB || self.integrators[channel] > ZERO_DB || self.peaks[channel] > ZERO_DB
        {
            let release_cf = self.release;
            let attack_cf = self.attack;

            // Textbook:
            // ```
            // release_cf * integrator + (1.0 - release_cf) * reduction_db
            // ```
            self.integrators[channel] = f32::max(
                reduction_db,
                release_cf * self.integrators[channel] - release_cf * reduction_db + reduction_db,
            );

            // Textbook:
            // ```
            // attack_cf * peak + (1.0 - attack_cf) * integrator
            // ```
            self.peaks[channel] = attack_cf * self.peaks[channel]
                - attack_cf * self.integrators[channel]
                + self.integrators[channel];

            let max_peak = self.peaks.iter().copied().fold(ZERO_DB, f32::max);
            return sample * util::db_to_ratio(-max_peak);
        }

        sample
    }

    /// Forgets the detector state, e.g. after a seek.
    pub fn reset(&mut self) {
        self.integrators.fill(ZERO_DB);
        self.peaks.fill(ZERO_DB);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> Compressor {
        Compressor::new(&CompressorParams::default(), 44_100, 2)
    }

    #[test]
    fn quiet_material_passes_untouched() {
        let mut compressor = compressor();
        // -40 dBFS is well below the knee
        let sample = util::db_to_ratio(-40.0);
        for _ in 0..1_000 {
            assert_eq!(compressor.process(sample, 0), sample);
        }
    }

    #[test]
    fn loud_material_is_reduced_gently() {
        let mut compressor = compressor();
        let mut last = 0.0;
        for i in 0..44_100 {
            last = compressor.process(1.0, i % 2);
        }

        // 24 dB over threshold at 3:1 settles at 16 dB of reduction, so the
        // output stays well above a brickwall limiter's.
        let reduction = -util::ratio_to_db(last);
        assert!(reduction > 12.0, "reduction {reduction}");
        assert!(reduction < 17.0, "reduction {reduction}");
    }

    #[test]
    fn reset_clears_detector() {
        let mut compressor = compressor();
        for _ in 0..1_000 {
            compressor.process(1.0, 0);
        }
        compressor.reset();
        let quiet = util::db_to_ratio(-40.0);
        assert_eq!(compressor.process(quiet, 0), quiet);
    }
}

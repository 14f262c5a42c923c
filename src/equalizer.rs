//! Ten-band graphic equalizer.
//!
//! Biquad filters after the RBJ Audio EQ Cookbook, in Direct Form II
//! Transposed. The lowest band is a low shelf, the highest a high shelf, and
//! everything in between a peaking filter of fixed bandwidth.

use std::f64::consts::PI;

use crate::{settings::EqGains, util::ToF32};

/// Center frequencies of the bands in Hz.
pub const FREQUENCIES: [u32; BAND_COUNT] = [32, 64, 125, 250, 500, 1_000, 2_000, 4_000, 8_000, 16_000];

/// Number of bands.
pub const BAND_COUNT: usize = 10;

/// Gain range of a band in dB.
pub const MAX_GAIN_DB: f32 = 12.0;
pub const MIN_GAIN_DB: f32 = -12.0;

/// Bandwidth of the peaking bands, and slope of the shelves.
const PEAKING_Q: f64 = 1.4;
const SHELF_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterKind {
    LowShelf,
    Peaking,
    HighShelf,
}

impl FilterKind {
    /// Filter kind of the band at `index`.
    #[must_use]
    pub fn for_band(index: usize) -> Self {
        match index {
            0 => Self::LowShelf,
            i if i == BAND_COUNT - 1 => Self::HighShelf,
            _ => Self::Peaking,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct Coefficients {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Coefficients {
    fn new(kind: FilterKind, frequency: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        // Keep the top band below Nyquist at low sample rates.
        let frequency = frequency.min(sample_rate * 0.45);
        let w0 = 2.0 * PI * frequency / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();

        let (b0, b1, b2, a0, a1, a2) = match kind {
            FilterKind::Peaking => {
                let alpha = sin_w0 / (2.0 * PEAKING_Q);
                (
                    1.0 + alpha * a,
                    -2.0 * cos_w0,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos_w0,
                    1.0 - alpha / a,
                )
            }
            FilterKind::LowShelf => {
                let alpha = sin_w0 / (2.0 * SHELF_Q);
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            FilterKind::HighShelf => {
                let alpha = sin_w0 / (2.0 * SHELF_Q);
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// A single biquad with independent state per channel.
#[derive(Clone, Debug)]
pub struct Biquad {
    kind: FilterKind,
    frequency: f64,
    gain_db: f32,
    sample_rate: f64,
    coefficients: Coefficients,
    /// `(z1, z2)` per channel
    state: Vec<(f64, f64)>,
}

impl Biquad {
    #[must_use]
    pub fn new(kind: FilterKind, frequency: u32, gain_db: f32, sample_rate: u32, channels: u16) -> Self {
        let frequency = f64::from(frequency);
        let sample_rate = f64::from(sample_rate);
        let gain_db = gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        Self {
            kind,
            frequency,
            gain_db,
            sample_rate,
            coefficients: Coefficients::new(kind, frequency, f64::from(gain_db), sample_rate),
            state: vec![(0.0, 0.0); usize::from(channels.max(1))],
        }
    }

    #[must_use]
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Changes the gain without disturbing the filter state.
    pub fn set_gain_db(&mut self, gain_db: f32) {
        let gain_db = gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        if (self.gain_db - gain_db).abs() < f32::EPSILON {
            return;
        }
        self.gain_db = gain_db;
        self.coefficients =
            Coefficients::new(self.kind, self.frequency, f64::from(gain_db), self.sample_rate);
    }

    #[inline]
    pub fn process(&mut self, sample: f32, channel: usize) -> f32 {
        let c = &self.coefficients;
        let (z1, z2) = &mut self.state[channel];

        let x = f64::from(sample);
        let y = c.b0 * x + *z1;
        *z1 = c.b1 * x - c.a1 * y + *z2;
        *z2 = c.b2 * x - c.a2 * y;

        y.to_f32_lossy()
    }

    pub fn reset(&mut self) {
        self.state.fill((0.0, 0.0));
    }
}

/// The full bank of band filters, applied in series.
#[derive(Clone, Debug)]
pub struct FilterBank {
    bands: Vec<Biquad>,
}

impl FilterBank {
    #[must_use]
    pub fn new(gains: &EqGains, sample_rate: u32, channels: u16) -> Self {
        let bands = FREQUENCIES
            .iter()
            .enumerate()
            .map(|(i, &frequency)| {
                Biquad::new(
                    FilterKind::for_band(i),
                    frequency,
                    gains.by_index(i),
                    sample_rate,
                    channels,
                )
            })
            .collect();

        Self { bands }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    #[must_use]
    pub fn band(&self, index: usize) -> Option<&Biquad> {
        self.bands.get(index)
    }

    /// Applies new gains, recomputing only the bands that changed.
    pub fn set_gains(&mut self, gains: &EqGains) {
        for (i, band) in self.bands.iter_mut().enumerate() {
            band.set_gain_db(gains.by_index(i));
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32, channel: usize) -> f32 {
        self.bands
            .iter_mut()
            .fold(sample, |sample, band| band.process(sample, channel))
    }

    pub fn reset(&mut self) {
        self.bands.iter_mut().for_each(Biquad::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, sample_rate: u32, len: usize) -> impl Iterator<Item = f32> {
        let step = 2.0 * std::f32::consts::PI * frequency / sample_rate.to_f32_lossy();
        (0..len).map(move |i| (step * i.to_f32_lossy()).sin() * 0.25)
    }

    fn peak_after(filter: &mut Biquad, frequency: f32) -> f32 {
        let len = 44_100;
        sine(frequency, 44_100, len)
            .enumerate()
            .map(|(i, sample)| (i, filter.process(sample, 0)))
            .filter(|(i, _)| *i > len / 2)
            .fold(0.0, |peak, (_, sample)| f32::max(peak, sample.abs()))
    }

    #[test]
    fn flat_bank_is_transparent() {
        let mut bank = FilterBank::new(&EqGains::default(), 44_100, 2);
        assert_eq!(bank.len(), BAND_COUNT);
        for (i, sample) in sine(440.0, 44_100, 4_096).enumerate() {
            let out = bank.process(sample, i % 2);
            assert!((out - sample).abs() < 1e-4, "{out} != {sample}");
        }
    }

    #[test]
    fn band_kinds() {
        assert_eq!(FilterKind::for_band(0), FilterKind::LowShelf);
        assert_eq!(FilterKind::for_band(5), FilterKind::Peaking);
        assert_eq!(FilterKind::for_band(9), FilterKind::HighShelf);
    }

    #[test]
    fn peaking_band_boosts_its_center() {
        let mut filter = Biquad::new(FilterKind::Peaking, 1_000, 6.0, 44_100, 1);
        let peak = peak_after(&mut filter, 1_000.0);
        // +6 dB doubles the amplitude of 0.25
        assert!((peak - 0.5).abs() < 0.02, "peak {peak}");
    }

    #[test]
    fn gain_is_clamped() {
        let mut filter = Biquad::new(FilterKind::Peaking, 1_000, 30.0, 44_100, 1);
        assert_eq!(filter.gain_db(), MAX_GAIN_DB);
        filter.set_gain_db(-30.0);
        assert_eq!(filter.gain_db(), MIN_GAIN_DB);
    }
}

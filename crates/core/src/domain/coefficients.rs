//! Biquad coefficient design
//!
//! Pure functions mapping (filter type, frequency, Q, gain, sample rate) to
//! normalized second-order section coefficients:
//! - RBJ Audio EQ Cookbook for the second-order responses
//! - bilinear one-pole forms for first-order LPF/HPF and the 180° allpass
//! - Linkwitz transform (f0, Q0) → (fp, Qp)
//!
//! Coefficient sets always have `a0` divided out, so a section is fully
//! described by `[b0, b1, b2, a1, a2]`.

use crate::domain::stage::{limits, BiquadParams, FilterType};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Lowest accepted normalized frequency (f / fs)
pub const MIN_NORMALIZED_FREQ: f64 = 0.0001;
/// Highest accepted normalized frequency, just below Nyquist
pub const MAX_NORMALIZED_FREQ: f64 = 0.4999;

/// Normalized biquad coefficients (`a0 == 1`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::UNITY
    }
}

impl BiquadCoeffs {
    /// Pass-through section
    pub const UNITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Build from `[b0, b1, b2, a1, a2]`
    pub const fn from_array(c: [f32; 5]) -> Self {
        Self {
            b0: c[0],
            b1: c[1],
            b2: c[2],
            a1: c[3],
            a2: c[4],
        }
    }

    pub const fn to_array(self) -> [f32; 5] {
        [self.b0, self.b1, self.b2, self.a1, self.a2]
    }

    /// Linear interpolation between two sets; `t = 0` gives `self`
    #[inline]
    pub fn lerp(&self, target: &Self, t: f32) -> Self {
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Self {
            b0: mix(self.b0, target.b0),
            b1: mix(self.b1, target.b1),
            b2: mix(self.b2, target.b2),
            a1: mix(self.a1, target.a1),
            a2: mix(self.a2, target.a2),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|c| c.is_finite())
    }

    /// Design a section for `filter`
    ///
    /// `gain_db` is the boost/cut for PEQ and shelves; for
    /// [`FilterType::Linkwitz`] it is reinterpreted as the target pole
    /// frequency `fp` in Hz and `q2` is the target Q. Returns `None` for
    /// [`FilterType::Custom`], whose coefficients are user supplied.
    #[must_use]
    pub fn design(
        filter: FilterType,
        frequency: f32,
        gain_db: f32,
        q: f32,
        q2: f32,
        sample_rate: u32,
    ) -> Option<Self> {
        let f = normalized_frequency(frequency, sample_rate);
        let q = effective_q(q);

        let coeffs = match filter {
            FilterType::Lpf => rbj(f, q, |cos, alpha| {
                [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha]
            }),
            FilterType::Hpf => rbj(f, q, |cos, alpha| {
                [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha]
            }),
            FilterType::Bpf | FilterType::Bpf0Db => rbj(f, q, |cos, alpha| {
                [alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha]
            }),
            FilterType::Notch => rbj(f, q, |cos, alpha| {
                [1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha]
            }),
            FilterType::Allpass | FilterType::Allpass360 => rbj(f, q, |cos, alpha| {
                [1.0 - alpha, -2.0 * cos, 1.0 + alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha]
            }),
            FilterType::Peq => {
                let a = 10f64.powf(gain_db as f64 / 40.0);
                rbj(f, q, |cos, alpha| {
                    [
                        1.0 + alpha * a,
                        -2.0 * cos,
                        1.0 - alpha * a,
                        1.0 + alpha / a,
                        -2.0 * cos,
                        1.0 - alpha / a,
                    ]
                })
            }
            FilterType::LowShelf => {
                let a = 10f64.powf(gain_db as f64 / 40.0);
                rbj(f, q, |cos, alpha| {
                    let k = 2.0 * a.sqrt() * alpha;
                    [
                        a * ((a + 1.0) - (a - 1.0) * cos + k),
                        2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                        a * ((a + 1.0) - (a - 1.0) * cos - k),
                        (a + 1.0) + (a - 1.0) * cos + k,
                        -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                        (a + 1.0) + (a - 1.0) * cos - k,
                    ]
                })
            }
            FilterType::HighShelf => {
                let a = 10f64.powf(gain_db as f64 / 40.0);
                rbj(f, q, |cos, alpha| {
                    let k = 2.0 * a.sqrt() * alpha;
                    [
                        a * ((a + 1.0) + (a - 1.0) * cos + k),
                        -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                        a * ((a + 1.0) + (a - 1.0) * cos - k),
                        (a + 1.0) - (a - 1.0) * cos + k,
                        2.0 * ((a - 1.0) - (a + 1.0) * cos),
                        (a + 1.0) - (a - 1.0) * cos - k,
                    ]
                })
            }
            FilterType::Allpass180 => {
                let t = (PI * f).tan();
                let a = (t - 1.0) / (t + 1.0);
                from_f64([a, 1.0, 0.0, a, 0.0])
            }
            FilterType::Lpf1st => {
                let w = (PI * f).tan();
                let n = 1.0 / (1.0 + w);
                from_f64([w * n, w * n, 0.0, (w - 1.0) * n, 0.0])
            }
            FilterType::Hpf1st => {
                let w = (PI * f).tan();
                let n = 1.0 / (1.0 + w);
                from_f64([n, -n, 0.0, (w - 1.0) * n, 0.0])
            }
            FilterType::Linkwitz => {
                // The pole frequency is clamped like any other frequency
                let fp = normalized_frequency(gain_db, sample_rate);
                linkwitz_transform(f, q, fp, effective_q(q2))
            }
            FilterType::Custom => return None,
        };

        Some(coeffs)
    }

    /// Magnitude of the frequency response at `frequency` Hz
    pub fn magnitude_at(&self, frequency: f32, sample_rate: u32) -> f32 {
        let w = 2.0 * PI * frequency as f64 / sample_rate as f64;
        let z1 = Complex64::from_polar(1.0, -w);
        let z2 = z1 * z1;
        let num = self.b0 as f64 + self.b1 as f64 * z1 + self.b2 as f64 * z2;
        let den = 1.0 + self.a1 as f64 * z1 + self.a2 as f64 * z2;
        (num / den).norm() as f32
    }

    /// Gain at DC: `(b0 + b1 + b2) / (1 + a1 + a2)`
    pub fn dc_gain(&self) -> f32 {
        let [b0, b1, b2, a1, a2] = self.to_array().map(f64::from);
        let den = 1.0 + a1 + a2;
        if den == 0.0 {
            return f32::INFINITY;
        }
        ((b0 + b1 + b2) / den) as f32
    }
}

/// Recompute `params.coeffs` for `filter`
///
/// Custom sections keep their user-supplied coefficients. A pending morph
/// keeps gliding, now toward the freshly designed set.
pub fn compute_biquad_coeffs(params: &mut BiquadParams, filter: FilterType, sample_rate: u32) {
    if let Some(coeffs) = BiquadCoeffs::design(
        filter,
        params.frequency,
        params.gain,
        params.q,
        params.q2,
        sample_rate,
    ) {
        params.coeffs = coeffs;
    }
}

/// `f / fs`, clamped into the stable design range
pub fn normalized_frequency(frequency: f32, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return MIN_NORMALIZED_FREQ;
    }
    let f = frequency as f64 / sample_rate as f64;
    if f.is_nan() {
        return MIN_NORMALIZED_FREQ;
    }
    f.clamp(MIN_NORMALIZED_FREQ, MAX_NORMALIZED_FREQ)
}

/// Non-positive Q falls back to Butterworth
pub fn effective_q(q: f32) -> f64 {
    if q > 0.0 {
        q as f64
    } else {
        limits::DEFAULT_Q as f64
    }
}

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Linear amplitude to dB, floored at -120 dB
#[inline]
pub fn linear_to_db(level: f32) -> f32 {
    if level <= 1e-6 {
        -120.0
    } else {
        20.0 * level.log10()
    }
}

/// One-pole smoothing coefficient for a time constant in milliseconds
///
/// Zero or negative times give `0.0`, i.e. instant response.
#[inline]
pub fn time_coeff(ms: f32, sample_rate: u32) -> f32 {
    if ms <= 0.0 || sample_rate == 0 {
        return 0.0;
    }
    (-1.0 / (ms * 0.001 * sample_rate as f32)).exp()
}

// ============================================================================
// INTERNALS
// ============================================================================

/// Shared RBJ scaffolding: `terms` returns `[b0, b1, b2, a0, a1, a2]`
fn rbj(f: f64, q: f64, terms: impl Fn(f64, f64) -> [f64; 6]) -> BiquadCoeffs {
    let w0 = 2.0 * PI * f;
    let alpha = w0.sin() / (2.0 * q);
    let [b0, b1, b2, a0, a1, a2] = terms(w0.cos(), alpha);
    from_f64([b0 / a0, b1 / a0, b2 / a0, a1 / a0, a2 / a0])
}

fn from_f64(c: [f64; 5]) -> BiquadCoeffs {
    BiquadCoeffs::from_array(c.map(|v| v as f32))
}

/// Bilinear Linkwitz transform on normalized frequencies (fs = 1)
fn linkwitz_transform(f0: f64, q0: f64, fp: f64, qp: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * f0;
    let wp = 2.0 * PI * fp;
    let fc = (f0 + fp) / 2.0;
    let gn = 2.0 * PI * fc / (PI * fc).tan();
    let gn2 = gn * gn;

    let (d0, d1, d2) = (w0 * w0, w0 / q0, 1.0);
    let (c0, c1, c2) = (wp * wp, wp / qp, 1.0);
    let cc = c0 + gn * c1 + gn2 * c2;

    from_f64([
        (d0 + gn * d1 + gn2 * d2) / cc,
        2.0 * (d0 - gn2 * d2) / cc,
        (d0 - gn * d1 + gn2 * d2) / cc,
        2.0 * (c0 - gn2 * c2) / cc,
        (c0 - gn * c1 + gn2 * c2) / cc,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_RATE: u32 = 48000;

    fn design(filter: FilterType, freq: f32, gain: f32, q: f32) -> BiquadCoeffs {
        BiquadCoeffs::design(filter, freq, gain, q, 0.0, SAMPLE_RATE).unwrap()
    }

    // -------------------------------------------------------------------------
    // Cookbook responses
    // -------------------------------------------------------------------------

    #[test]
    fn test_lpf_hpf_dc_gain() {
        let lpf = design(FilterType::Lpf, 1000.0, 0.0, 0.707);
        let hpf = design(FilterType::Hpf, 1000.0, 0.0, 0.707);
        assert!((lpf.dc_gain() - 1.0).abs() < 1e-3);
        assert!(hpf.dc_gain().abs() < 1e-3);
    }

    #[test]
    fn test_lpf_minus_3db_at_cutoff() {
        let lpf = design(FilterType::Lpf, 1000.0, 0.0, std::f32::consts::FRAC_1_SQRT_2);
        let mag = lpf.magnitude_at(1000.0, SAMPLE_RATE);
        assert!((linear_to_db(mag) + 3.01).abs() < 0.05, "got {mag}");
    }

    #[test]
    fn test_peq_gain_at_center() {
        let peq = design(FilterType::Peq, 2000.0, 6.0, 1.0);
        let mag = peq.magnitude_at(2000.0, SAMPLE_RATE);
        assert!((linear_to_db(mag) - 6.0).abs() < 0.05);
        assert!((peq.dc_gain() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_shelves() {
        let low = design(FilterType::LowShelf, 100.0, -6.0, 0.707);
        assert!((linear_to_db(low.dc_gain()) + 6.0).abs() < 0.05);
        assert!((low.magnitude_at(15000.0, SAMPLE_RATE) - 1.0).abs() < 0.01);

        let high = design(FilterType::HighShelf, 5000.0, 4.0, 0.707);
        assert!((high.dc_gain() - 1.0).abs() < 1e-3);
        assert!((linear_to_db(high.magnitude_at(23000.0, SAMPLE_RATE)) - 4.0).abs() < 0.2);
    }

    #[test]
    fn test_notch_rejects_center() {
        let notch = design(FilterType::Notch, 1000.0, 0.0, 2.0);
        assert_eq!(notch.b1, notch.a1);
        assert!(notch.magnitude_at(1000.0, SAMPLE_RATE) < 1e-3);
    }

    #[test]
    fn test_custom_is_not_designed() {
        assert!(BiquadCoeffs::design(FilterType::Custom, 1000.0, 0.0, 1.0, 0.0, SAMPLE_RATE).is_none());

        let mut params = BiquadParams::default();
        params.coeffs = BiquadCoeffs::from_array([0.5, 0.1, 0.0, -0.2, 0.0]);
        compute_biquad_coeffs(&mut params, FilterType::Custom, SAMPLE_RATE);
        assert_eq!(params.coeffs.to_array(), [0.5, 0.1, 0.0, -0.2, 0.0]);
    }

    #[test]
    fn test_non_positive_q_falls_back() {
        let a = design(FilterType::Lpf, 500.0, 0.0, 0.0);
        let b = design(FilterType::Lpf, 500.0, 0.0, limits::DEFAULT_Q);
        assert_eq!(a, b);
        let c = design(FilterType::Lpf, 500.0, 0.0, -3.0);
        assert_eq!(a, c);
    }

    #[test]
    fn test_frequency_clamped_below_nyquist() {
        let c = design(FilterType::Lpf, 40000.0, 0.0, 0.707);
        assert!(c.is_finite());
        let d = design(FilterType::Lpf, 0.0, 0.0, 0.707);
        assert!(d.is_finite());
    }

    // -------------------------------------------------------------------------
    // First-order and extended types
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_order_sections() {
        let lpf = design(FilterType::Lpf1st, 1000.0, 0.0, 0.0);
        assert_eq!(lpf.b2, 0.0);
        assert_eq!(lpf.a2, 0.0);
        assert_eq!(lpf.b0, lpf.b1);
        assert!((lpf.dc_gain() - 1.0).abs() < 1e-4);

        let hpf = design(FilterType::Hpf1st, 1000.0, 0.0, 0.0);
        assert_eq!(hpf.b1, -hpf.b0);
        assert!(hpf.dc_gain().abs() < 1e-4);
    }

    #[test]
    fn test_allpass_180_unit_magnitude() {
        let ap = design(FilterType::Allpass180, 1000.0, 0.0, 0.0);
        assert_eq!(ap.b1, 1.0);
        assert_eq!(ap.b0, ap.a1);
        for freq in [50.0, 1000.0, 12000.0] {
            assert!((ap.magnitude_at(freq, SAMPLE_RATE) - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_linkwitz_identity_and_shift() {
        // fp == f0 and Qp == Q0 is the identity transform
        let same = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, 60.0, 0.707, 0.707, SAMPLE_RATE).unwrap();
        for freq in [20.0, 60.0, 1000.0] {
            assert!((same.magnitude_at(freq, SAMPLE_RATE) - 1.0).abs() < 1e-3);
        }

        // Moving the pole from 60 Hz down to 30 Hz boosts DC by (60/30)^2
        let ext = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, 30.0, 0.707, 0.5, SAMPLE_RATE).unwrap();
        assert!((ext.dc_gain() - 4.0).abs() < 0.05, "dc {}", ext.dc_gain());
        assert!((ext.magnitude_at(15000.0, SAMPLE_RATE) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_linkwitz_pole_clamped_to_band() {
        let floor = (MIN_NORMALIZED_FREQ * SAMPLE_RATE as f64) as f32;
        let at_floor = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, floor, 0.707, 0.707, SAMPLE_RATE).unwrap();
        for pole in [0.0, -25.0, f32::NAN] {
            let c = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, pole, 0.707, 0.707, SAMPLE_RATE).unwrap();
            assert!((c.dc_gain() - at_floor.dc_gain()).abs() < 1e-3 * at_floor.dc_gain(), "pole {pole}");
        }
        // A non-positive pole is not the identity transform
        assert!(at_floor.magnitude_at(20.0, SAMPLE_RATE) > 4.0);

        let ceiling = (MAX_NORMALIZED_FREQ * SAMPLE_RATE as f64) as f32;
        let high = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, 90_000.0, 0.707, 0.707, SAMPLE_RATE).unwrap();
        let at_ceiling = BiquadCoeffs::design(FilterType::Linkwitz, 60.0, ceiling, 0.707, 0.707, SAMPLE_RATE).unwrap();
        assert!((high.magnitude_at(1000.0, SAMPLE_RATE) - at_ceiling.magnitude_at(1000.0, SAMPLE_RATE)).abs() < 1e-4);
    }

    #[test]
    fn test_time_coeff() {
        assert_eq!(time_coeff(0.0, SAMPLE_RATE), 0.0);
        let c = time_coeff(10.0, SAMPLE_RATE);
        assert!((c - (-1.0f32 / 480.0).exp()).abs() < 1e-7);
    }

    #[test]
    fn test_lerp_endpoints() {
        let a = BiquadCoeffs::UNITY;
        let b = design(FilterType::Hpf, 200.0, 0.0, 0.707);
        assert_eq!(a.lerp(&b, 0.0), a);
        let end = a.lerp(&b, 1.0);
        for (x, y) in end.to_array().iter().zip(b.to_array()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    proptest! {
        #[test]
        fn prop_design_is_deterministic(freq in 10.0f32..22000.0, gain in -24.0f32..24.0, q in 0.1f32..10.0) {
            for filter in FilterType::ALL {
                let a = BiquadCoeffs::design(filter, freq, gain, q, 0.707, SAMPLE_RATE);
                let b = BiquadCoeffs::design(filter, freq, gain, q, 0.707, SAMPLE_RATE);
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn prop_lowpass_highpass_dc(freq in 100.0f32..20000.0, q in 0.3f32..5.0) {
            let lpf = BiquadCoeffs::design(FilterType::Lpf, freq, 0.0, q, 0.0, SAMPLE_RATE).unwrap();
            let hpf = BiquadCoeffs::design(FilterType::Hpf, freq, 0.0, q, 0.0, SAMPLE_RATE).unwrap();
            prop_assert!((lpf.dc_gain() - 1.0).abs() < 1e-2);
            prop_assert!(hpf.dc_gain().abs() < 1e-2);
        }

        #[test]
        fn prop_notch_shares_b1_a1(freq in 20.0f32..20000.0, q in 0.1f32..10.0) {
            let notch = BiquadCoeffs::design(FilterType::Notch, freq, 0.0, q, 0.0, SAMPLE_RATE).unwrap();
            prop_assert_eq!(notch.b1, notch.a1);
        }

        #[test]
        fn prop_allpass_unit_magnitude(freq in 100.0f32..20000.0, q in 0.3f32..5.0, probe in 20.0f32..23000.0) {
            let ap = BiquadCoeffs::design(FilterType::Allpass, freq, 0.0, q, 0.0, SAMPLE_RATE).unwrap();
            prop_assert_eq!(ap.b0, ap.a2);
            prop_assert!((ap.magnitude_at(probe, SAMPLE_RATE) - 1.0).abs() < 1e-3);
        }
    }
}

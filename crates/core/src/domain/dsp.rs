//! Per-stage sample algorithms
//!
//! Every stage processes a mono `f32` block in place, normalized to
//! [-1.0, 1.0]. The processors are:
//! - Biquad sections (TDF-II) with coefficient morphing after a swap
//! - FIR convolution and delay lines backed by the state's pools
//! - Limiter, compressor, noise gate and speaker protection
//! - Gain ramp, polarity, mute
//! - Tone control, loudness and bass enhancement built from biquads
//! - Multiband compressor
//!
//! Nothing here allocates, locks or logs; the whole module runs in the
//! audio context.

use crate::domain::coefficients::{db_to_linear, linear_to_db, time_coeff, BiquadCoeffs};
use crate::domain::pool::Pools;
use crate::domain::stage::{
    limits::*, BassEnhanceParams, BiquadParams, BiquadSection, CompressorParams, DelayParams,
    FirParams, GainParams, HarmonicOrder, LimiterParams, MultibandCompressorParams,
    NoiseGateParams, SpeakerProtectionParams, Stage, StageKind,
};

/// What a stage may touch besides its own payload
pub struct ProcessContext<'a> {
    pub sample_rate: u32,
    pub pools: &'a mut Pools,
}

/// Core trait for everything that runs in a channel chain
pub trait StageProcessor {
    /// Process a mono block in place
    ///
    /// # Requirements
    /// - No allocations, locks or logging
    /// - Any block length up to [`MAX_FRAMES`]
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>);
}

/// Gain applied while the ramp is within this distance of its target snaps to it
const GAIN_SNAP: f32 = 1e-6;
/// Time constant of the gain ramp
const GAIN_RAMP_MS: f32 = 5.0;

// ============================================================================
// BIQUAD
// ============================================================================

/// Transposed direct form II over a block
#[inline]
pub fn biquad_tdf2(coeffs: &BiquadCoeffs, delay: &mut [f32; 2], buffer: &mut [f32]) {
    let BiquadCoeffs { b0, b1, b2, a1, a2 } = *coeffs;
    let [mut d0, mut d1] = *delay;
    for sample in buffer.iter_mut() {
        let x = *sample;
        let y = b0 * x + d0;
        d0 = b1 * x - a1 * y + d1;
        d1 = b2 * x - a2 * y;
        *sample = y;
    }
    *delay = [d0, d1];
}

impl BiquadSection {
    #[inline]
    pub fn process_sample(&mut self, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + self.delay[0];
        self.delay[0] = c.b1 * x - c.a1 * y + self.delay[1];
        self.delay[1] = c.b2 * x - c.a2 * y;
        y
    }

    pub fn process(&mut self, buffer: &mut [f32]) {
        biquad_tdf2(&self.coeffs, &mut self.delay, buffer);
    }
}

impl BiquadParams {
    /// Run the block, gliding through a pending morph chunk by chunk
    pub fn process(&mut self, buffer: &mut [f32]) {
        let Some(mut morph) = self.morph else {
            biquad_tdf2(&self.coeffs, &mut self.delay, buffer);
            return;
        };

        let mut processed = 0;
        while processed < buffer.len() && morph.remaining > 0 {
            let t = 1.0 - morph.remaining as f32 / MORPH_SAMPLES as f32;
            let coeffs = morph.from.lerp(&self.coeffs, t);
            let chunk = (buffer.len() - processed)
                .min(MORPH_CHUNK)
                .min(morph.remaining);
            biquad_tdf2(&coeffs, &mut self.delay, &mut buffer[processed..processed + chunk]);
            processed += chunk;
            morph.remaining -= chunk;
        }

        if morph.remaining == 0 {
            self.morph = None;
            biquad_tdf2(&self.coeffs, &mut self.delay, &mut buffer[processed..]);
        } else {
            self.morph = Some(morph);
        }
    }
}

// ============================================================================
// POOLED STAGES
// ============================================================================

impl StageProcessor for FirParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        let taps = (self.num_taps as usize).min(MAX_FIR_TAPS);
        if taps == 0 {
            return;
        }
        let Some(fir) = ctx.pools.fir.get_mut(self.slot) else {
            return;
        };

        let mut pos = self.delay_pos as usize;
        if pos >= taps {
            pos = 0;
        }
        for sample in buffer.iter_mut() {
            fir.delay[pos] = *sample;
            let mut acc = 0.0;
            let mut idx = pos;
            for tap in &fir.taps[..taps] {
                acc += tap * fir.delay[idx];
                idx = if idx == 0 { taps - 1 } else { idx - 1 };
            }
            *sample = acc;
            pos += 1;
            if pos == taps {
                pos = 0;
            }
        }
        self.delay_pos = pos as u16;
    }
}

impl StageProcessor for DelayParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if self.delay_samples == 0 {
            return;
        }
        let Some(line) = ctx.pools.delay.get_mut(self.slot) else {
            return;
        };

        let delay = (self.delay_samples as usize).min(MAX_DELAY_SAMPLES - 1);
        let mut wp = self.write_pos as usize % MAX_DELAY_SAMPLES;
        for sample in buffer.iter_mut() {
            line.samples[wp] = *sample;
            *sample = line.samples[(wp + MAX_DELAY_SAMPLES - delay) % MAX_DELAY_SAMPLES];
            wp = (wp + 1) % MAX_DELAY_SAMPLES;
        }
        self.write_pos = wp as u32;
    }
}

// ============================================================================
// DYNAMICS
// ============================================================================

/// Single-pole peak follower with separate attack and release
#[inline]
fn follow(envelope: f32, input: f32, attack: f32, release: f32) -> f32 {
    let coeff = if input > envelope { attack } else { release };
    coeff * envelope + (1.0 - coeff) * input
}

/// Soft-knee gain reduction in dB (≥ 0) for a level `over_db` above threshold
#[inline]
pub fn soft_knee_reduction(over_db: f32, ratio: f32, knee_db: f32) -> f32 {
    let slope = 1.0 - 1.0 / ratio;
    let half = knee_db / 2.0;
    if knee_db > 0.0 && over_db > -half && over_db < half {
        let x = over_db + half;
        slope * x * x / (2.0 * knee_db)
    } else if over_db >= half {
        over_db * slope
    } else {
        0.0
    }
}

impl StageProcessor for LimiterParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if buffer.is_empty() || ctx.sample_rate == 0 {
            return;
        }
        let threshold = db_to_linear(self.threshold_db);
        let attack = time_coeff(self.attack_ms, ctx.sample_rate);
        let release = time_coeff(self.release_ms, ctx.sample_rate);

        let mut env = self.envelope;
        let mut worst = 0.0f32;
        for sample in buffer.iter_mut() {
            env = follow(env, sample.abs(), attack, release);
            if env > threshold && env > 0.0 {
                let over = 20.0 * env.log10() - self.threshold_db;
                let gr = over * (1.0 - 1.0 / self.ratio);
                *sample *= db_to_linear(-gr);
                worst = worst.max(gr);
            }
        }
        self.envelope = env;
        self.gain_reduction = -worst;
    }
}

impl StageProcessor for CompressorParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if buffer.is_empty() || ctx.sample_rate == 0 {
            return;
        }
        let attack = time_coeff(self.attack_ms, ctx.sample_rate);
        let release = time_coeff(self.release_ms, ctx.sample_rate);

        let mut env = self.envelope;
        let mut worst = 0.0f32;
        for sample in buffer.iter_mut() {
            env = follow(env, sample.abs(), attack, release);
            let mut gain = 1.0;
            if env > 0.0 {
                let over = 20.0 * env.log10() - self.threshold_db;
                let gr = soft_knee_reduction(over, self.ratio, self.knee_db);
                if gr > 0.0 {
                    gain = db_to_linear(-gr);
                    worst = worst.max(gr);
                }
            }
            *sample *= gain * self.makeup_linear;
        }
        self.envelope = env;
        self.gain_reduction = -worst;
    }
}

impl StageProcessor for NoiseGateParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if buffer.is_empty() || ctx.sample_rate == 0 {
            return;
        }
        let threshold = db_to_linear(self.threshold_db);
        let attack = time_coeff(self.attack_ms, ctx.sample_rate);
        let release = time_coeff(self.release_ms, ctx.sample_rate);
        let hold_samples = self.hold_ms * 0.001 * ctx.sample_rate as f32;
        let range = db_to_linear(self.range_db);

        let mut env = self.envelope;
        let mut hold = self.hold_counter;
        let mut worst = 0.0f32;
        for sample in buffer.iter_mut() {
            env = follow(env, sample.abs(), attack, release);

            if env >= threshold {
                hold = hold_samples;
                continue;
            }
            if hold > 0.0 {
                hold -= 1.0;
                continue;
            }

            let gain = if self.ratio <= 1.0 {
                range
            } else {
                let under = self.threshold_db - linear_to_db(env);
                db_to_linear(-under * (1.0 - 1.0 / self.ratio)).max(range)
            };
            worst = worst.max(-linear_to_db(gain));
            *sample *= gain;
        }
        self.envelope = env;
        self.hold_counter = hold;
        self.gain_reduction = -worst;
    }
}

impl StageProcessor for SpeakerProtectionParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if buffer.is_empty() || ctx.sample_rate == 0 {
            return;
        }
        const AMBIENT: f32 = SpeakerProtectionParams::AMBIENT_TEMP_C;
        const MIN_GAIN: f32 = 0.01;

        let dt = 1.0 / ctx.sample_rate as f32;
        let tau = self.thermal_tau_ms * 0.001;
        let thermal_mass = if tau > 0.0 { tau } else { 2.0 };
        let thermal_limit = self.max_temp_c * 0.7;
        let excursion_limit = self.excursion_limit_mm * 0.7;
        let area = self.driver_diameter_mm * self.driver_diameter_mm * std::f32::consts::FRAC_PI_4;
        let area = if area > 0.0 { area } else { 1.0 };
        let alpha_up = (-dt / 0.010).exp();
        let alpha_down = (-dt / 0.050).exp();

        let mut temp = self.current_temp_c;
        let mut env = self.envelope;
        let mut worst = 0.0f32;
        for sample in buffer.iter_mut() {
            let power = *sample * *sample / self.impedance_ohms;
            env = follow(env, power, alpha_up, alpha_down);

            temp += (env * self.power_rating_w - (temp - AMBIENT)) * dt / thermal_mass;
            temp = temp.max(AMBIENT);

            let mut thermal_gain = 1.0;
            if temp > thermal_limit && thermal_limit > AMBIENT {
                let over = ((temp - thermal_limit) / (self.max_temp_c - thermal_limit)).min(1.0);
                thermal_gain = 1.0 - over * 0.9;
            }

            let excursion = sample.abs() * 10.0 * 1000.0 / area;
            let mut excursion_gain = 1.0;
            if excursion > excursion_limit && excursion_limit > 0.0 {
                excursion_gain = excursion_limit / excursion;
            }

            let gain = thermal_gain.min(excursion_gain).max(MIN_GAIN);
            worst = worst.max(-20.0 * gain.log10());
            *sample *= gain;
        }
        self.current_temp_c = temp;
        self.envelope = env;
        self.gain_reduction = -worst;
    }
}

impl StageProcessor for MultibandCompressorParams {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        let Some(slot) = ctx.pools.multiband.get_mut(self.slot) else {
            return;
        };
        let bands = (self.num_bands as usize).clamp(2, MULTIBAND_MAX_BANDS);
        let n = buffer.len().min(MAX_FRAMES);

        for band in &mut slot.band_buf[..bands] {
            band[..n].copy_from_slice(&buffer[..n]);
        }
        for boundary in 0..bands - 1 {
            let [low, high] = &mut slot.crossovers[boundary];
            low.process(&mut slot.band_buf[boundary][..n]);
            high.process(&mut slot.band_buf[boundary + 1][..n]);
        }

        for (band, data) in slot.bands[..bands].iter_mut().zip(slot.band_buf.iter_mut()) {
            let threshold = db_to_linear(band.threshold_db);
            let attack = time_coeff(band.attack_ms, ctx.sample_rate);
            let release = time_coeff(band.release_ms, ctx.sample_rate);
            let mut env = band.envelope;
            let mut worst = 0.0f32;
            for sample in &mut data[..n] {
                env = follow(env, sample.abs(), attack, release);
                let mut gain = band.makeup_linear;
                if env > 0.0 && env > threshold {
                    let over = 20.0 * env.log10() - band.threshold_db;
                    let gr = soft_knee_reduction(over, band.ratio, band.knee_db);
                    if gr > 0.0 {
                        gain *= db_to_linear(-gr);
                        worst = worst.max(gr);
                    }
                }
                *sample *= gain;
            }
            band.envelope = env;
            band.gain_reduction = -worst;
        }

        for (i, sample) in buffer[..n].iter_mut().enumerate() {
            *sample = slot.band_buf[..bands].iter().map(|band| band[i]).sum();
        }
    }
}

// ============================================================================
// LEVEL AND TONE
// ============================================================================

impl GainParams {
    /// Exponential ramp toward `gain_linear`
    pub fn process(&mut self, buffer: &mut [f32], sample_rate: u32) {
        let target = self.gain_linear;
        if (self.current_linear - target).abs() < GAIN_SNAP {
            self.current_linear = target;
            buffer.iter_mut().for_each(|s| *s *= target);
            return;
        }

        let coeff = time_coeff(GAIN_RAMP_MS, sample_rate);
        let mut current = self.current_linear;
        for sample in buffer.iter_mut() {
            current = coeff * current + (1.0 - coeff) * target;
            *sample *= current;
        }
        self.current_linear = current;
    }
}

impl BassEnhanceParams {
    pub fn process(&mut self, buffer: &mut [f32]) {
        if self.mix <= 0.0 {
            return;
        }
        let scale = self.mix / 100.0 * self.harmonic_gain_linear;
        for sample in buffer.iter_mut() {
            let x = *sample;
            let low = x - self.hpf.process_sample(x);
            let harmonic = match self.order {
                HarmonicOrder::Second => low * low,
                HarmonicOrder::Third => low * low * low,
                HarmonicOrder::Both => low * low + low * low * low,
            };
            *sample = x + self.bpf.process_sample(harmonic) * scale;
        }
    }
}

// ============================================================================
// STAGE DISPATCH
// ============================================================================

impl StageProcessor for Stage {
    fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if !self.enabled {
            return;
        }
        match &mut self.kind {
            StageKind::Biquad { params, .. } => params.process(buffer),
            StageKind::Limiter(p) => p.process(buffer, ctx),
            StageKind::Fir(p) => p.process(buffer, ctx),
            StageKind::Gain(p) => p.process(buffer, ctx.sample_rate),
            StageKind::Delay(p) => p.process(buffer, ctx),
            StageKind::Polarity(p) => {
                if p.inverted {
                    buffer.iter_mut().for_each(|s| *s = -*s);
                }
            }
            StageKind::Mute(p) => {
                if p.muted {
                    buffer.fill(0.0);
                }
            }
            StageKind::Compressor(p) => p.process(buffer, ctx),
            StageKind::NoiseGate(p) => p.process(buffer, ctx),
            StageKind::ToneControl(p) => {
                p.bass.process(buffer);
                p.mid.process(buffer);
                p.treble.process(buffer);
            }
            StageKind::SpeakerProtection(p) => p.process(buffer, ctx),
            StageKind::Loudness(p) => {
                p.bass.process(buffer);
                p.treble.process(buffer);
            }
            StageKind::BassEnhance(p) => p.process(buffer),
            StageKind::MultibandCompressor(p) => p.process(buffer, ctx),
            // Applied to the channel pair by the engine
            StageKind::StereoWidth(_) => {}
            StageKind::Decimator(_) | StageKind::Convolution(_) => {}
        }
    }
}

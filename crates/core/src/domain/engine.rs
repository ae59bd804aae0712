//! Per-buffer audio entry point
//!
//! [`AudioEngine::process_buffer`] takes one interleaved stereo block of
//! 24-bit samples carried in `i32`, runs the matching channel pair through
//! the active configuration and writes the result back in place. It never
//! fails, allocates or blocks: malformed input is left untouched, and a
//! block that arrives while the active state is held elsewhere is replaced
//! by silence and counted.
//!
//! Each processed pair is also kept as float post-chain channels. Once every
//! input of a period has been processed, [`AudioEngine::execute_routing`]
//! mixes them through the routing matrix into the output pair.

use crate::domain::coefficients::{db_to_linear, linear_to_db, time_coeff};
use crate::domain::metrics::EngineMetrics;
use crate::domain::routing::RoutingMatrix;
use crate::domain::stage::limits::*;
use crate::domain::stage::StereoWidthParams;
use crate::domain::swap::ConfigSwapCoordinator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Stereo inputs, each feeding one channel pair
pub const MAX_INPUTS: usize = MAX_CHANNELS / 2;

/// Samples of look-ahead in the output safety limiter
pub const EMERGENCY_LOOKAHEAD: usize = 8;

const EMERGENCY_RELEASE_MS: f32 = 100.0;

/// Output safety limiter settings; it cannot be bypassed by the chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyLimiterSettings {
    pub enabled: bool,
    pub threshold_db: f32,
}

impl Default for EmergencyLimiterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -0.5,
        }
    }
}

/// Brick-wall limiter on a channel pair: look-ahead, instant attack, 100 ms release
#[derive(Debug, Clone)]
pub struct EmergencyLimiter {
    lookahead: [[f32; EMERGENCY_LOOKAHEAD]; 2],
    pos: usize,
    envelope: f32,
    gain_reduction_db: f32,
    samples_since_trigger: u32,
    triggered_last_block: bool,
    triggers: u32,
}

impl Default for EmergencyLimiter {
    fn default() -> Self {
        Self {
            lookahead: [[0.0; EMERGENCY_LOOKAHEAD]; 2],
            pos: 0,
            envelope: 0.0,
            gain_reduction_db: 0.0,
            samples_since_trigger: u32::MAX / 2,
            triggered_last_block: false,
            triggers: 0,
        }
    }
}

impl EmergencyLimiter {
    /// Limit a pair in place; returns whether the ceiling was hit in this block
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        threshold_db: f32,
        sample_rate: u32,
    ) -> bool {
        let threshold = db_to_linear(threshold_db);
        let release = time_coeff(EMERGENCY_RELEASE_MS, sample_rate);
        let mut triggered = false;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let write = self.pos;
            self.lookahead[0][write] = *l;
            self.lookahead[1][write] = *r;
            self.pos = (write + 1) % EMERGENCY_LOOKAHEAD;

            let peak = self
                .lookahead
                .iter()
                .flatten()
                .fold(0.0f32, |acc, s| acc.max(s.abs()));
            self.envelope = if peak > self.envelope {
                peak
            } else {
                release * self.envelope + (1.0 - release) * peak
            };

            let gain = if self.envelope > threshold {
                triggered = true;
                self.samples_since_trigger = 0;
                threshold / self.envelope
            } else {
                self.samples_since_trigger = self.samples_since_trigger.saturating_add(1);
                1.0
            };

            // Oldest sample in the window
            *l = self.lookahead[0][self.pos] * gain;
            *r = self.lookahead[1][self.pos] * gain;
            self.gain_reduction_db = if gain < 1.0 { linear_to_db(gain) } else { 0.0 };
        }

        if triggered && !self.triggered_last_block {
            self.triggers += 1;
        }
        self.triggered_last_block = triggered;
        triggered
    }

    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    /// Triggered within the last 100 ms
    pub fn is_active(&self, sample_rate: u32) -> bool {
        self.samples_since_trigger < sample_rate / 10
    }

    pub fn triggers(&self) -> u32 {
        self.triggers
    }
}

impl StereoWidthParams {
    /// Mid/side width applied to a channel pair
    pub fn process_pair(&self, left: &mut [f32], right: &mut [f32]) {
        let width = self.width / 100.0;
        let center = self.center_gain_linear;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let mid = (*l + *r) * 0.5 * center;
            let side = (*l - *r) * 0.5 * width;
            *l = mid + side;
            *r = mid - side;
        }
    }
}

pub struct AudioEngine {
    coordinator: Arc<ConfigSwapCoordinator>,
    metrics: Arc<EngineMetrics>,
    emergency: EmergencyLimiterSettings,
    limiters: [EmergencyLimiter; MAX_INPUTS],
    left: [f32; MAX_FRAMES],
    right: [f32; MAX_FRAMES],
    /// Post-chain channels awaiting routing
    post: [[f32; MAX_FRAMES]; MAX_CHANNELS],
    post_frames: usize,
    /// Matrix of the active state, as seen by the last processed block
    routing: RoutingMatrix,
}

impl AudioEngine {
    pub fn new(coordinator: Arc<ConfigSwapCoordinator>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            coordinator,
            metrics,
            emergency: EmergencyLimiterSettings::default(),
            limiters: std::array::from_fn(|_| EmergencyLimiter::default()),
            left: [0.0; MAX_FRAMES],
            right: [0.0; MAX_FRAMES],
            post: [[0.0; MAX_FRAMES]; MAX_CHANNELS],
            post_frames: 0,
            routing: RoutingMatrix::default(),
        }
    }

    pub fn with_emergency_limiter(mut self, settings: EmergencyLimiterSettings) -> Self {
        self.emergency = settings;
        self
    }

    pub fn set_emergency_limiter(&mut self, settings: EmergencyLimiterSettings) {
        self.emergency = settings;
    }

    pub fn emergency_limiter(&self) -> EmergencyLimiterSettings {
        self.emergency
    }

    pub fn coordinator(&self) -> &Arc<ConfigSwapCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Process one interleaved stereo block in place
    ///
    /// Input `n` feeds channels `2n` (left) and `2n + 1` (right). Blocks of
    /// zero or more than [`MAX_FRAMES`] frames, short buffers and unknown
    /// inputs are ignored.
    pub fn process_buffer(&mut self, samples: &mut [i32], frames: usize, input: usize) {
        if frames == 0 || frames > MAX_FRAMES || samples.len() < frames * 2 || input >= MAX_INPUTS {
            return;
        }
        let start = Instant::now();
        let (left_ch, right_ch) = (input * 2, input * 2 + 1);

        let Some(mut state) = self.coordinator.get_active() else {
            samples[..frames * 2].fill(0);
            self.zero_channels(input);
            self.metrics.record_contended();
            return;
        };
        self.routing = *state.routing();
        let sample_rate = state.sample_rate();

        let left = &mut self.left[..frames];
        let right = &mut self.right[..frames];
        for ((frame, l), r) in samples.chunks_exact(2).zip(left.iter_mut()).zip(right.iter_mut()) {
            *l = frame[0] as f32 / FULL_SCALE_24BIT;
            *r = frame[1] as f32 / FULL_SCALE_24BIT;
        }
        if state.global_bypass {
            drop(state);
            self.store_post(input, frames);
            self.metrics.record_bypass();
            return;
        }

        state.process_channel(left_ch, left);
        state.process_channel(right_ch, right);

        if let Some(width) = state.channel(left_ch).ok().and_then(|c| c.stereo_width()) {
            width.process_pair(left, right);
        }

        if self.emergency.enabled {
            let limiter = &mut self.limiters[input];
            limiter.process(left, right, self.emergency.threshold_db, sample_rate);
            self.metrics.record_emergency(
                limiter.gain_reduction_db(),
                limiter.is_active(sample_rate),
                limiter.triggers(),
            );
        }

        for ((frame, l), r) in samples.chunks_exact_mut(2).zip(left.iter()).zip(right.iter()) {
            frame[0] = to_fixed(*l);
            frame[1] = to_fixed(*r);
        }
        self.post[left_ch][..frames].copy_from_slice(left);
        self.post[right_ch][..frames].copy_from_slice(right);
        self.post_frames = frames;

        for channel in [left_ch, right_ch] {
            let worst = state.channel(channel).map_or(0.0, |c| c.worst_gain_reduction());
            self.metrics.record_gain_reduction(channel, worst);
        }
        drop(state);

        let elapsed_us = u32::try_from(start.elapsed().as_micros()).unwrap_or(u32::MAX);
        self.metrics.record_timing(elapsed_us, frames, sample_rate);
    }

    fn store_post(&mut self, input: usize, frames: usize) {
        self.post[input * 2][..frames].copy_from_slice(&self.left[..frames]);
        self.post[input * 2 + 1][..frames].copy_from_slice(&self.right[..frames]);
        self.post_frames = frames;
    }

    /// Silence the post-chain channels of an input with no signal this period
    pub fn zero_channels(&mut self, input: usize) {
        if input < MAX_INPUTS {
            self.post[input * 2].fill(0.0);
            self.post[input * 2 + 1].fill(0.0);
        }
    }

    /// Post-chain samples of `channel`, after routing once it has run
    pub fn post_channel(&self, channel: usize) -> Option<&[f32]> {
        self.post.get(channel).map(|c| &c[..self.post_frames])
    }

    /// Mix the post-chain channels through the routing matrix
    ///
    /// Routed channels 0 and 1 are written interleaved to `out`. Returns the
    /// frames written: the smaller of `frames`, the room in `out` and the
    /// length of the last processed block. Frames past that are untouched.
    pub fn execute_routing(&mut self, out: &mut [i32], frames: usize) -> usize {
        let frames = frames.min(out.len() / 2).min(self.post_frames);
        if frames == 0 {
            return 0;
        }
        self.routing.apply(&mut self.post, frames);
        for (f, frame) in out.chunks_exact_mut(2).take(frames).enumerate() {
            frame[0] = to_fixed(self.post[0][f]);
            frame[1] = to_fixed(self.post[1][f]);
        }
        frames
    }
}

#[inline]
fn to_fixed(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * FULL_SCALE_24BIT).round() as i32
}

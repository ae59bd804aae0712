//! Fixed-size buffer pools
//!
//! Large per-stage buffers (FIR taps and delay memory, delay lines,
//! multiband band data) are kept out of the stage payloads. Each pipeline
//! state owns one [`Pools`] value; a stage refers to its buffer by slot
//! index. All memory is allocated up front, so neither allocation nor the
//! audio path ever touches the heap.

use crate::domain::coefficients::{db_to_linear, BiquadCoeffs};
use crate::domain::stage::{limits::*, BiquadSection, FilterType};
use serde::Serialize;
use std::fmt;

/// Which pool a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Fir,
    Delay,
    Multiband,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolKind::Fir => "FIR",
            PoolKind::Delay => "delay",
            PoolKind::Multiband => "multiband",
        })
    }
}

/// Used-slot bitmap, lowest free slot first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotBitmap(u32);

impl SlotBitmap {
    pub fn allocate(&mut self, capacity: usize) -> Option<u8> {
        let slot = (0..capacity.min(32)).find(|&i| self.0 & (1 << i) == 0)?;
        self.0 |= 1 << slot;
        Some(slot as u8)
    }

    pub fn free(&mut self, slot: u8) {
        if slot < 32 {
            self.0 &= !(1 << slot);
        }
    }

    pub fn is_used(&self, slot: u8) -> bool {
        slot < 32 && self.0 & (1 << slot) != 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }
}

/// Buffer type stored in a [`Pool`]
pub trait PoolBuffer {
    fn zeroed() -> Self;

    /// Return to the freshly allocated state
    fn reset(&mut self);

    /// Overwrite with the contents of `other` without reallocating
    fn copy_from(&mut self, other: &Self);
}

/// A fixed number of preallocated buffers with a used-bitmap
#[derive(Debug)]
pub struct Pool<B> {
    kind: PoolKind,
    used: SlotBitmap,
    slots: Box<[B]>,
}

impl<B: PoolBuffer> Pool<B> {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            used: SlotBitmap::default(),
            slots: (0..capacity).map(|_| B::zeroed()).collect(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.count()
    }

    pub fn is_used(&self, slot: u8) -> bool {
        self.used.is_used(slot)
    }

    /// Claim the lowest free slot; its buffer is reset before it is handed out
    pub fn allocate(&mut self) -> Option<u8> {
        let slot = self.used.allocate(self.slots.len())?;
        self.slots[slot as usize].reset();
        Some(slot)
    }

    /// Release a slot; freeing an unused or out-of-range slot is a no-op
    pub fn free(&mut self, slot: u8) {
        self.used.free(slot);
    }

    /// Buffer of an allocated slot
    pub fn get(&self, slot: Option<u8>) -> Option<&B> {
        let slot = slot.filter(|&s| self.used.is_used(s))?;
        self.slots.get(slot as usize)
    }

    pub fn get_mut(&mut self, slot: Option<u8>) -> Option<&mut B> {
        let slot = slot.filter(|&s| self.used.is_used(s))?;
        self.slots.get_mut(slot as usize)
    }

    /// Mirror another pool: bitmap plus the contents of every used slot
    pub fn copy_from(&mut self, other: &Self) {
        self.used = other.used;
        for (i, (dst, src)) in self.slots.iter_mut().zip(other.slots.iter()).enumerate() {
            if other.used.is_used(i as u8) {
                dst.copy_from(src);
            }
        }
    }
}

// ============================================================================
// BUFFER TYPES
// ============================================================================

/// Taps plus circular input history for one FIR stage
#[derive(Debug, Clone)]
pub struct FirBuffer {
    pub taps: [f32; MAX_FIR_TAPS],
    pub delay: [f32; MAX_FIR_TAPS],
}

impl PoolBuffer for FirBuffer {
    fn zeroed() -> Self {
        Self {
            taps: [0.0; MAX_FIR_TAPS],
            delay: [0.0; MAX_FIR_TAPS],
        }
    }

    fn reset(&mut self) {
        self.taps.fill(0.0);
        self.delay.fill(0.0);
    }

    fn copy_from(&mut self, other: &Self) {
        self.taps.copy_from_slice(&other.taps);
        self.delay.copy_from_slice(&other.delay);
    }
}

/// Circular sample memory for one delay stage
#[derive(Debug, Clone)]
pub struct DelayLine {
    pub samples: Box<[f32]>,
}

impl PoolBuffer for DelayLine {
    fn zeroed() -> Self {
        Self {
            samples: vec![0.0; MAX_DELAY_SAMPLES].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.samples.fill(0.0);
    }

    fn copy_from(&mut self, other: &Self) {
        self.samples.copy_from_slice(&other.samples);
    }
}

/// Compressor settings and state of one band
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MultibandBand {
    pub threshold_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub ratio: f32,
    pub knee_db: f32,
    pub makeup_gain_db: f32,
    pub makeup_linear: f32,
    #[serde(skip)]
    pub envelope: f32,
    pub gain_reduction: f32,
}

impl Default for MultibandBand {
    fn default() -> Self {
        Self {
            threshold_db: -12.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            ratio: 4.0,
            knee_db: 6.0,
            makeup_gain_db: 0.0,
            makeup_linear: 1.0,
            envelope: 0.0,
            gain_reduction: 0.0,
        }
    }
}

const MULTIBAND_BOUNDARIES: usize = MULTIBAND_MAX_BANDS - 1;

/// Band split and per-band state of one multiband compressor
#[derive(Debug, Clone)]
pub struct MultibandSlot {
    pub crossover_freqs: [f32; MULTIBAND_BOUNDARIES],
    pub bands: [MultibandBand; MULTIBAND_MAX_BANDS],
    /// `[boundary][0 = low side, 1 = high side]`
    pub crossovers: [[BiquadSection; 2]; MULTIBAND_BOUNDARIES],
    pub(crate) band_buf: [[f32; MAX_FRAMES]; MULTIBAND_MAX_BANDS],
}

impl MultibandSlot {
    pub const DEFAULT_CROSSOVERS: [f32; MULTIBAND_BOUNDARIES] = [200.0, 2000.0, 8000.0];

    /// Redesign the LR2 split and the makeup gains from the current settings
    ///
    /// The high side of each boundary is polarity-inverted so the two LR2
    /// halves sum to an allpass instead of notching at the crossover.
    pub fn update_coefficients(&mut self, sample_rate: u32) {
        for (freq, pair) in self.crossover_freqs.iter().zip(self.crossovers.iter_mut()) {
            let low = BiquadCoeffs::design(FilterType::Lpf, *freq, 0.0, 0.5, 0.0, sample_rate)
                .unwrap_or_default();
            let mut high = BiquadCoeffs::design(FilterType::Hpf, *freq, 0.0, 0.5, 0.0, sample_rate)
                .unwrap_or_default();
            high.b0 = -high.b0;
            high.b1 = -high.b1;
            high.b2 = -high.b2;
            pair[0].coeffs = low;
            pair[1].coeffs = high;
        }
        for band in &mut self.bands {
            band.makeup_linear = db_to_linear(band.makeup_gain_db);
        }
    }

    /// Carry envelopes and crossover memories from the previous active slot
    pub fn carry_runtime_from(&mut self, previous: &Self) {
        for (band, old) in self.bands.iter_mut().zip(previous.bands.iter()) {
            band.envelope = old.envelope;
            band.gain_reduction = old.gain_reduction;
        }
        for (pair, old_pair) in self.crossovers.iter_mut().zip(previous.crossovers.iter()) {
            for (section, old) in pair.iter_mut().zip(old_pair.iter()) {
                section.delay = old.delay;
            }
        }
    }
}

impl PoolBuffer for MultibandSlot {
    fn zeroed() -> Self {
        Self {
            crossover_freqs: Self::DEFAULT_CROSSOVERS,
            bands: [MultibandBand::default(); MULTIBAND_MAX_BANDS],
            crossovers: [[BiquadSection::default(); 2]; MULTIBAND_BOUNDARIES],
            band_buf: [[0.0; MAX_FRAMES]; MULTIBAND_MAX_BANDS],
        }
    }

    fn reset(&mut self) {
        *self = Self::zeroed();
    }

    fn copy_from(&mut self, other: &Self) {
        self.crossover_freqs = other.crossover_freqs;
        self.bands = other.bands;
        self.crossovers = other.crossovers;
    }
}

// ============================================================================
// POOL SET
// ============================================================================

/// Every pool owned by one pipeline state
#[derive(Debug)]
pub struct Pools {
    pub fir: Pool<FirBuffer>,
    pub delay: Pool<DelayLine>,
    pub multiband: Pool<MultibandSlot>,
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    pub fn new() -> Self {
        Self {
            fir: Pool::new(PoolKind::Fir, MAX_FIR_SLOTS),
            delay: Pool::new(PoolKind::Delay, MAX_DELAY_SLOTS),
            multiband: Pool::new(PoolKind::Multiband, MULTIBAND_MAX_SLOTS),
        }
    }

    pub fn allocate(&mut self, kind: PoolKind) -> Option<u8> {
        match kind {
            PoolKind::Fir => self.fir.allocate(),
            PoolKind::Delay => self.delay.allocate(),
            PoolKind::Multiband => self.multiband.allocate(),
        }
    }

    pub fn free(&mut self, kind: PoolKind, slot: u8) {
        match kind {
            PoolKind::Fir => self.fir.free(slot),
            PoolKind::Delay => self.delay.free(slot),
            PoolKind::Multiband => self.multiband.free(slot),
        }
    }

    pub fn used_count(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Fir => self.fir.used_count(),
            PoolKind::Delay => self.delay.used_count(),
            PoolKind::Multiband => self.multiband.used_count(),
        }
    }

    /// Copy slot contents from `src_slot` of `src` into `dst_slot` of `self`
    pub fn copy_slot(&mut self, kind: PoolKind, dst_slot: u8, src: &Pools, src_slot: u8) {
        match kind {
            PoolKind::Fir => {
                if let (Some(dst), Some(s)) = (self.fir.get_mut(Some(dst_slot)), src.fir.get(Some(src_slot))) {
                    dst.copy_from(s);
                }
            }
            PoolKind::Delay => {
                if let (Some(dst), Some(s)) = (self.delay.get_mut(Some(dst_slot)), src.delay.get(Some(src_slot))) {
                    dst.copy_from(s);
                }
            }
            PoolKind::Multiband => {
                if let (Some(dst), Some(s)) =
                    (self.multiband.get_mut(Some(dst_slot)), src.multiband.get(Some(src_slot)))
                {
                    dst.copy_from(s);
                }
            }
        }
    }

    pub fn copy_from(&mut self, other: &Pools) {
        self.fir.copy_from(&other.fir);
        self.delay.copy_from(&other.delay);
        self.multiband.copy_from(&other.multiband);
    }
}

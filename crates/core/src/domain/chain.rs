//! Channel chain
//!
//! An ordered, bounded list of stages run over one mono channel. Once
//! seeded, the first [`PEQ_BANDS`] indices are the parametric-EQ "band"
//! region and everything after is the free-form "chain" region. Both live
//! in the same list; the chain remembers whether it was seeded, so the
//! region boundary does not depend on stage labels or order.

use crate::domain::dsp::{ProcessContext, StageProcessor};
use crate::domain::stage::{limits::*, FilterType, Stage, StageKind, StereoWidthParams};
use serde::Serialize;

/// Center frequencies of the seeded band region
pub const PEQ_FREQUENCIES: [f32; PEQ_BANDS] = [
    31.0, 63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Q of a freshly seeded band
pub const PEQ_DEFAULT_Q: f32 = 1.0;

/// True when `index` falls in the band region
pub fn is_peq_index(index: usize) -> bool {
    index < PEQ_BANDS
}

/// Disabled, flat PEQ stage for band `band` of the band region
pub fn peq_band(band: usize, sample_rate: u32) -> Stage {
    let frequency = PEQ_FREQUENCIES[band.min(PEQ_BANDS - 1)];
    let mut stage = Stage::biquad(FilterType::Peq, frequency, 0.0, PEQ_DEFAULT_Q, sample_rate)
        .with_label(&format!("PEQ {}", band + 1));
    stage.enabled = false;
    stage
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelChain {
    pub bypass: bool,
    pub stereo_link: bool,
    peq_region: bool,
    stages: Vec<Stage>,
}

impl Default for ChannelChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelChain {
    /// Empty pass-through chain with room for [`MAX_STAGES`] stages
    pub fn new() -> Self {
        Self {
            bypass: false,
            stereo_link: false,
            peq_region: false,
            stages: Vec::with_capacity(MAX_STAGES),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stages can be edited in place but not added or removed through this slice
    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        MAX_STAGES - self.stages.len()
    }

    pub fn is_full(&self) -> bool {
        self.stages.len() >= MAX_STAGES
    }

    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Stage> {
        self.stages.get_mut(index)
    }

    /// Insert at `index` (clamped to the end); the caller checks capacity
    pub(crate) fn insert(&mut self, index: usize, stage: Stage) -> usize {
        let index = index.min(self.stages.len());
        self.stages.insert(index, stage);
        index
    }

    pub(crate) fn remove(&mut self, index: usize) -> Stage {
        self.stages.remove(index)
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.stages.truncate(len);
    }

    pub(crate) fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Apply `order` if it is a permutation of the current indices
    pub(crate) fn reorder(&mut self, order: &[usize]) -> bool {
        let len = self.stages.len();
        if order.len() != len {
            return false;
        }
        let mut seen = [false; MAX_STAGES];
        for &i in order {
            if i >= len || seen[i] {
                return false;
            }
            seen[i] = true;
        }

        let mut reordered = [Stage::default(); MAX_STAGES];
        for (dst, &src) in reordered.iter_mut().zip(order) {
            *dst = self.stages[src];
        }
        self.stages.copy_from_slice(&reordered[..len]);
        true
    }

    /// Copy another chain without giving up this chain's allocation
    pub(crate) fn copy_from(&mut self, other: &ChannelChain) {
        self.bypass = other.bypass;
        self.stereo_link = other.stereo_link;
        self.peq_region = other.peq_region;
        self.stages.clone_from(&other.stages);
    }

    // ------------------------------------------------------------------------
    // Band region
    // ------------------------------------------------------------------------

    /// The first [`PEQ_BANDS`] stages form a seeded band region
    ///
    /// Reordering keeps the region; the bands may then sit anywhere in the
    /// first [`PEQ_BANDS`] indices or beyond, but the boundary stays put.
    pub fn has_peq_bands(&self) -> bool {
        self.peq_region && self.stages.len() >= PEQ_BANDS
    }

    /// Insert the band region in front of the existing stages; the caller checks room
    pub(crate) fn seed_peq_bands(&mut self, sample_rate: u32) {
        for band in 0..PEQ_BANDS {
            self.stages.insert(band, peq_band(band, sample_rate));
        }
        self.peq_region = true;
    }

    /// Mark or forget the band region; stages are not touched
    pub(crate) fn set_peq_region(&mut self, seeded: bool) {
        self.peq_region = seeded;
    }

    /// Stages in the chain region, or every stage when no band region is seeded
    pub fn chain_stage_count(&self) -> usize {
        if self.has_peq_bands() {
            self.stages.len() - PEQ_BANDS
        } else {
            self.stages.len()
        }
    }

    // ------------------------------------------------------------------------
    // Audio path
    // ------------------------------------------------------------------------

    /// Run every enabled stage in order; a bypassed chain leaves the block untouched
    pub fn process(&mut self, buffer: &mut [f32], ctx: &mut ProcessContext<'_>) {
        if self.bypass {
            return;
        }
        for stage in &mut self.stages {
            stage.process(buffer, ctx);
        }
    }

    /// Worst gain reduction reported by an enabled dynamics stage, in dB (≤ 0)
    pub fn worst_gain_reduction(&self) -> f32 {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .filter_map(Stage::gain_reduction)
            .fold(0.0, f32::min)
    }

    /// First enabled stereo-width stage
    pub fn stereo_width(&self) -> Option<&StereoWidthParams> {
        self.stages.iter().filter(|s| s.enabled).find_map(|s| match &s.kind {
            StageKind::StereoWidth(p) => Some(p),
            _ => None,
        })
    }
}

//! Pipeline state
//!
//! One complete configuration of the pipeline: global bypass, sample rate,
//! the channel chains and the pools their stages reference. Two instances
//! exist at runtime (active and inactive, see [`swap`](crate::domain::swap)).
//! Every editing operation here is meant for the inactive instance.
//!
//! Failed edits leave the state untouched: capacity and pool availability
//! are checked before anything is modified.

use crate::domain::chain::{is_peq_index, ChannelChain};
use crate::domain::coefficients::BiquadCoeffs;
use crate::domain::dsp::ProcessContext;
use crate::domain::error::{DspError, Result};
use crate::domain::pool::{MultibandSlot, PoolKind, Pools};
use crate::domain::routing::{RoutingMatrix, RoutingPreset};
use crate::domain::stage::{limits::*, FilterType, Stage, StageKind, StageType};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct PipelineState {
    pub global_bypass: bool,
    sample_rate: u32,
    channels: [ChannelChain; MAX_CHANNELS],
    pools: Pools,
    routing: RoutingMatrix,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl PipelineState {
    /// Pass-through state: every chain empty, nothing allocated
    pub fn new(sample_rate: u32) -> Self {
        Self {
            global_bypass: false,
            sample_rate,
            channels: std::array::from_fn(|_| ChannelChain::new()),
            pools: Pools::new(),
            routing: RoutingMatrix::default(),
        }
    }

    /// Pass-through state with the band region seeded on every channel
    pub fn with_peq_bands(sample_rate: u32) -> Self {
        let mut state = Self::new(sample_rate);
        state.ensure_peq_bands();
        state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the sample rate and redesign every derived coefficient
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(DspError::InvalidParameter("sample rate must be positive".into()));
        }
        self.sample_rate = sample_rate;
        self.recompute_all();
        Ok(())
    }

    /// Redesign coefficients and linear gains of every stage and multiband slot
    pub fn recompute_all(&mut self) {
        let sample_rate = self.sample_rate;
        for chain in &mut self.channels {
            for stage in chain.stages_mut() {
                stage.update_derived(sample_rate);
                if let Some((PoolKind::Multiband, slot)) = stage.pool_slot() {
                    if let Some(mb) = self.pools.multiband.get_mut(Some(slot)) {
                        mb.update_coefficients(sample_rate);
                    }
                }
            }
        }
    }

    pub fn channels(&self) -> &[ChannelChain; MAX_CHANNELS] {
        &self.channels
    }

    pub fn channel(&self, channel: usize) -> Result<&ChannelChain> {
        self.channels
            .get(channel)
            .ok_or(DspError::ChannelOutOfRange(channel))
    }

    /// Bypass and stereo-link flags are edited through this; stages through the CRUD methods
    pub fn channel_mut(&mut self, channel: usize) -> Result<&mut ChannelChain> {
        self.channels
            .get_mut(channel)
            .ok_or(DspError::ChannelOutOfRange(channel))
    }

    /// Output routing applied after every channel chain
    pub fn routing(&self) -> &RoutingMatrix {
        &self.routing
    }

    pub fn set_routing(&mut self, routing: RoutingMatrix) {
        self.routing = routing;
    }

    pub fn set_routing_preset(&mut self, preset: RoutingPreset) {
        self.routing.apply_preset(preset);
    }

    pub fn set_routing_gain_db(&mut self, output: usize, input: usize, gain_db: f32) -> Result<()> {
        self.routing.set_gain_db(output, input, gain_db)
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn stage(&self, channel: usize, index: usize) -> Result<&Stage> {
        self.channel(channel)?
            .get(index)
            .ok_or(DspError::StageOutOfRange { channel, index })
    }

    fn stage_mut(&mut self, channel: usize, index: usize) -> Result<&mut Stage> {
        self.channel_mut(channel)?
            .get_mut(index)
            .ok_or(DspError::StageOutOfRange { channel, index })
    }

    // ========================================================================
    // STAGE CRUD
    // ========================================================================

    /// Add a default stage of `stage_type`; `None` or an out-of-range position appends
    ///
    /// Returns the index the stage landed at.
    pub fn add_stage(
        &mut self,
        channel: usize,
        stage_type: StageType,
        position: Option<usize>,
    ) -> Result<usize> {
        self.insert_stage(channel, Stage::new(stage_type), position)
    }

    /// Insert a prepared stage; pooled stages get a fresh slot of this state's pool
    pub fn insert_stage(
        &mut self,
        channel: usize,
        mut stage: Stage,
        position: Option<usize>,
    ) -> Result<usize> {
        let chain = self.channel(channel)?;
        if chain.is_full() {
            warn!(channel, "Channel chain full");
            return Err(DspError::ChainFull {
                channel,
                requested: 1,
            });
        }
        let len = chain.len();

        stage.set_pool_slot(None);
        if let Some(kind) = stage.stage_type().pool_kind() {
            let Some(slot) = self.pools.allocate(kind) else {
                warn!(channel, pool = %kind, "Pool exhausted");
                return Err(DspError::PoolExhausted(kind));
            };
            stage.set_pool_slot(Some(slot));
            if kind == PoolKind::Multiband {
                if let Some(mb) = self.pools.multiband.get_mut(Some(slot)) {
                    mb.update_coefficients(self.sample_rate);
                }
            }
        }
        stage.reset_runtime();
        stage.update_derived(self.sample_rate);

        let position = position.filter(|&p| p <= len).unwrap_or(len);
        self.dissolve_region_at(channel, position);
        let index = self.channels[channel].insert(position, stage);
        debug!(channel, index, stage_type = %stage.stage_type(), "Stage added");
        Ok(index)
    }

    /// Remove a stage and release any pool slot it held
    pub fn remove_stage(&mut self, channel: usize, index: usize) -> Result<Stage> {
        self.stage(channel, index)?;
        self.dissolve_region_at(channel, index);
        let stage = self.channels[channel].remove(index);
        if let Some((kind, slot)) = stage.pool_slot() {
            self.pools.free(kind, slot);
        }
        debug!(channel, index, stage_type = %stage.stage_type(), "Stage removed");
        Ok(stage)
    }

    /// A structural edit inside the band region turns its bands into ordinary stages
    fn dissolve_region_at(&mut self, channel: usize, index: usize) {
        let chain = &mut self.channels[channel];
        if chain.has_peq_bands() && is_peq_index(index) {
            chain.set_peq_region(false);
            debug!(channel, index, "Band region dissolved");
        }
    }

    /// Reorder a channel; `order[i]` names the current index that moves to `i`
    ///
    /// The band region boundary stays at [`PEQ_BANDS`] whatever the order.
    pub fn reorder_stages(&mut self, channel: usize, order: &[usize]) -> Result<()> {
        if !self.channel_mut(channel)?.reorder(order) {
            return Err(DspError::InvalidParameter(format!(
                "{order:?} is not a permutation of channel {channel}"
            )));
        }
        debug!(channel, ?order, "Stages reordered");
        Ok(())
    }

    pub fn set_stage_enabled(&mut self, channel: usize, index: usize, enabled: bool) -> Result<()> {
        self.stage_mut(channel, index)?.enabled = enabled;
        Ok(())
    }

    /// Edit a stage's parameters, then redesign its derived fields
    ///
    /// The stage type and pool slot cannot change through an edit; remove
    /// and re-add the stage for that. Runtime fields are left alone.
    pub fn update_stage(
        &mut self,
        channel: usize,
        index: usize,
        edit: impl FnOnce(&mut Stage),
    ) -> Result<()> {
        let sample_rate = self.sample_rate;
        let stage = self.stage_mut(channel, index)?;
        let before = *stage;
        edit(&mut *stage);
        if stage.stage_type() != before.stage_type() {
            *stage = before;
            return Err(DspError::InvalidParameter(format!(
                "stage {index} on channel {channel} cannot change type in place"
            )));
        }
        stage.set_pool_slot(before.pool_slot().map(|(_, slot)| slot));
        stage.update_derived(sample_rate);
        Ok(())
    }

    /// Load FIR taps into the slot of a FIR stage
    pub fn load_fir_taps(&mut self, channel: usize, index: usize, taps: &[f32]) -> Result<()> {
        if taps.is_empty() || taps.len() > MAX_FIR_TAPS {
            return Err(DspError::InvalidParameter(format!(
                "FIR needs 1..={MAX_FIR_TAPS} taps, got {}",
                taps.len()
            )));
        }
        let stage = self
            .channels
            .get_mut(channel)
            .ok_or(DspError::ChannelOutOfRange(channel))?
            .get_mut(index)
            .ok_or(DspError::StageOutOfRange { channel, index })?;
        let StageKind::Fir(params) = &mut stage.kind else {
            return Err(DspError::InvalidParameter(format!(
                "stage {index} on channel {channel} is not a FIR"
            )));
        };
        let buffer = self
            .pools
            .fir
            .get_mut(params.slot)
            .ok_or(DspError::PoolExhausted(PoolKind::Fir))?;

        buffer.taps[..taps.len()].copy_from_slice(taps);
        buffer.taps[taps.len()..].fill(0.0);
        params.num_taps = taps.len() as u16;
        debug!(channel, index, taps = taps.len(), "FIR taps loaded");
        Ok(())
    }

    /// Replace a biquad stage's coefficients with externally designed ones
    ///
    /// The stage becomes a CUSTOM biquad so a recompute keeps the coefficients.
    /// They are not checked for stability.
    pub fn load_custom_coeffs(
        &mut self,
        channel: usize,
        index: usize,
        coeffs: BiquadCoeffs,
    ) -> Result<()> {
        let stage = self.stage_mut(channel, index)?;
        let StageKind::Biquad { filter, params } = &mut stage.kind else {
            return Err(DspError::InvalidParameter(format!(
                "stage {index} on channel {channel} is not a biquad"
            )));
        };
        *filter = FilterType::Custom;
        params.coeffs = coeffs;
        Ok(())
    }

    /// Set the band count of a multiband compressor and edit its slot
    pub fn configure_multiband(
        &mut self,
        channel: usize,
        index: usize,
        num_bands: u8,
        edit: impl FnOnce(&mut MultibandSlot),
    ) -> Result<()> {
        if !(2..=MULTIBAND_MAX_BANDS as u8).contains(&num_bands) {
            return Err(DspError::InvalidParameter(format!(
                "multiband needs 2..={MULTIBAND_MAX_BANDS} bands, got {num_bands}"
            )));
        }
        let sample_rate = self.sample_rate;
        let stage = self
            .channels
            .get_mut(channel)
            .ok_or(DspError::ChannelOutOfRange(channel))?
            .get_mut(index)
            .ok_or(DspError::StageOutOfRange { channel, index })?;
        let StageKind::MultibandCompressor(params) = &mut stage.kind else {
            return Err(DspError::InvalidParameter(format!(
                "stage {index} on channel {channel} is not a multiband compressor"
            )));
        };
        let slot = self
            .pools
            .multiband
            .get_mut(params.slot)
            .ok_or(DspError::PoolExhausted(PoolKind::Multiband))?;

        params.num_bands = num_bands;
        edit(&mut *slot);
        slot.update_coefficients(sample_rate);
        Ok(())
    }

    // ========================================================================
    // BAND AND CHAIN REGIONS
    // ========================================================================

    pub fn has_peq_bands(&self, channel: usize) -> Result<bool> {
        Ok(self.channel(channel)?.has_peq_bands())
    }

    /// Seed the band region in front of the existing stages
    pub fn init_peq_bands(&mut self, channel: usize) -> Result<()> {
        let sample_rate = self.sample_rate;
        let chain = self.channel_mut(channel)?;
        if chain.free_slots() < PEQ_BANDS {
            return Err(DspError::ChainFull {
                channel,
                requested: PEQ_BANDS,
            });
        }
        chain.seed_peq_bands(sample_rate);
        debug!(channel, "Band region seeded");
        Ok(())
    }

    /// Seed the band region on every channel that lacks one and has room
    pub fn ensure_peq_bands(&mut self) {
        for channel in 0..MAX_CHANNELS {
            if !self.channels[channel].has_peq_bands() {
                if let Err(e) = self.init_peq_bands(channel) {
                    warn!(channel, error = %e, "Cannot seed band region");
                }
            }
        }
    }

    pub fn is_peq_index(&self, index: usize) -> bool {
        is_peq_index(index)
    }

    pub fn chain_stage_count(&self, channel: usize) -> Result<usize> {
        Ok(self.channel(channel)?.chain_stage_count())
    }

    /// Add to the chain region; `position` is relative to its start
    ///
    /// Returns the absolute index.
    pub fn add_chain_stage(
        &mut self,
        channel: usize,
        stage_type: StageType,
        position: Option<usize>,
    ) -> Result<usize> {
        let offset = self.region_offset(channel)?;
        self.add_stage(channel, stage_type, position.map(|p| offset + p))
    }

    /// Remove from the chain region; band stages cannot be removed this way
    pub fn remove_chain_stage(&mut self, channel: usize, chain_index: usize) -> Result<Stage> {
        let offset = self.region_offset(channel)?;
        self.remove_stage(channel, offset + chain_index)
    }

    fn region_offset(&self, channel: usize) -> Result<usize> {
        Ok(if self.channel(channel)?.has_peq_bands() {
            PEQ_BANDS
        } else {
            0
        })
    }

    /// Copy the band region settings of `src` onto `dst`
    pub fn copy_peq_bands(&mut self, src: usize, dst: usize) -> Result<()> {
        self.channel(dst)?;
        if src == dst {
            return Ok(());
        }
        if !self.channel(src)?.has_peq_bands() || !self.channels[dst].has_peq_bands() {
            return Err(DspError::InvalidParameter(
                "both channels need a band region".into(),
            ));
        }
        let bands: [Stage; PEQ_BANDS] = std::array::from_fn(|i| self.channels[src].stages()[i]);
        for (dst_stage, mut band) in self.channels[dst].stages_mut().iter_mut().zip(bands) {
            band.reset_runtime();
            *dst_stage = band;
        }
        debug!(src, dst, "Band region copied");
        Ok(())
    }

    /// Replace the chain region of `dst` with a copy of the chain region of `src`
    pub fn copy_chain_stages(&mut self, src: usize, dst: usize) -> Result<()> {
        self.channel(dst)?;
        if src == dst {
            return Ok(());
        }
        let src_offset = self.region_offset(src)?;
        let dst_offset = self.region_offset(dst)?;
        let count = (self.channels[src].len() - src_offset).min(MAX_STAGES - dst_offset);
        self.replace_stages(src, src_offset, count, dst, dst_offset)?;
        debug!(src, dst, count, "Chain region copied");
        Ok(())
    }

    /// Stereo partner (0↔1, 2↔3) when the channel is linked
    pub fn linked_partner(&self, channel: usize) -> Option<usize> {
        let chain = self.channels.get(channel)?;
        chain.stereo_link.then_some(channel ^ 1)
    }

    /// Make `dst` a copy of `src` (bypass and every stage) with fresh runtime state
    ///
    /// Pooled stages get their own slots; FIR taps and multiband settings
    /// are copied, delay lines start silent.
    pub fn mirror_channel_config(&mut self, src: usize, dst: usize) -> Result<()> {
        self.channel(dst)?;
        if src == dst {
            return Ok(());
        }
        let count = self.channel(src)?.len();
        self.replace_stages(src, 0, count, dst, 0)?;
        let (bypass, region) = (self.channels[src].bypass, self.channels[src].has_peq_bands());
        self.channels[dst].bypass = bypass;
        self.channels[dst].set_peq_region(region);
        debug!(src, dst, "Channel mirrored");
        Ok(())
    }

    /// Replace `dst[dst_from..]` with copies of `src[src_from..src_from + count]`
    fn replace_stages(
        &mut self,
        src: usize,
        src_from: usize,
        count: usize,
        dst: usize,
        dst_from: usize,
    ) -> Result<()> {
        let copies = &self.channels[src].stages()[src_from..src_from + count];
        let dropped = &self.channels[dst].stages()[dst_from..];
        for kind in [PoolKind::Fir, PoolKind::Delay, PoolKind::Multiband] {
            let needed = copies.iter().filter(|s| s.stage_type().pool_kind() == Some(kind)).count();
            let released = dropped.iter().filter(|s| s.stage_type().pool_kind() == Some(kind)).count();
            let free = match kind {
                PoolKind::Fir => self.pools.fir.capacity(),
                PoolKind::Delay => self.pools.delay.capacity(),
                PoolKind::Multiband => self.pools.multiband.capacity(),
            } - self.pools.used_count(kind);
            if needed > free + released {
                warn!(src, dst, pool = %kind, "Pool exhausted");
                return Err(DspError::PoolExhausted(kind));
            }
        }

        let released: Vec<(PoolKind, u8)> = dropped.iter().filter_map(Stage::pool_slot).collect();
        for (kind, slot) in released {
            self.pools.free(kind, slot);
        }
        self.channels[dst].truncate(dst_from);

        for i in src_from..src_from + count {
            let mut stage = self.channels[src].stages()[i];
            stage.reset_runtime();
            if let Some((kind, src_slot)) = stage.pool_slot() {
                let slot = self.pools.allocate(kind).ok_or(DspError::PoolExhausted(kind))?;
                copy_slot_within(&mut self.pools, kind, slot, src_slot);
                stage.set_pool_slot(Some(slot));
            }
            self.channels[dst].push(stage);
        }
        Ok(())
    }

    // ========================================================================
    // DOUBLE-BUFFER SUPPORT
    // ========================================================================

    /// Deep copy of `other`: flags, chains and pool contents, without allocating
    pub fn copy_from(&mut self, other: &PipelineState) {
        self.global_bypass = other.global_bypass;
        self.sample_rate = other.sample_rate;
        self.routing = other.routing;
        for (dst, src) in self.channels.iter_mut().zip(other.channels.iter()) {
            dst.copy_from(src);
        }
        self.pools.copy_from(&other.pools);
    }

    /// Take over runtime state from the previously active instance
    ///
    /// Only the common prefix of each channel is considered, and only where
    /// the stage type at an index is unchanged. Pooled stages also take over
    /// their slot's runtime contents (FIR history, delay line, multiband
    /// envelopes and filter memories).
    pub fn carry_runtime_from(&mut self, previous: &PipelineState) {
        for (chain, old_chain) in self.channels.iter_mut().zip(previous.channels.iter()) {
            for (stage, old) in chain.stages_mut().iter_mut().zip(old_chain.stages()) {
                if stage.stage_type() != old.stage_type() {
                    continue;
                }
                stage.carry_runtime_from(old);

                let (Some((kind, slot)), Some((_, old_slot))) = (stage.pool_slot(), old.pool_slot())
                else {
                    continue;
                };
                match kind {
                    PoolKind::Fir => {
                        if let (Some(dst), Some(src)) = (
                            self.pools.fir.get_mut(Some(slot)),
                            previous.pools.fir.get(Some(old_slot)),
                        ) {
                            dst.delay.copy_from_slice(&src.delay);
                        }
                    }
                    PoolKind::Delay => {
                        if let (Some(dst), Some(src)) = (
                            self.pools.delay.get_mut(Some(slot)),
                            previous.pools.delay.get(Some(old_slot)),
                        ) {
                            dst.samples.copy_from_slice(&src.samples);
                        }
                    }
                    PoolKind::Multiband => {
                        if let (Some(dst), Some(src)) = (
                            self.pools.multiband.get_mut(Some(slot)),
                            previous.pools.multiband.get(Some(old_slot)),
                        ) {
                            dst.carry_runtime_from(src);
                        }
                    }
                }
            }
        }
    }

    /// Run one channel's chain over a mono block
    pub fn process_channel(&mut self, channel: usize, buffer: &mut [f32]) {
        let Some(chain) = self.channels.get_mut(channel) else {
            return;
        };
        let mut ctx = ProcessContext {
            sample_rate: self.sample_rate,
            pools: &mut self.pools,
        };
        chain.process(buffer, &mut ctx);
    }
}

/// Copy one slot's contents onto another slot of the same pool
fn copy_slot_within(pools: &mut Pools, kind: PoolKind, dst: u8, src: u8) {
    match kind {
        PoolKind::Fir => {
            if let Some(taps) = pools.fir.get(Some(src)).map(|b| b.taps) {
                if let Some(buffer) = pools.fir.get_mut(Some(dst)) {
                    buffer.taps = taps;
                }
            }
        }
        PoolKind::Multiband => {
            let Some(source) = pools.multiband.get(Some(src)) else {
                return;
            };
            let (freqs, bands, crossovers) =
                (source.crossover_freqs, source.bands, source.crossovers);
            if let Some(slot) = pools.multiband.get_mut(Some(dst)) {
                slot.crossover_freqs = freqs;
                slot.bands = bands;
                slot.crossovers = crossovers;
                for band in &mut slot.bands {
                    band.envelope = 0.0;
                    band.gain_reduction = 0.0;
                }
                for pair in &mut slot.crossovers {
                    for section in pair {
                        section.delay = [0.0; 2];
                    }
                }
            }
        }
        PoolKind::Delay => {}
    }
}

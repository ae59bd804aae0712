//! Stage data model
//!
//! A [`Stage`] is one step of a channel chain: an enable flag, a short
//! label and a [`StageKind`] payload tagged by the stage type. Payloads mix
//! user parameters with runtime fields (filter delays, envelopes, ramp
//! state). Runtime fields are owned by the audio context once the stage is
//! active and carried across configuration swaps.
//!
//! Stages never embed large buffers. FIR taps, delay lines and multiband
//! band data live in the [`Pools`](crate::domain::pool::Pools) of the owning
//! pipeline state and are referenced by slot index.

use crate::domain::coefficients::{compute_biquad_coeffs, db_to_linear, BiquadCoeffs};
use crate::domain::pool::PoolKind;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed sizes of the pipeline
pub mod limits {
    /// Independent processing channels (two stereo pairs)
    pub const MAX_CHANNELS: usize = 4;
    /// Stages per channel chain
    pub const MAX_STAGES: usize = 20;
    /// Size of the pre-seeded parametric-EQ band region
    pub const PEQ_BANDS: usize = 10;
    /// Largest block accepted by the audio path
    pub const MAX_FRAMES: usize = 256;

    pub const MAX_FIR_TAPS: usize = 256;
    pub const MAX_FIR_SLOTS: usize = 2;
    /// 100 ms at 48 kHz
    pub const MAX_DELAY_SAMPLES: usize = 4800;
    pub const MAX_DELAY_SLOTS: usize = 4;
    pub const MULTIBAND_MAX_SLOTS: usize = 1;
    pub const MULTIBAND_MAX_BANDS: usize = 4;

    /// Butterworth Q, used whenever a Q is missing or non-positive
    pub const DEFAULT_Q: f32 = 0.707;
    /// Length of the coefficient glide started by a swap
    pub const MORPH_SAMPLES: usize = 64;
    /// Coefficients are re-interpolated once per chunk during a glide
    pub const MORPH_CHUNK: usize = 8;

    /// Full-scale value of a 24-bit sample carried in an i32
    pub const FULL_SCALE_24BIT: f32 = 8_388_607.0;

    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Longest label, in bytes
    pub const LABEL_LEN: usize = 15;
}

use limits::*;

// ============================================================================
// STAGE TYPES
// ============================================================================

/// Second-order (and first-order) section responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    Lpf,
    Hpf,
    Bpf,
    Notch,
    Peq,
    LowShelf,
    HighShelf,
    Allpass,
    Allpass360,
    Allpass180,
    Bpf0Db,
    Custom,
    Lpf1st,
    Hpf1st,
    Linkwitz,
}

impl FilterType {
    pub const ALL: [FilterType; 15] = [
        FilterType::Lpf,
        FilterType::Hpf,
        FilterType::Bpf,
        FilterType::Notch,
        FilterType::Peq,
        FilterType::LowShelf,
        FilterType::HighShelf,
        FilterType::Allpass,
        FilterType::Allpass360,
        FilterType::Allpass180,
        FilterType::Bpf0Db,
        FilterType::Custom,
        FilterType::Lpf1st,
        FilterType::Hpf1st,
        FilterType::Linkwitz,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilterType::Lpf => "LPF",
            FilterType::Hpf => "HPF",
            FilterType::Bpf => "BPF",
            FilterType::Notch => "NOTCH",
            FilterType::Peq => "PEQ",
            FilterType::LowShelf => "LOW_SHELF",
            FilterType::HighShelf => "HIGH_SHELF",
            FilterType::Allpass => "ALLPASS",
            FilterType::Allpass360 => "ALLPASS_360",
            FilterType::Allpass180 => "ALLPASS_180",
            FilterType::Bpf0Db => "BPF_0DB",
            FilterType::Custom => "CUSTOM",
            FilterType::Lpf1st => "LPF_1ST",
            FilterType::Hpf1st => "HPF_1ST",
            FilterType::Linkwitz => "LINKWITZ",
        }
    }
}

impl Serialize for FilterType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Stage type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageType {
    Biquad(FilterType),
    Limiter,
    Fir,
    Gain,
    Delay,
    Polarity,
    Mute,
    Compressor,
    Decimator,
    Convolution,
    NoiseGate,
    ToneControl,
    SpeakerProtection,
    StereoWidth,
    Loudness,
    BassEnhance,
    MultibandCompressor,
}

impl StageType {
    pub const NON_BIQUAD: [StageType; 16] = [
        StageType::Limiter,
        StageType::Fir,
        StageType::Gain,
        StageType::Delay,
        StageType::Polarity,
        StageType::Mute,
        StageType::Compressor,
        StageType::Decimator,
        StageType::Convolution,
        StageType::NoiseGate,
        StageType::ToneControl,
        StageType::SpeakerProtection,
        StageType::StereoWidth,
        StageType::Loudness,
        StageType::BassEnhance,
        StageType::MultibandCompressor,
    ];

    pub fn is_biquad(&self) -> bool {
        matches!(self, StageType::Biquad(_))
    }

    /// Pool a stage of this type draws a slot from when it is added
    pub fn pool_kind(&self) -> Option<PoolKind> {
        match self {
            StageType::Fir => Some(PoolKind::Fir),
            StageType::Delay => Some(PoolKind::Delay),
            StageType::MultibandCompressor => Some(PoolKind::Multiband),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageType::Biquad(filter) => filter.name(),
            StageType::Limiter => "LIMITER",
            StageType::Fir => "FIR",
            StageType::Gain => "GAIN",
            StageType::Delay => "DELAY",
            StageType::Polarity => "POLARITY",
            StageType::Mute => "MUTE",
            StageType::Compressor => "COMPRESSOR",
            StageType::Decimator => "DECIMATOR",
            StageType::Convolution => "CONVOLUTION",
            StageType::NoiseGate => "NOISE_GATE",
            StageType::ToneControl => "TONE_CTRL",
            StageType::SpeakerProtection => "SPEAKER_PROT",
            StageType::StereoWidth => "STEREO_WIDTH",
            StageType::Loudness => "LOUDNESS",
            StageType::BassEnhance => "BASS_ENHANCE",
            StageType::MultibandCompressor => "MULTIBAND_COMP",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for StageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Error returned when parsing an unknown stage type name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown stage type: {0}")]
pub struct UnknownStageType(pub String);

impl FromStr for StageType {
    type Err = UnknownStageType;

    /// Case-insensitive; accepts the names produced by [`StageType::name`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        FilterType::ALL
            .iter()
            .map(|f| StageType::Biquad(*f))
            .chain(StageType::NON_BIQUAD)
            .find(|t| t.name() == upper)
            .ok_or_else(|| UnknownStageType(s.to_string()))
    }
}

// ============================================================================
// LABEL
// ============================================================================

/// Short inline label, truncated to [`LABEL_LEN`] bytes on a char boundary
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StageLabel {
    bytes: [u8; LABEL_LEN],
    len: u8,
}

impl StageLabel {
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(LABEL_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; LABEL_LEN];
        bytes[..end].copy_from_slice(&text.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StageLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Pending coefficient glide: interpolate from `from` toward the declared set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoeffMorph {
    pub from: BiquadCoeffs,
    pub remaining: usize,
}

/// Biquad section parameters
///
/// `coeffs` always holds the declared coefficients. While `morph` is set the
/// audio path glides toward them from the previous active set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BiquadParams {
    pub frequency: f32,
    /// Boost/cut in dB; the pole frequency in Hz for the Linkwitz transform
    pub gain: f32,
    pub q: f32,
    /// Target Q of the Linkwitz transform
    pub q2: f32,
    pub coeffs: BiquadCoeffs,
    #[serde(skip)]
    pub delay: [f32; 2],
    #[serde(skip)]
    pub morph: Option<CoeffMorph>,
}

impl Default for BiquadParams {
    fn default() -> Self {
        Self {
            frequency: 1000.0,
            gain: 0.0,
            q: DEFAULT_Q,
            q2: DEFAULT_Q,
            coeffs: BiquadCoeffs::UNITY,
            delay: [0.0; 2],
            morph: None,
        }
    }
}

impl BiquadParams {
    /// Coefficients the audio path is currently running
    pub fn effective_coeffs(&self) -> BiquadCoeffs {
        match self.morph {
            Some(m) => {
                let t = 1.0 - m.remaining as f32 / MORPH_SAMPLES as f32;
                m.from.lerp(&self.coeffs, t)
            }
            None => self.coeffs,
        }
    }

    /// Glide from `start` to the declared coefficients, unless they already match
    pub fn begin_morph(&mut self, start: BiquadCoeffs) {
        self.morph = (start != self.coeffs).then_some(CoeffMorph {
            from: start,
            remaining: MORPH_SAMPLES,
        });
    }
}

/// Internal fixed section used by compound stages
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BiquadSection {
    pub coeffs: BiquadCoeffs,
    #[serde(skip)]
    pub delay: [f32; 2],
}

impl BiquadSection {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            delay: [0.0; 2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimiterParams {
    pub threshold_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub ratio: f32,
    #[serde(skip)]
    pub envelope: f32,
    /// Worst reduction of the last block, in dB (≤ 0)
    pub gain_reduction: f32,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            threshold_db: 0.0,
            attack_ms: 5.0,
            release_ms: 50.0,
            ratio: 20.0,
            envelope: 0.0,
            gain_reduction: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FirParams {
    pub num_taps: u16,
    #[serde(skip)]
    pub delay_pos: u16,
    pub slot: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GainParams {
    pub gain_db: f32,
    pub gain_linear: f32,
    /// Ramped gain actually applied
    #[serde(skip)]
    pub current_linear: f32,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            gain_db: 0.0,
            gain_linear: 1.0,
            current_linear: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DelayParams {
    pub delay_samples: u32,
    #[serde(skip)]
    pub write_pos: u32,
    pub slot: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolarityParams {
    pub inverted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MuteParams {
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressorParams {
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

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -20.0,
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

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseGateParams {
    pub threshold_db: f32,
    pub attack_ms: f32,
    pub hold_ms: f32,
    pub release_ms: f32,
    /// `<= 1` is a hard gate, above that a downward expander
    pub ratio: f32,
    /// Deepest attenuation, in dB
    pub range_db: f32,
    #[serde(skip)]
    pub envelope: f32,
    #[serde(skip)]
    pub hold_counter: f32,
    pub gain_reduction: f32,
}

impl Default for NoiseGateParams {
    fn default() -> Self {
        Self {
            threshold_db: -60.0,
            attack_ms: 1.0,
            hold_ms: 50.0,
            release_ms: 100.0,
            ratio: 1.0,
            range_db: -80.0,
            envelope: 0.0,
            hold_counter: 0.0,
            gain_reduction: 0.0,
        }
    }
}

/// Bass shelf, mid peak and treble shelf in cascade
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ToneControlParams {
    pub bass_gain_db: f32,
    pub mid_gain_db: f32,
    pub treble_gain_db: f32,
    #[serde(skip)]
    pub bass: BiquadSection,
    #[serde(skip)]
    pub mid: BiquadSection,
    #[serde(skip)]
    pub treble: BiquadSection,
}

impl ToneControlParams {
    pub const BASS_FREQ: f32 = 100.0;
    pub const MID_FREQ: f32 = 1000.0;
    pub const TREBLE_FREQ: f32 = 10000.0;

    pub fn update_coefficients(&mut self, sample_rate: u32) {
        let design = |filter, freq, gain| {
            BiquadCoeffs::design(filter, freq, gain, DEFAULT_Q, DEFAULT_Q, sample_rate)
                .unwrap_or_default()
        };
        self.bass.coeffs = design(FilterType::LowShelf, Self::BASS_FREQ, self.bass_gain_db);
        self.mid.coeffs = design(FilterType::Peq, Self::MID_FREQ, self.mid_gain_db);
        self.treble.coeffs = design(FilterType::HighShelf, Self::TREBLE_FREQ, self.treble_gain_db);
    }
}

/// Thermal and excursion model of a driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeakerProtectionParams {
    pub power_rating_w: f32,
    pub impedance_ohms: f32,
    pub thermal_tau_ms: f32,
    pub excursion_limit_mm: f32,
    pub driver_diameter_mm: f32,
    pub max_temp_c: f32,
    pub current_temp_c: f32,
    #[serde(skip)]
    pub envelope: f32,
    pub gain_reduction: f32,
}

impl SpeakerProtectionParams {
    pub const AMBIENT_TEMP_C: f32 = 25.0;
}

impl Default for SpeakerProtectionParams {
    fn default() -> Self {
        Self {
            power_rating_w: 100.0,
            impedance_ohms: 8.0,
            thermal_tau_ms: 2000.0,
            excursion_limit_mm: 5.0,
            driver_diameter_mm: 165.0,
            max_temp_c: 120.0,
            current_temp_c: Self::AMBIENT_TEMP_C,
            envelope: 0.0,
            gain_reduction: 0.0,
        }
    }
}

/// Mid/side width, applied to the channel pair by the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StereoWidthParams {
    /// 0 = mono, 100 = unchanged, 200 = double side level
    pub width: f32,
    pub center_gain_db: f32,
    pub center_gain_linear: f32,
}

impl Default for StereoWidthParams {
    fn default() -> Self {
        Self {
            width: 100.0,
            center_gain_db: 0.0,
            center_gain_linear: 1.0,
        }
    }
}

/// Level-dependent bass and treble boost
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoudnessParams {
    pub reference_level_db: f32,
    pub current_level_db: f32,
    /// Percentage of the full compensation
    pub amount: f32,
    #[serde(skip)]
    pub bass: BiquadSection,
    #[serde(skip)]
    pub treble: BiquadSection,
}

impl Default for LoudnessParams {
    fn default() -> Self {
        Self {
            reference_level_db: 85.0,
            current_level_db: 85.0,
            amount: 100.0,
            bass: BiquadSection::default(),
            treble: BiquadSection::default(),
        }
    }
}

impl LoudnessParams {
    pub const BASS_FREQ: f32 = 100.0;
    pub const TREBLE_FREQ: f32 = 10000.0;
    pub const MAX_BASS_BOOST_DB: f32 = 15.0;
    pub const MAX_TREBLE_BOOST_DB: f32 = 8.0;

    /// Boost in dB before the per-shelf caps
    pub fn compensation_db(&self) -> f32 {
        ((self.reference_level_db - self.current_level_db) * self.amount / 100.0).max(0.0)
    }

    pub fn update_coefficients(&mut self, sample_rate: u32) {
        let boost = self.compensation_db();
        let bass = boost.min(Self::MAX_BASS_BOOST_DB);
        let treble = boost.min(Self::MAX_TREBLE_BOOST_DB);
        self.bass.coeffs = BiquadCoeffs::design(
            FilterType::LowShelf,
            Self::BASS_FREQ,
            bass,
            DEFAULT_Q,
            DEFAULT_Q,
            sample_rate,
        )
        .unwrap_or_default();
        self.treble.coeffs = BiquadCoeffs::design(
            FilterType::HighShelf,
            Self::TREBLE_FREQ,
            treble,
            DEFAULT_Q,
            DEFAULT_Q,
            sample_rate,
        )
        .unwrap_or_default();
    }
}

/// Which harmonics the bass enhancer synthesizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmonicOrder {
    Second,
    Third,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BassEnhanceParams {
    pub frequency: f32,
    pub harmonic_gain_db: f32,
    pub harmonic_gain_linear: f32,
    /// Wet percentage
    pub mix: f32,
    pub order: HarmonicOrder,
    #[serde(skip)]
    pub hpf: BiquadSection,
    #[serde(skip)]
    pub bpf: BiquadSection,
}

impl Default for BassEnhanceParams {
    fn default() -> Self {
        Self {
            frequency: 80.0,
            harmonic_gain_db: 0.0,
            harmonic_gain_linear: 1.0,
            mix: 50.0,
            order: HarmonicOrder::Second,
            hpf: BiquadSection::default(),
            bpf: BiquadSection::default(),
        }
    }
}

impl BassEnhanceParams {
    pub fn update_coefficients(&mut self, sample_rate: u32) {
        self.harmonic_gain_linear = db_to_linear(self.harmonic_gain_db);
        self.hpf.coeffs = BiquadCoeffs::design(
            FilterType::Hpf,
            self.frequency,
            0.0,
            DEFAULT_Q,
            DEFAULT_Q,
            sample_rate,
        )
        .unwrap_or_default();
        self.bpf.coeffs = BiquadCoeffs::design(
            FilterType::Bpf,
            self.frequency * 2.0,
            0.0,
            DEFAULT_Q,
            DEFAULT_Q,
            sample_rate,
        )
        .unwrap_or_default();
    }
}

/// Band settings live in the multiband pool slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MultibandCompressorParams {
    pub num_bands: u8,
    pub slot: Option<u8>,
}

impl Default for MultibandCompressorParams {
    fn default() -> Self {
        Self {
            num_bands: 3,
            slot: None,
        }
    }
}

/// Data-model placeholder; processes as a no-op
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecimatorParams {
    pub factor: u8,
    pub num_taps: u16,
    #[serde(skip)]
    pub delay_pos: u16,
    pub slot: Option<u8>,
}

impl Default for DecimatorParams {
    fn default() -> Self {
        Self {
            factor: 2,
            num_taps: 0,
            delay_pos: 0,
            slot: None,
        }
    }
}

/// Data-model placeholder; processes as a no-op
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ConvolutionParams {
    pub slot: Option<u8>,
    pub ir_length: u32,
}

// ============================================================================
// STAGE
// ============================================================================

/// Payload of a stage, tagged by its type
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    Biquad {
        filter: FilterType,
        #[serde(flatten)]
        params: BiquadParams,
    },
    Limiter(LimiterParams),
    Fir(FirParams),
    Gain(GainParams),
    Delay(DelayParams),
    Polarity(PolarityParams),
    Mute(MuteParams),
    Compressor(CompressorParams),
    Decimator(DecimatorParams),
    Convolution(ConvolutionParams),
    NoiseGate(NoiseGateParams),
    ToneControl(ToneControlParams),
    SpeakerProtection(SpeakerProtectionParams),
    StereoWidth(StereoWidthParams),
    Loudness(LoudnessParams),
    BassEnhance(BassEnhanceParams),
    MultibandCompressor(MultibandCompressorParams),
}

impl StageKind {
    /// Default payload for `stage_type`
    pub fn new(stage_type: StageType) -> Self {
        match stage_type {
            StageType::Biquad(filter) => StageKind::Biquad {
                filter,
                params: BiquadParams::default(),
            },
            StageType::Limiter => StageKind::Limiter(LimiterParams::default()),
            StageType::Fir => StageKind::Fir(FirParams::default()),
            StageType::Gain => StageKind::Gain(GainParams::default()),
            StageType::Delay => StageKind::Delay(DelayParams::default()),
            StageType::Polarity => StageKind::Polarity(PolarityParams { inverted: true }),
            StageType::Mute => StageKind::Mute(MuteParams { muted: true }),
            StageType::Compressor => StageKind::Compressor(CompressorParams::default()),
            StageType::Decimator => StageKind::Decimator(DecimatorParams::default()),
            StageType::Convolution => StageKind::Convolution(ConvolutionParams::default()),
            StageType::NoiseGate => StageKind::NoiseGate(NoiseGateParams::default()),
            StageType::ToneControl => StageKind::ToneControl(ToneControlParams::default()),
            StageType::SpeakerProtection => {
                StageKind::SpeakerProtection(SpeakerProtectionParams::default())
            }
            StageType::StereoWidth => StageKind::StereoWidth(StereoWidthParams::default()),
            StageType::Loudness => StageKind::Loudness(LoudnessParams::default()),
            StageType::BassEnhance => StageKind::BassEnhance(BassEnhanceParams::default()),
            StageType::MultibandCompressor => {
                StageKind::MultibandCompressor(MultibandCompressorParams::default())
            }
        }
    }

    pub fn stage_type(&self) -> StageType {
        match self {
            StageKind::Biquad { filter, .. } => StageType::Biquad(*filter),
            StageKind::Limiter(_) => StageType::Limiter,
            StageKind::Fir(_) => StageType::Fir,
            StageKind::Gain(_) => StageType::Gain,
            StageKind::Delay(_) => StageType::Delay,
            StageKind::Polarity(_) => StageType::Polarity,
            StageKind::Mute(_) => StageType::Mute,
            StageKind::Compressor(_) => StageType::Compressor,
            StageKind::Decimator(_) => StageType::Decimator,
            StageKind::Convolution(_) => StageType::Convolution,
            StageKind::NoiseGate(_) => StageType::NoiseGate,
            StageKind::ToneControl(_) => StageType::ToneControl,
            StageKind::SpeakerProtection(_) => StageType::SpeakerProtection,
            StageKind::StereoWidth(_) => StageType::StereoWidth,
            StageKind::Loudness(_) => StageType::Loudness,
            StageKind::BassEnhance(_) => StageType::BassEnhance,
            StageKind::MultibandCompressor(_) => StageType::MultibandCompressor,
        }
    }
}

/// One entry of a channel chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stage {
    pub enabled: bool,
    pub label: StageLabel,
    /// Changing the variant of a pooled stage in place leaks its slot;
    /// remove and re-add the stage instead.
    #[serde(flatten)]
    pub kind: StageKind,
}

impl Default for Stage {
    fn default() -> Self {
        Self::new(StageType::Biquad(FilterType::Peq))
    }
}

impl Stage {
    /// Enabled stage with default parameters and unity coefficients
    pub fn new(stage_type: StageType) -> Self {
        Self {
            enabled: true,
            label: StageLabel::default(),
            kind: StageKind::new(stage_type),
        }
    }

    /// Biquad stage with coefficients already designed for `sample_rate`
    pub fn biquad(filter: FilterType, frequency: f32, gain: f32, q: f32, sample_rate: u32) -> Self {
        let mut params = BiquadParams {
            frequency,
            gain,
            q,
            ..BiquadParams::default()
        };
        compute_biquad_coeffs(&mut params, filter, sample_rate);
        Self {
            enabled: true,
            label: StageLabel::default(),
            kind: StageKind::Biquad { filter, params },
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = StageLabel::new(label);
        self
    }

    pub fn stage_type(&self) -> StageType {
        self.kind.stage_type()
    }

    /// Pool slot referenced by this stage, if any
    pub fn pool_slot(&self) -> Option<(PoolKind, u8)> {
        match &self.kind {
            StageKind::Fir(p) => p.slot.map(|s| (PoolKind::Fir, s)),
            StageKind::Delay(p) => p.slot.map(|s| (PoolKind::Delay, s)),
            StageKind::MultibandCompressor(p) => p.slot.map(|s| (PoolKind::Multiband, s)),
            _ => None,
        }
    }

    /// Point the stage at a pool slot; ignored for unpooled types
    pub(crate) fn set_pool_slot(&mut self, slot: Option<u8>) {
        match &mut self.kind {
            StageKind::Fir(p) => p.slot = slot,
            StageKind::Delay(p) => p.slot = slot,
            StageKind::MultibandCompressor(p) => p.slot = slot,
            _ => {}
        }
    }

    /// Last reported gain reduction for dynamics stages, in dB (≤ 0)
    pub fn gain_reduction(&self) -> Option<f32> {
        match &self.kind {
            StageKind::Limiter(p) => Some(p.gain_reduction),
            StageKind::Compressor(p) => Some(p.gain_reduction),
            StageKind::NoiseGate(p) => Some(p.gain_reduction),
            StageKind::SpeakerProtection(p) => Some(p.gain_reduction),
            _ => None,
        }
    }

    pub fn biquad_params(&self) -> Option<&BiquadParams> {
        match &self.kind {
            StageKind::Biquad { params, .. } => Some(params),
            _ => None,
        }
    }

    pub fn biquad_params_mut(&mut self) -> Option<&mut BiquadParams> {
        match &mut self.kind {
            StageKind::Biquad { params, .. } => Some(params),
            _ => None,
        }
    }

    /// Recompute every derived field (coefficients, linear gains) from the parameters
    ///
    /// Runtime fields are left alone, except that a gain stage jumps straight
    /// to its new level; ramping only happens across a swap.
    pub fn update_derived(&mut self, sample_rate: u32) {
        match &mut self.kind {
            StageKind::Biquad { filter, params } => {
                compute_biquad_coeffs(params, *filter, sample_rate)
            }
            StageKind::Gain(p) => {
                p.gain_linear = db_to_linear(p.gain_db);
                p.current_linear = p.gain_linear;
            }
            StageKind::Compressor(p) => p.makeup_linear = db_to_linear(p.makeup_gain_db),
            StageKind::ToneControl(p) => p.update_coefficients(sample_rate),
            StageKind::Loudness(p) => p.update_coefficients(sample_rate),
            StageKind::BassEnhance(p) => p.update_coefficients(sample_rate),
            StageKind::StereoWidth(p) => p.center_gain_linear = db_to_linear(p.center_gain_db),
            _ => {}
        }
    }

    /// Clear filter memories, envelopes and ramp state
    pub fn reset_runtime(&mut self) {
        match &mut self.kind {
            StageKind::Biquad { params, .. } => {
                params.delay = [0.0; 2];
                params.morph = None;
            }
            StageKind::Limiter(p) => {
                p.envelope = 0.0;
                p.gain_reduction = 0.0;
            }
            StageKind::Fir(p) => p.delay_pos = 0,
            StageKind::Gain(p) => p.current_linear = p.gain_linear,
            StageKind::Delay(p) => p.write_pos = 0,
            StageKind::Compressor(p) => {
                p.envelope = 0.0;
                p.gain_reduction = 0.0;
            }
            StageKind::Decimator(p) => p.delay_pos = 0,
            StageKind::NoiseGate(p) => {
                p.envelope = 0.0;
                p.hold_counter = 0.0;
                p.gain_reduction = 0.0;
            }
            StageKind::ToneControl(p) => {
                for section in [&mut p.bass, &mut p.mid, &mut p.treble] {
                    section.delay = [0.0; 2];
                }
            }
            StageKind::SpeakerProtection(p) => {
                p.current_temp_c = SpeakerProtectionParams::AMBIENT_TEMP_C;
                p.envelope = 0.0;
                p.gain_reduction = 0.0;
            }
            StageKind::Loudness(p) => {
                p.bass.delay = [0.0; 2];
                p.treble.delay = [0.0; 2];
            }
            StageKind::BassEnhance(p) => {
                p.hpf.delay = [0.0; 2];
                p.bpf.delay = [0.0; 2];
            }
            StageKind::Polarity(_)
            | StageKind::Mute(_)
            | StageKind::Convolution(_)
            | StageKind::StereoWidth(_)
            | StageKind::MultibandCompressor(_) => {}
        }
    }

    /// Take over the runtime fields of `previous`, which must have the same type
    ///
    /// Pool contents are handled separately by the owner of both pools.
    pub fn carry_runtime_from(&mut self, previous: &Stage) {
        match (&mut self.kind, &previous.kind) {
            (StageKind::Biquad { params, .. }, StageKind::Biquad { params: old, .. }) => {
                params.delay = old.delay;
                params.begin_morph(old.effective_coeffs());
            }
            (StageKind::Limiter(p), StageKind::Limiter(old)) => {
                p.envelope = old.envelope;
                p.gain_reduction = old.gain_reduction;
            }
            (StageKind::Fir(p), StageKind::Fir(old)) => p.delay_pos = old.delay_pos,
            (StageKind::Gain(p), StageKind::Gain(old)) => p.current_linear = old.current_linear,
            (StageKind::Delay(p), StageKind::Delay(old)) => p.write_pos = old.write_pos,
            (StageKind::Compressor(p), StageKind::Compressor(old)) => {
                p.envelope = old.envelope;
                p.gain_reduction = old.gain_reduction;
            }
            (StageKind::Decimator(p), StageKind::Decimator(old)) => p.delay_pos = old.delay_pos,
            (StageKind::NoiseGate(p), StageKind::NoiseGate(old)) => {
                p.envelope = old.envelope;
                p.hold_counter = old.hold_counter;
                p.gain_reduction = old.gain_reduction;
            }
            (StageKind::ToneControl(p), StageKind::ToneControl(old)) => {
                p.bass.delay = old.bass.delay;
                p.mid.delay = old.mid.delay;
                p.treble.delay = old.treble.delay;
            }
            (StageKind::SpeakerProtection(p), StageKind::SpeakerProtection(old)) => {
                p.current_temp_c = old.current_temp_c;
                p.envelope = old.envelope;
                p.gain_reduction = old.gain_reduction;
            }
            (StageKind::Loudness(p), StageKind::Loudness(old)) => {
                p.bass.delay = old.bass.delay;
                p.treble.delay = old.treble.delay;
            }
            (StageKind::BassEnhance(p), StageKind::BassEnhance(old)) => {
                p.hpf.delay = old.hpf.delay;
                p.bpf.delay = old.bpf.delay;
            }
            _ => {}
        }
    }
}

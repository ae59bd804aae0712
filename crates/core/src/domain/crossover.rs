//! Crossover cascades
//!
//! Butterworth and Linkwitz-Riley crossovers are inserted as consecutive
//! biquad stages. Odd Butterworth orders carry one first-order section at
//! the head of the cascade.

use crate::domain::error::{DspError, Result};
use crate::domain::stage::{limits::*, FilterType, Stage};
use crate::domain::state::PipelineState;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

pub const MAX_BUTTERWORTH_ORDER: u8 = 8;
pub const MAX_LINKWITZ_RILEY_ORDER: u8 = 24;

/// Q of the single LR2 section (two coincident first-order poles)
pub const LR2_Q: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "family", content = "order", rename_all = "snake_case")]
pub enum CrossoverKind {
    /// Order 1..=8
    Butterworth(u8),
    /// Even order 2..=24
    LinkwitzRiley(u8),
}

impl CrossoverKind {
    pub fn validate(&self) -> Result<()> {
        match *self {
            CrossoverKind::Butterworth(n) if (1..=MAX_BUTTERWORTH_ORDER).contains(&n) => Ok(()),
            CrossoverKind::LinkwitzRiley(m)
                if m % 2 == 0 && (2..=MAX_LINKWITZ_RILEY_ORDER).contains(&m) =>
            {
                Ok(())
            }
            other => Err(DspError::InvalidParameter(format!(
                "unsupported crossover {other}"
            ))),
        }
    }

    /// Number of stages the cascade occupies
    pub fn section_count(&self) -> usize {
        match *self {
            CrossoverKind::Butterworth(n) => butterworth_section_count(n),
            CrossoverKind::LinkwitzRiley(2) => 1,
            CrossoverKind::LinkwitzRiley(m) => 2 * butterworth_section_count(m / 2),
        }
    }
}

impl fmt::Display for CrossoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossoverKind::Butterworth(n) => write!(f, "BW{n}"),
            CrossoverKind::LinkwitzRiley(m) => write!(f, "LR{m}"),
        }
    }
}

impl FromStr for CrossoverKind {
    type Err = DspError;

    /// `BW<n>` or `LR<m>`, case-insensitive
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let parse_order = |digits: &str| {
            digits
                .parse::<u8>()
                .map_err(|_| DspError::InvalidParameter(format!("bad crossover order in {s:?}")))
        };
        let kind = if let Some(order) = upper.strip_prefix("BW") {
            CrossoverKind::Butterworth(parse_order(order)?)
        } else if let Some(order) = upper.strip_prefix("LR") {
            CrossoverKind::LinkwitzRiley(parse_order(order)?)
        } else {
            return Err(DspError::InvalidParameter(format!("unknown crossover {s:?}")));
        };
        kind.validate()?;
        Ok(kind)
    }
}

/// Which side of the crossover a cascade passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossoverRole {
    Lowpass,
    Highpass,
}

impl CrossoverRole {
    fn second_order(&self) -> FilterType {
        match self {
            CrossoverRole::Lowpass => FilterType::Lpf,
            CrossoverRole::Highpass => FilterType::Hpf,
        }
    }

    fn first_order(&self) -> FilterType {
        match self {
            CrossoverRole::Lowpass => FilterType::Lpf1st,
            CrossoverRole::Highpass => FilterType::Hpf1st,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            CrossoverRole::Lowpass => "LPF",
            CrossoverRole::Highpass => "HPF",
        }
    }
}

impl FromStr for CrossoverRole {
    type Err = DspError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lowpass" | "lpf" | "low" => Ok(CrossoverRole::Lowpass),
            "highpass" | "hpf" | "high" => Ok(CrossoverRole::Highpass),
            _ => Err(DspError::InvalidParameter(format!("unknown crossover role {s:?}"))),
        }
    }
}

/// One section of a cascade: `None` is the first-order section
pub type SectionQ = Option<f32>;

fn butterworth_section_count(order: u8) -> usize {
    (order / 2 + order % 2) as usize
}

/// Per-section Q of a Butterworth filter of `order`, ascending
///
/// Q_k = 1 / (2·sin((2k−1)π / 2N)) for k = 1..N/2.
pub fn butterworth_q_values(order: u8) -> Vec<f32> {
    let n = f64::from(order);
    let mut qs: Vec<f32> = (1..=order / 2)
        .map(|k| {
            let angle = (2.0 * f64::from(k) - 1.0) * std::f64::consts::PI / (2.0 * n);
            (1.0 / (2.0 * angle.sin())) as f32
        })
        .collect();
    qs.sort_by(f32::total_cmp);
    qs
}

/// Sections of a cascade in insertion order
pub fn cascade_sections(kind: CrossoverKind) -> Result<Vec<SectionQ>> {
    kind.validate()?;
    let butterworth = |order: u8| {
        let head = (order % 2 == 1).then_some(None);
        head.into_iter()
            .chain(butterworth_q_values(order).into_iter().map(Some))
            .collect::<Vec<_>>()
    };
    Ok(match kind {
        CrossoverKind::Butterworth(n) => butterworth(n),
        CrossoverKind::LinkwitzRiley(2) => vec![Some(LR2_Q)],
        CrossoverKind::LinkwitzRiley(m) => {
            let half = butterworth(m / 2);
            half.iter().chain(half.iter()).copied().collect()
        }
    })
}

/// Design the stages of a cascade at `frequency`
pub fn design_crossover(
    kind: CrossoverKind,
    role: CrossoverRole,
    frequency: f32,
    sample_rate: u32,
) -> Result<Vec<Stage>> {
    if !frequency.is_finite() || frequency <= 0.0 || frequency >= sample_rate as f32 / 2.0 {
        return Err(DspError::InvalidParameter(format!(
            "crossover frequency {frequency} Hz outside (0, {}) Hz",
            sample_rate / 2
        )));
    }
    let sections = cascade_sections(kind)?;
    Ok(sections
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let (filter, q) = match q {
                Some(q) => (role.second_order(), *q),
                None => (role.first_order(), DEFAULT_Q),
            };
            Stage::biquad(filter, frequency, 0.0, q, sample_rate)
                .with_label(&format!("{kind} {} {}", role.tag(), i + 1))
        })
        .collect())
}

impl PipelineState {
    /// Insert a crossover cascade at `position` (append when `None`)
    ///
    /// All sections are inserted or none. Returns the index of the first section.
    pub fn insert_crossover(
        &mut self,
        channel: usize,
        kind: CrossoverKind,
        role: CrossoverRole,
        frequency: f32,
        position: Option<usize>,
    ) -> Result<usize> {
        let stages = design_crossover(kind, role, frequency, self.sample_rate())?;
        let chain = self.channel(channel)?;
        if chain.free_slots() < stages.len() {
            warn!(channel, %kind, "No room for crossover");
            return Err(DspError::ChainFull {
                channel,
                requested: stages.len(),
            });
        }

        let first = position.filter(|&p| p <= chain.len()).unwrap_or(chain.len());
        for (offset, stage) in stages.into_iter().enumerate() {
            self.insert_stage(channel, stage, Some(first + offset))?;
        }
        debug!(channel, %kind, ?role, frequency, first, "Crossover inserted");
        Ok(first)
    }

    /// LR4 low-pass on `sub` and LR4 high-pass on every main channel
    pub fn insert_bass_management(
        &mut self,
        sub: usize,
        mains: &[usize],
        frequency: f32,
    ) -> Result<()> {
        const KIND: CrossoverKind = CrossoverKind::LinkwitzRiley(4);
        let needed = KIND.section_count();

        let mut seen = [false; MAX_CHANNELS];
        for &channel in std::iter::once(&sub).chain(mains) {
            if self.channel(channel)?.free_slots() < needed {
                return Err(DspError::ChainFull {
                    channel,
                    requested: needed,
                });
            }
            if std::mem::replace(&mut seen[channel], true) {
                return Err(DspError::InvalidParameter(format!(
                    "channel {channel} listed twice for bass management"
                )));
            }
        }
        design_crossover(KIND, CrossoverRole::Lowpass, frequency, self.sample_rate())?;

        self.insert_crossover(sub, KIND, CrossoverRole::Lowpass, frequency, None)?;
        for &main in mains {
            self.insert_crossover(main, KIND, CrossoverRole::Highpass, frequency, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stage::StageType;
    use proptest::prelude::*;

    const SAMPLE_RATE: u32 = 48000;

    fn dc_gains(stages: &[Stage]) -> Vec<f32> {
        stages
            .iter()
            .map(|s| s.biquad_params().unwrap().coeffs.dc_gain())
            .collect()
    }

    #[test]
    fn test_butterworth_q_values() {
        let bw4 = butterworth_q_values(4);
        assert!((bw4[0] - 0.5412).abs() < 1e-4);
        assert!((bw4[1] - 1.3066).abs() < 1e-4);

        let bw2 = butterworth_q_values(2);
        assert!((bw2[0] - 0.7071).abs() < 1e-4);

        assert_eq!(cascade_sections(CrossoverKind::Butterworth(3)).unwrap().len(), 2);
        let bw3 = cascade_sections(CrossoverKind::Butterworth(3)).unwrap();
        assert_eq!(bw3[0], None);
        assert!((bw3[1].unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_linkwitz_riley_sections() {
        assert_eq!(cascade_sections(CrossoverKind::LinkwitzRiley(2)).unwrap(), vec![Some(0.5)]);

        let lr4 = cascade_sections(CrossoverKind::LinkwitzRiley(4)).unwrap();
        assert_eq!(lr4.len(), 2);
        assert!(lr4.iter().all(|q| (q.unwrap() - 0.7071).abs() < 1e-4));

        let lr6 = cascade_sections(CrossoverKind::LinkwitzRiley(6)).unwrap();
        assert_eq!(lr6.len(), 4);
        assert_eq!(lr6[0], None);
        assert_eq!(lr6[2], None);
    }

    #[test]
    fn test_invalid_orders() {
        for kind in [
            CrossoverKind::Butterworth(0),
            CrossoverKind::Butterworth(9),
            CrossoverKind::LinkwitzRiley(3),
            CrossoverKind::LinkwitzRiley(26),
            CrossoverKind::LinkwitzRiley(0),
        ] {
            assert!(kind.validate().is_err(), "{kind} should be rejected");
        }
    }

    #[test]
    fn test_lr4_dc_gains() {
        let lpf = design_crossover(
            CrossoverKind::LinkwitzRiley(4),
            CrossoverRole::Lowpass,
            2000.0,
            SAMPLE_RATE,
        )
        .unwrap();
        assert_eq!(lpf.len(), 2);
        assert!(dc_gains(&lpf).iter().all(|g| (g - 1.0).abs() < 0.05));

        let hpf = design_crossover(
            CrossoverKind::LinkwitzRiley(4),
            CrossoverRole::Highpass,
            2000.0,
            SAMPLE_RATE,
        )
        .unwrap();
        assert_eq!(hpf.len(), 2);
        assert!(dc_gains(&hpf).iter().all(|g| g.abs() < 0.05));
    }

    #[test]
    fn test_insert_crossover_is_atomic() {
        let mut state = PipelineState::new(SAMPLE_RATE);
        for _ in 0..17 {
            state.add_stage(0, StageType::Gain, None).unwrap();
        }
        let err = state
            .insert_crossover(0, CrossoverKind::LinkwitzRiley(8), CrossoverRole::Lowpass, 100.0, None)
            .unwrap_err();
        assert_eq!(err, DspError::ChainFull { channel: 0, requested: 4 });
        assert_eq!(state.channel(0).unwrap().len(), 17);

        let err = state
            .insert_crossover(1, CrossoverKind::Butterworth(4), CrossoverRole::Lowpass, 30000.0, None)
            .unwrap_err();
        assert!(matches!(err, DspError::InvalidParameter(_)));
        assert!(state.channel(1).unwrap().is_empty());
    }

    #[test]
    fn test_insert_crossover_at_position() {
        let mut state = PipelineState::new(SAMPLE_RATE);
        state.add_stage(0, StageType::Gain, None).unwrap();
        state.add_stage(0, StageType::Limiter, None).unwrap();
        let first = state
            .insert_crossover(0, CrossoverKind::Butterworth(3), CrossoverRole::Highpass, 80.0, Some(1))
            .unwrap();
        assert_eq!(first, 1);
        let types: Vec<_> = state.channel(0).unwrap().stages().iter().map(Stage::stage_type).collect();
        assert_eq!(
            types,
            [
                StageType::Gain,
                StageType::Biquad(FilterType::Hpf1st),
                StageType::Biquad(FilterType::Hpf),
                StageType::Limiter,
            ]
        );
        assert_eq!(state.stage(0, 1).unwrap().label.as_str(), "BW3 HPF 1");
    }

    #[test]
    fn test_bass_management() {
        let mut state = PipelineState::new(SAMPLE_RATE);
        state.insert_bass_management(3, &[0, 1], 80.0).unwrap();
        assert_eq!(state.channel(3).unwrap().len(), 2);
        assert_eq!(
            state.stage(3, 0).unwrap().stage_type(),
            StageType::Biquad(FilterType::Lpf)
        );
        assert_eq!(
            state.stage(0, 1).unwrap().stage_type(),
            StageType::Biquad(FilterType::Hpf)
        );
        assert!(state.channel(2).unwrap().is_empty());

        let mut state = PipelineState::new(SAMPLE_RATE);
        assert!(state.insert_bass_management(0, &[0], 80.0).is_err());
        assert!(state.insert_bass_management(0, &[5], 80.0).is_err());
        assert!(state.channel(0).unwrap().is_empty());
    }

    #[test]
    fn test_parse_kind_and_role() {
        assert_eq!("lr4".parse::<CrossoverKind>(), Ok(CrossoverKind::LinkwitzRiley(4)));
        assert_eq!(" BW3".parse::<CrossoverKind>(), Ok(CrossoverKind::Butterworth(3)));
        assert!("LR5".parse::<CrossoverKind>().is_err());
        assert!("BW9".parse::<CrossoverKind>().is_err());
        assert!("XO4".parse::<CrossoverKind>().is_err());

        assert_eq!("HPF".parse::<CrossoverRole>(), Ok(CrossoverRole::Highpass));
        assert_eq!("lowpass".parse::<CrossoverRole>(), Ok(CrossoverRole::Lowpass));
        assert!("band".parse::<CrossoverRole>().is_err());
    }

    proptest! {
        #[test]
        fn prop_butterworth_section_count(order in 1u8..=8) {
            let sections = cascade_sections(CrossoverKind::Butterworth(order)).unwrap();
            prop_assert_eq!(sections.len(), CrossoverKind::Butterworth(order).section_count());
            prop_assert_eq!(sections.iter().filter(|q| q.is_none()).count(), (order % 2) as usize);
        }

        #[test]
        fn prop_linkwitz_riley_complementary_dc(half in 1u8..=12, freq in 100.0f32..10000.0) {
            let kind = CrossoverKind::LinkwitzRiley(half * 2);
            let lpf = design_crossover(kind, CrossoverRole::Lowpass, freq, SAMPLE_RATE).unwrap();
            let hpf = design_crossover(kind, CrossoverRole::Highpass, freq, SAMPLE_RATE).unwrap();
            let lpf_dc: f32 = dc_gains(&lpf).iter().product();
            let hpf_dc: f32 = dc_gains(&hpf).iter().product();
            prop_assert!((lpf_dc - 1.0).abs() < 0.05);
            prop_assert!(hpf_dc.abs() < 0.05);
        }
    }
}

//! Output routing matrix
//!
//! A `[output][input]` grid of linear gains applied to the post-chain
//! channels once every input of a period has been processed. Each output is
//! a weighted sum of all inputs, read before any output is written.

use crate::domain::coefficients::{db_to_linear, linear_to_db};
use crate::domain::error::{DspError, Result};
use crate::domain::stage::limits::{MAX_CHANNELS, MAX_FRAMES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Gains at or below this level are stored as an exact zero
pub const ROUTING_SILENCE_DB: f32 = -200.0;

/// Named starting points for the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreset {
    /// Each output takes its own input
    Identity,
    /// Every output takes the average of every input
    MonoSum,
    /// Left and right of each pair trade places
    SwapLr,
    /// Output 0 carries the mono sum of the first pair, the rest pass through
    SubSum,
}

impl RoutingPreset {
    pub const ALL: [RoutingPreset; 4] = [
        RoutingPreset::Identity,
        RoutingPreset::MonoSum,
        RoutingPreset::SwapLr,
        RoutingPreset::SubSum,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RoutingPreset::Identity => "identity",
            RoutingPreset::MonoSum => "mono_sum",
            RoutingPreset::SwapLr => "swap_lr",
            RoutingPreset::SubSum => "sub_sum",
        }
    }
}

impl fmt::Display for RoutingPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RoutingPreset {
    type Err = DspError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| DspError::InvalidParameter(format!("unknown routing preset '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingMatrix {
    gains: [[f32; MAX_CHANNELS]; MAX_CHANNELS],
}

impl Default for RoutingMatrix {
    fn default() -> Self {
        Self::from_preset(RoutingPreset::Identity)
    }
}

impl RoutingMatrix {
    pub fn from_preset(preset: RoutingPreset) -> Self {
        let mut matrix = Self {
            gains: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
        };
        matrix.apply_preset(preset);
        matrix
    }

    /// Overwrite every cell with `preset`
    pub fn apply_preset(&mut self, preset: RoutingPreset) {
        let g = &mut self.gains;
        *g = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
        match preset {
            RoutingPreset::Identity => {
                for (i, row) in g.iter_mut().enumerate() {
                    row[i] = 1.0;
                }
            }
            RoutingPreset::MonoSum => {
                *g = [[1.0 / MAX_CHANNELS as f32; MAX_CHANNELS]; MAX_CHANNELS];
            }
            RoutingPreset::SwapLr => {
                for pair in (0..MAX_CHANNELS).step_by(2) {
                    g[pair][pair + 1] = 1.0;
                    g[pair + 1][pair] = 1.0;
                }
            }
            RoutingPreset::SubSum => {
                g[0][0] = 0.5;
                g[0][1] = 0.5;
                for (i, row) in g.iter_mut().enumerate().skip(1) {
                    row[i] = 1.0;
                }
            }
        }
        debug!(%preset, "Routing preset applied");
    }

    /// Linear gain from `input` into `output`
    pub fn gain(&self, output: usize, input: usize) -> Result<f32> {
        Self::check(output, input)?;
        Ok(self.gains[output][input])
    }

    pub fn gain_db(&self, output: usize, input: usize) -> Result<f32> {
        self.gain(output, input).map(linear_to_db)
    }

    pub fn set_gain(&mut self, output: usize, input: usize, gain: f32) -> Result<()> {
        Self::check(output, input)?;
        if !gain.is_finite() {
            return Err(DspError::InvalidParameter(format!("routing gain {gain}")));
        }
        self.gains[output][input] = gain;
        Ok(())
    }

    /// Set one cell in dB; [`ROUTING_SILENCE_DB`] and below mean silence
    pub fn set_gain_db(&mut self, output: usize, input: usize, gain_db: f32) -> Result<()> {
        if gain_db.is_nan() {
            return Err(DspError::InvalidParameter("routing gain is NaN".into()));
        }
        let gain = if gain_db <= ROUTING_SILENCE_DB {
            0.0
        } else {
            db_to_linear(gain_db)
        };
        self.set_gain(output, input, gain)?;
        debug!(output, input, gain_db, "Routing gain set");
        Ok(())
    }

    pub fn rows(&self) -> &[[f32; MAX_CHANNELS]; MAX_CHANNELS] {
        &self.gains
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::from_preset(RoutingPreset::Identity)
    }

    /// Mix `channels` in place over the first `frames` samples
    pub fn apply(&self, channels: &mut [[f32; MAX_FRAMES]; MAX_CHANNELS], frames: usize) {
        for f in 0..frames.min(MAX_FRAMES) {
            let inputs: [f32; MAX_CHANNELS] = std::array::from_fn(|i| channels[i][f]);
            for (output, row) in self.gains.iter().enumerate() {
                channels[output][f] = row
                    .iter()
                    .zip(inputs.iter())
                    .filter(|(g, _)| **g != 0.0)
                    .map(|(g, x)| g * x)
                    .sum();
            }
        }
    }

    fn check(output: usize, input: usize) -> Result<()> {
        if output >= MAX_CHANNELS {
            return Err(DspError::ChannelOutOfRange(output));
        }
        if input >= MAX_CHANNELS {
            return Err(DspError::ChannelOutOfRange(input));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(levels: [f32; MAX_CHANNELS]) -> [[f32; MAX_FRAMES]; MAX_CHANNELS] {
        levels.map(|level| [level; MAX_FRAMES])
    }

    // -------------------------------------------------------------------------
    // Preset Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_default_is_identity() {
        let matrix = RoutingMatrix::default();
        assert!(matrix.is_identity());
        let mut ch = channels([0.1, 0.2, 0.3, 0.4]);
        matrix.apply(&mut ch, 16);
        assert_eq!(ch[2][0], 0.3);
        assert_eq!(ch[3][15], 0.4);
    }

    #[test]
    fn test_mono_sum_averages_every_input() {
        let matrix = RoutingMatrix::from_preset(RoutingPreset::MonoSum);
        let mut ch = channels([0.4, 0.0, -0.4, 0.8]);
        matrix.apply(&mut ch, 8);
        for out in &ch {
            assert!((out[0] - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_swap_lr_trades_each_pair() {
        let matrix = RoutingMatrix::from_preset(RoutingPreset::SwapLr);
        let mut ch = channels([0.1, 0.2, 0.3, 0.4]);
        matrix.apply(&mut ch, 4);
        assert_eq!([ch[0][0], ch[1][0], ch[2][0], ch[3][0]], [0.2, 0.1, 0.4, 0.3]);
    }

    #[test]
    fn test_sub_sum_folds_first_pair_into_output_zero() {
        let matrix = RoutingMatrix::from_preset(RoutingPreset::SubSum);
        let mut ch = channels([0.6, 0.2, 0.3, 0.4]);
        matrix.apply(&mut ch, 4);
        assert!((ch[0][0] - 0.4).abs() < 1e-6);
        assert_eq!([ch[1][0], ch[2][0], ch[3][0]], [0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_preset_names_parse_back() {
        for preset in RoutingPreset::ALL {
            assert_eq!(preset.name().parse::<RoutingPreset>().unwrap(), preset);
        }
        assert!("surround".parse::<RoutingPreset>().is_err());
    }

    // -------------------------------------------------------------------------
    // Gain Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_set_gain_db_converts_to_linear() {
        let mut matrix = RoutingMatrix::default();
        matrix.set_gain_db(0, 2, -6.0).unwrap();
        assert!((matrix.gain(0, 2).unwrap() - 0.501).abs() < 1e-3);
        assert!((matrix.gain_db(0, 2).unwrap() + 6.0).abs() < 1e-3);

        matrix.set_gain_db(1, 1, ROUTING_SILENCE_DB).unwrap();
        assert_eq!(matrix.gain(1, 1).unwrap(), 0.0);
        matrix.set_gain_db(1, 1, f32::NEG_INFINITY).unwrap();
        assert_eq!(matrix.gain(1, 1).unwrap(), 0.0);
    }

    #[test]
    fn test_set_gain_rejects_bad_cells() {
        let mut matrix = RoutingMatrix::default();
        assert_eq!(
            matrix.set_gain_db(MAX_CHANNELS, 0, 0.0),
            Err(DspError::ChannelOutOfRange(MAX_CHANNELS))
        );
        assert!(matrix.set_gain_db(0, 0, f32::NAN).is_err());
        assert!(matrix.set_gain(0, 0, f32::INFINITY).is_err());
        assert!(matrix.is_identity());
    }

    #[test]
    fn test_outputs_read_inputs_before_writing() {
        let mut matrix = RoutingMatrix::from_preset(RoutingPreset::Identity);
        matrix.set_gain(1, 0, 1.0).unwrap();
        let mut ch = channels([0.25, 0.5, 0.0, 0.0]);
        matrix.apply(&mut ch, 2);
        assert_eq!(ch[0][0], 0.25);
        assert_eq!(ch[1][0], 0.75);
    }
}

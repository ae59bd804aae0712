//! Error types for pipeline configuration
//!
//! Every fallible control-plane operation returns [`DspError`]. The audio
//! path never fails: malformed input degrades to a no-op instead.

use crate::domain::pool::PoolKind;
use thiserror::Error;

/// Errors raised by stage CRUD, crossover insertion and config swaps
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DspError {
    /// A value outside its accepted domain (frequency, order, permutation...)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Channel {0} out of range")]
    ChannelOutOfRange(usize),

    #[error("Stage index {index} out of range on channel {channel}")]
    StageOutOfRange { channel: usize, index: usize },

    #[error("Channel {channel} has no room for {requested} more stage(s)")]
    ChainFull { channel: usize, requested: usize },

    #[error("No free {0} pool slot")]
    PoolExhausted(PoolKind),

    /// Another control caller holds the swap lock
    #[error("Configuration swap busy")]
    SwapBusy,

    /// The audio context stayed busy past the bounded wait
    #[error("Timed out waiting for the audio context")]
    SwapTimeout,
}

/// Coarse classification of [`DspError`] used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    ResourceExhausted,
    Contention,
}

impl DspError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DspError::InvalidParameter(_)
            | DspError::ChannelOutOfRange(_)
            | DspError::StageOutOfRange { .. } => ErrorKind::InvalidParameter,
            DspError::ChainFull { .. } | DspError::PoolExhausted(_) => {
                ErrorKind::ResourceExhausted
            }
            DspError::SwapBusy | DspError::SwapTimeout => ErrorKind::Contention,
        }
    }

    /// Contention errors clear up on their own; everything else needs a different request
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

pub type Result<T> = std::result::Result<T, DspError>;

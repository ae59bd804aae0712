//! Real-time DSP pipeline core of a multi-channel amplifier controller
//!
//! Everything lives under [`domain`]; the most used types are re-exported there.

pub mod domain;

//! Engine metrics
//!
//! Written by the audio context after every buffer and read by the control
//! context at any time. Every field is an independent relaxed atomic, so a
//! snapshot may mix values of neighbouring buffers but never blocks either
//! side.

use crate::domain::stage::limits::MAX_CHANNELS;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// `f32` stored as its bit pattern
#[derive(Debug, Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    process_time_us: AtomicU32,
    max_process_time_us: AtomicU32,
    cpu_load_percent: AtomicF32,
    gain_reduction_db: [AtomicF32; MAX_CHANNELS],
    emergency_gain_reduction_db: AtomicF32,
    emergency_active: AtomicBool,
    emergency_triggers: AtomicU32,
    buffers_processed: AtomicU64,
    contended_buffers: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub process_time_us: u32,
    pub max_process_time_us: u32,
    pub cpu_load_percent: f32,
    pub gain_reduction_db: [f32; MAX_CHANNELS],
    pub emergency_gain_reduction_db: f32,
    pub emergency_active: bool,
    pub emergency_triggers: u32,
    pub buffers_processed: u64,
    pub contended_buffers: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing of one processed buffer
    pub fn record_timing(&self, elapsed_us: u32, frames: usize, sample_rate: u32) {
        self.process_time_us.store(elapsed_us, Ordering::Relaxed);
        self.max_process_time_us.fetch_max(elapsed_us, Ordering::Relaxed);
        if sample_rate > 0 && frames > 0 {
            let budget_us = frames as f32 / sample_rate as f32 * 1_000_000.0;
            self.cpu_load_percent.store(elapsed_us as f32 / budget_us * 100.0);
        }
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gain_reduction(&self, channel: usize, gain_reduction_db: f32) {
        if let Some(slot) = self.gain_reduction_db.get(channel) {
            slot.store(gain_reduction_db);
        }
    }

    pub fn record_emergency(&self, gain_reduction_db: f32, active: bool, triggers: u32) {
        self.emergency_gain_reduction_db.store(gain_reduction_db);
        self.emergency_active.store(active, Ordering::Relaxed);
        self.emergency_triggers.store(triggers, Ordering::Relaxed);
    }

    /// Global bypass: nothing was processed
    pub fn record_bypass(&self) {
        self.process_time_us.store(0, Ordering::Relaxed);
        self.cpu_load_percent.store(0.0);
    }

    /// A buffer passed through because the active state was being swapped
    pub fn record_contended(&self) {
        self.contended_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_max(&self) {
        self.max_process_time_us.store(0, Ordering::Relaxed);
    }

    pub fn clear_cpu_load(&self) {
        self.process_time_us.store(0, Ordering::Relaxed);
        self.cpu_load_percent.store(0.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            process_time_us: self.process_time_us.load(Ordering::Relaxed),
            max_process_time_us: self.max_process_time_us.load(Ordering::Relaxed),
            cpu_load_percent: self.cpu_load_percent.load(),
            gain_reduction_db: std::array::from_fn(|ch| self.gain_reduction_db[ch].load()),
            emergency_gain_reduction_db: self.emergency_gain_reduction_db.load(),
            emergency_active: self.emergency_active.load(Ordering::Relaxed),
            emergency_triggers: self.emergency_triggers.load(Ordering::Relaxed),
            buffers_processed: self.buffers_processed.load(Ordering::Relaxed),
            contended_buffers: self.contended_buffers.load(Ordering::Relaxed),
        }
    }
}

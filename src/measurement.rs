//! Aggregate cost of a method or call-tree edge
//!
//! Values are raw measurer samples (nanoseconds, allocation counts or bytes
//! depending on the measure mode). Conversion to reported units happens once,
//! at read time, through [`Measurement::scaled`].

use serde::{Deserialize, Serialize};

/// Self, wait and total cost plus invocation count
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Cost spent in the method body itself, excluding children and waits
    pub self_time: f64,
    /// Cost spent while another thread or fiber was running
    pub wait_time: f64,
    /// Inclusive cost, counted once per outermost invocation
    pub total_time: f64,
    /// Number of invocations, including recursive ones
    pub called: u64,
}

impl Measurement {
    /// Create an empty measurement
    pub fn new() -> Self {
        Self::default()
    }

    /// Time spent in children (total minus self and wait)
    pub fn children_time(&self) -> f64 {
        self.total_time - self.self_time - self.wait_time
    }

    /// Add another measurement's values into this one
    pub fn merge(&mut self, other: &Measurement) {
        self.self_time += other.self_time;
        self.wait_time += other.wait_time;
        self.total_time += other.total_time;
        self.called += other.called;
    }

    /// Convert raw values into reported units
    pub fn scaled(&self, multiplier: f64) -> Measurement {
        Measurement {
            self_time: self.self_time * multiplier,
            wait_time: self.wait_time * multiplier,
            total_time: self.total_time * multiplier,
            called: self.called,
        }
    }
}

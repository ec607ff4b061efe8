//! Measurement clock facade
//!
//! The measure mode is a closed enum matched on every sample; there are no
//! function pointers on the per-event path. Samples are raw values in the
//! mode's native unit and are only scaled when reported.

use crate::alloc_counter;
use crate::error::{ProfileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// What the profiler counts as "cost"
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    /// Elapsed real time
    #[default]
    WallTime,
    /// CPU time consumed by the whole process
    ProcessTime,
    /// Number of heap allocations
    Allocations,
    /// Heap bytes allocated
    Memory,
}

impl MeasureMode {
    /// Factor converting a raw sample delta into the reported unit
    pub fn multiplier(self) -> f64 {
        match self {
            MeasureMode::WallTime | MeasureMode::ProcessTime => 1e-9,
            MeasureMode::Allocations | MeasureMode::Memory => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeasureMode::WallTime => "wall_time",
            MeasureMode::ProcessTime => "process_time",
            MeasureMode::Allocations => "allocations",
            MeasureMode::Memory => "memory",
        }
    }
}

impl fmt::Display for MeasureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasureMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wall_time" | "wall" => Ok(MeasureMode::WallTime),
            "process_time" | "process" | "cpu" => Ok(MeasureMode::ProcessTime),
            "allocations" => Ok(MeasureMode::Allocations),
            "memory" => Ok(MeasureMode::Memory),
            other => Err(ProfileError::InvalidConfig(format!(
                "unknown measure mode: {}",
                other
            ))),
        }
    }
}

/// Supplies monotonic samples for one measure mode
#[derive(Debug, Clone)]
pub struct Measurer {
    mode: MeasureMode,
    epoch: Instant,
}

impl Measurer {
    pub fn new(mode: MeasureMode) -> Self {
        Self {
            mode,
            epoch: Instant::now(),
        }
    }

    pub fn mode(&self) -> MeasureMode {
        self.mode
    }

    /// Take a raw sample in the mode's native unit
    pub fn sample(&self) -> f64 {
        match self.mode {
            MeasureMode::WallTime => self.epoch.elapsed().as_nanos() as f64,
            MeasureMode::ProcessTime => process_cpu_nanos(),
            MeasureMode::Allocations => alloc_counter::allocation_count() as f64,
            MeasureMode::Memory => alloc_counter::allocated_bytes() as f64,
        }
    }

    /// Scale multiplier for reported values
    pub fn multiplier(&self) -> f64 {
        self.mode.multiplier()
    }
}

/// CPU time of the whole process in nanoseconds
fn process_cpu_nanos() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 * 1_000_000_000.0 + ts.tv_nsec as f64
}

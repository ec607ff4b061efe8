//! Session configuration
//!
//! Read once at session construction. A configuration file is TOML:
//!
//! ```toml
//! measure_mode = "process_time"
//! exclude_threads = [3, 4]
//! allow_exceptions = true
//! track_allocations = true
//! merge_fibers = false
//! initial_stack_capacity = 8
//! ```

use crate::error::{ProfileError, Result};
use crate::filter::ThreadFilter;
use crate::measurer::MeasureMode;
use crate::stack::DEFAULT_STACK_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options consumed by [`crate::ProfileSession::new`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub measure_mode: MeasureMode,
    /// Only these threads are traced
    pub include_threads: Option<Vec<u64>>,
    /// These threads are never traced
    pub exclude_threads: Option<Vec<u64>>,
    /// Re-raise errors from a profiled block after stopping
    pub allow_exceptions: bool,
    /// Record allocation events per method
    pub track_allocations: bool,
    /// Fold fiber contexts into their thread on stop
    pub merge_fibers: bool,
    /// Frame slots reserved for each new stack
    pub initial_stack_capacity: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            measure_mode: MeasureMode::default(),
            include_threads: None,
            exclude_threads: None,
            allow_exceptions: false,
            track_allocations: false,
            merge_fibers: false,
            initial_stack_capacity: DEFAULT_STACK_CAPACITY,
        }
    }
}

impl ProfileConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ProfileConfig =
            toml::from_str(text).map_err(|e| ProfileError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_stack_capacity == 0 {
            return Err(ProfileError::InvalidConfig(
                "initial_stack_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn thread_filter(&self) -> ThreadFilter {
        ThreadFilter::new(self.include_threads.clone(), self.exclude_threads.clone())
    }
}

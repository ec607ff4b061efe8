//! Profile session: state machine and event dispatch
//!
//! ```text
//! Stopped --start--> Running <--pause/resume--> Paused
//!                       |                         |
//!                       +----------stop-----------+--> Stopped (final)
//! ```
//!
//! Every control operation has an `*_at` variant taking an explicit
//! measurement so recorded event streams can be replayed deterministically.

use crate::config::ProfileConfig;
use crate::entity::{Entity, MethodKey};
use crate::error::{ProfileError, Result};
use crate::event::{EventKind, ProfileEvent};
use crate::filter::{MethodExclusions, ThreadFilter};
use crate::measurer::{MeasureMode, Measurer};
use crate::thread::{ContextHandle, ContextKey, ThreadContext, ThreadTable};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    Running,
    Paused,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
        }
    }
}

/// One profiling run over an event stream
#[derive(Debug)]
pub struct ProfileSession {
    config: ProfileConfig,
    measurer: Measurer,
    filter: ThreadFilter,
    exclusions: MethodExclusions,
    threads: ThreadTable,
    state: SessionState,
    /// Set by the first `start`; a stopped session never restarts
    finished: bool,
}

impl ProfileSession {
    pub fn new(config: ProfileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            measurer: Measurer::new(config.measure_mode),
            filter: config.thread_filter(),
            exclusions: MethodExclusions::new(),
            threads: ThreadTable::new(),
            state: SessionState::Stopped,
            finished: false,
            config,
        })
    }

    /// Rebuild a stopped session around already-settled contexts
    pub(crate) fn from_contexts(config: ProfileConfig, contexts: Vec<ThreadContext>) -> Result<Self> {
        let mut session = Self::new(config)?;
        for context in contexts {
            session.threads.insert(context);
        }
        session.finished = true;
        Ok(session)
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != SessionState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.state == SessionState::Paused
    }

    fn state_name(&self) -> &'static str {
        if self.state == SessionState::Stopped && self.finished {
            "finished"
        } else {
            self.state.as_str()
        }
    }

    pub fn measure_mode(&self) -> MeasureMode {
        self.measurer.mode()
    }

    /// Swap the measurement mode; only accepted before the session starts
    pub fn set_measure_mode(&mut self, mode: MeasureMode) -> Result<()> {
        if self.state != SessionState::Stopped {
            return Err(ProfileError::illegal("change measurement mode", "profiling"));
        }
        if self.finished {
            return Err(ProfileError::illegal("change measurement mode", self.state_name()));
        }
        self.measurer = Measurer::new(mode);
        self.config.measure_mode = mode;
        Ok(())
    }

    /// Factor converting raw measurements to reported units
    pub fn multiplier(&self) -> f64 {
        self.measurer.multiplier()
    }

    /// Current raw sample from the session's measurer
    pub fn sample(&self) -> f64 {
        self.measurer.sample()
    }

    /// Register a method whose cost folds into its caller
    pub fn exclude_method(&mut self, entity: &Entity, member: &str) -> Result<MethodKey> {
        if self.state != SessionState::Stopped || self.finished {
            return Err(ProfileError::illegal("exclude methods", self.state_name()));
        }
        Ok(self.exclusions.insert(entity, member))
    }

    /// Replace the configured thread filter; only accepted before the session starts
    pub fn set_thread_filter(&mut self, filter: ThreadFilter) -> Result<()> {
        if self.state != SessionState::Stopped || self.finished {
            return Err(ProfileError::illegal("change thread filter", self.state_name()));
        }
        self.filter = filter;
        Ok(())
    }

    pub fn exclusions(&self) -> &MethodExclusions {
        &self.exclusions
    }

    pub fn start(&mut self) -> Result<()> {
        let now = self.sample();
        self.start_at(now)
    }

    pub fn start_at(&mut self, measurement: f64) -> Result<()> {
        if self.state != SessionState::Stopped || self.finished {
            return Err(ProfileError::illegal("start", self.state_name()));
        }
        debug!(mode = %self.measurer.mode(), measurement, "profiling started");
        self.state = SessionState::Running;
        self.finished = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let now = self.sample();
        self.pause_at(now)
    }

    /// Pause the active leaf of every context; pausing twice is a no-op
    pub fn pause_at(&mut self, measurement: f64) -> Result<()> {
        match self.state {
            SessionState::Stopped => Err(ProfileError::illegal("pause", self.state_name())),
            SessionState::Paused => Ok(()),
            SessionState::Running => {
                for handle in self.threads.handles() {
                    self.threads.get_mut(handle)?.pause(measurement);
                }
                self.state = SessionState::Paused;
                debug!(measurement, "profiling paused");
                Ok(())
            }
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        let now = self.sample();
        self.resume_at(now)
    }

    /// Resume every context; resuming a running session is a no-op
    pub fn resume_at(&mut self, measurement: f64) -> Result<()> {
        match self.state {
            SessionState::Stopped => Err(ProfileError::illegal("resume", self.state_name())),
            SessionState::Running => Ok(()),
            SessionState::Paused => {
                for handle in self.threads.handles() {
                    self.threads.get_mut(handle)?.resume(measurement);
                }
                self.state = SessionState::Running;
                debug!(measurement, "profiling resumed");
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        let now = self.sample();
        self.stop_at(now)
    }

    /// Settle every open frame of every context at `measurement`
    pub fn stop_at(&mut self, measurement: f64) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Err(ProfileError::illegal("stop", self.state_name()));
        }

        let capacity = self.config.initial_stack_capacity;
        let mut unwound = 0;
        for handle in self.threads.handles() {
            let key = self.threads.get(handle)?.key();
            self.threads
                .activate(key, measurement, &self.filter, capacity);
            unwound += self.threads.get_mut(handle)?.unwind(measurement);
        }
        self.threads.reset_last();
        self.state = SessionState::Stopped;
        debug!(measurement, unwound, "profiling stopped");

        if self.config.merge_fibers {
            self.merge_fibers()?;
        }
        Ok(())
    }

    /// Feed one event from the event source
    ///
    /// Events arriving while stopped are ignored.
    pub fn handle_event(&mut self, event: &ProfileEvent) -> Result<()> {
        if self.state == SessionState::Stopped {
            trace!(kind = ?event.kind, "event ignored while stopped");
            return Ok(());
        }
        let paused = self.state == SessionState::Paused;
        let key = ContextKey::new(event.thread_id, event.fiber_id);
        let handle = self.threads.activate(
            key,
            event.measurement,
            &self.filter,
            self.config.initial_stack_capacity,
        );

        let context = self.threads.get_mut(handle)?;
        if !context.is_traced() {
            return Ok(());
        }
        match event.kind {
            EventKind::Call | EventKind::NativeCall => {
                context.on_call(event, &self.exclusions, paused);
            }
            EventKind::Return | EventKind::NativeReturn => {
                context.on_return(event.measurement, paused);
            }
            EventKind::Line => context.on_line(event),
            EventKind::Allocation => {
                if self.config.track_allocations {
                    context.on_allocation(event);
                }
            }
        }
        Ok(())
    }

    /// Run `block` between `start` and `stop`
    ///
    /// The session is always stopped (and fully settled) before the block's
    /// outcome is reported. A failing block is re-raised as
    /// [`ProfileError::Profiled`] when `allow_exceptions` is set and logged
    /// and swallowed otherwise.
    pub fn profile<T, F>(&mut self, block: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Self) -> anyhow::Result<T>,
    {
        self.start()?;
        let outcome = block(self);
        if self.is_running() {
            self.stop()?;
        }
        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.config.allow_exceptions => Err(ProfileError::Profiled(err)),
            Err(err) => {
                warn!(error = %err, "profiled block failed; error swallowed");
                Ok(None)
            }
        }
    }

    /// Fold every fiber context into the lowest-numbered fiber of its thread
    ///
    /// Merged-away contexts are released.
    pub fn merge_fibers(&mut self) -> Result<()> {
        if self.state != SessionState::Stopped {
            return Err(ProfileError::illegal("merge fibers", self.state_name()));
        }

        let mut groups: BTreeMap<u64, Vec<(u64, ContextHandle)>> = BTreeMap::new();
        for (handle, context) in self.threads.iter_all() {
            groups
                .entry(context.thread_id())
                .or_default()
                .push((context.fiber_id(), handle));
        }

        for (thread_id, mut fibers) in groups {
            if fibers.len() < 2 {
                continue;
            }
            fibers.sort_unstable();
            let (_, dest) = fibers[0];
            let merged: Vec<ThreadContext> = fibers[1..]
                .iter()
                .filter_map(|&(_, handle)| self.threads.remove(handle))
                .collect();
            let target = self.threads.get_mut(dest)?;
            for other in &merged {
                target.merge(other);
            }
            debug!(thread = thread_id, merged = merged.len(), "merged fiber contexts");
        }
        Ok(())
    }

    /// Trace-enabled contexts
    pub fn threads(&self) -> impl Iterator<Item = (ContextHandle, &ThreadContext)> {
        self.threads.iter()
    }

    pub fn thread(&self, handle: ContextHandle) -> Result<&ThreadContext> {
        self.threads.get(handle)
    }

    pub fn find_thread(&self, thread_id: u64, fiber_id: u64) -> Option<ContextHandle> {
        self.threads.find(ContextKey::new(thread_id, fiber_id))
    }

    /// Release every context; outstanding handles report `AlreadyFreed`
    pub fn teardown(&mut self) {
        debug!(contexts = self.threads.len(), "session torn down");
        self.threads.clear();
        self.state = SessionState::Stopped;
        self.finished = true;
    }
}

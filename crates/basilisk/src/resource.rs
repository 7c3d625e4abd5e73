//! Resource accounting for sandboxed execution.
//!
//! The accountant is consulted at three kinds of points: before every heap
//! allocation (and container growth), at every instruction boundary (wall
//! clock), and before pushing a call frame (recursion depth). Operations
//! whose result size is analytically derivable from their inputs (integer
//! exponentiation, shifts, sequence repetition) additionally pre-check the
//! projected size so a breach fires before the work is done, not after.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::exc::{ExcKind, ExcPayload, RunError};

/// Threshold in bytes above which [`ResourceTracker::check_large_result`]
/// actually evaluates the projected size.
///
/// Results below 100KB are allowed through without a limit comparison to keep
/// the hot arithmetic path cheap; anything above it must fit the memory
/// ceiling before the producing operation runs.
pub const LARGE_RESULT_THRESHOLD: usize = 100_000;

/// Recursion ceiling applied when the host does not configure one.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// Allocations between opportunistic cycle-collection points.
pub(crate) const GC_ALLOCATION_INTERVAL: u32 = 10_000;

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ResourceError {
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum memory usage exceeded.
    Memory { limit: usize, used: usize },
    /// Maximum recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::Recursion { .. } => write!(f, "maximum recursion depth exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Maps this breach to the guest exception kind that surfaces it.
    #[must_use]
    pub(crate) fn exc_kind(&self) -> ExcKind {
        match self {
            Self::Time { .. } => ExcKind::TimeoutError,
            Self::Memory { .. } => ExcKind::MemoryError,
            Self::Recursion { .. } => ExcKind::RecursionError,
        }
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        let mut payload = ExcPayload::with_message(err.exc_kind(), err.to_string());
        // RecursionError stays catchable so `try: f() except RecursionError:`
        // behaves like the guest language. Memory and time breaches unwind
        // as uncatchable: no `except` handler matches them, while `finally`
        // handlers still run on the way out.
        if matches!(err, ResourceError::Recursion { .. }) {
            Self::Exc(Box::new(payload.into_raise()))
        } else {
            payload.uncatchable = true;
            Self::Uncatchable(Box::new(payload.into_raise()))
        }
    }
}

/// Host-configurable resource ceilings.
///
/// Every field is optional; `None` means unlimited (except recursion, which
/// falls back to [`DEFAULT_MAX_RECURSION_DEPTH`]). Unknown fields in a
/// deserialized options record are rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Maximum wall-clock run duration in (possibly fractional) seconds.
    #[serde(default)]
    pub max_duration_seconds: Option<f64>,
    /// Maximum live heap payload bytes.
    #[serde(default)]
    pub max_memory_bytes: Option<usize>,
    /// Maximum guest call-frame depth.
    #[serde(default)]
    pub max_recursion_depth: Option<usize>,
}

impl ResourceLimits {
    /// Returns the configured duration as a [`Duration`], if set.
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_seconds.map(Duration::from_secs_f64)
    }
}

/// Trait consulted by the heap and dispatcher for every accountable event.
///
/// Implementations enforce (or ignore) limits on memory, wall-clock time, and
/// recursion. The unlimited implementation compiles down to no-ops through
/// monomorphization, so limit checks cost nothing when disabled.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation with a lazily computed size.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called before inserting into an existing container.
    ///
    /// Container growth is not a fresh heap object but still counts toward
    /// the memory budget so in-place growth cannot dodge the ceiling.
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.on_allocate(|| 0)
    }

    /// Called when heap payload bytes are released.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Called at every instruction boundary to check the wall clock.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a call frame; `current_depth` excludes the new frame.
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Called before operations with an analytically derivable result size.
    ///
    /// Sizes at or below [`LARGE_RESULT_THRESHOLD`] always pass.
    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError>;

    /// Current approximate live memory in bytes, if this tracker records it.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }

    /// Called when execution suspends for a host exchange; stops the wall
    /// clock for trackers that keep one.
    fn on_suspend(&mut self) {}

    /// Called when execution resumes after a host exchange.
    fn on_resume(&mut self) {}
}

/// Tracker with no memory or time ceilings and the default recursion ceiling.
///
/// The recursion ceiling is kept even in unlimited mode: guest frames are
/// heap structures, but an unbounded frame stack is never useful and a
/// default ceiling keeps runaway recursion diagnosable.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            return Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth: current_depth,
            });
        }
        Ok(())
    }

    #[inline]
    fn check_large_result(&self, _estimated_bytes: usize) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Tracker enforcing the limits in a [`ResourceLimits`] record.
///
/// Time starts counting from [`LimitedTracker::new`], i.e. when the run
/// begins, not when the tracker was configured. Serialized trackers resume
/// with the elapsed time they had already consumed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    /// Live heap payload bytes.
    current_memory: usize,
    /// Peak observed memory, reported in stats and error messages.
    peak_memory: usize,
    /// Wall-clock time consumed before the current segment started.
    ///
    /// Suspension for an external call stops the clock; this field carries
    /// the consumed budget across the snapshot boundary.
    consumed: Duration,
    /// Start of the current execution segment. `None` while suspended.
    #[serde(skip)]
    segment_start: Option<Instant>,
    /// A wall-clock breach reports once; further checks stay quiet so the
    /// uncatchable error can unwind through `finally` bodies.
    #[serde(default)]
    timed_out: bool,
}

impl LimitedTracker {
    /// Creates a tracker and starts its wall clock.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            current_memory: 0,
            peak_memory: 0,
            consumed: Duration::ZERO,
            segment_start: Some(Instant::now()),
            timed_out: false,
        }
    }

    /// Restarts the wall clock after a suspension.
    pub(crate) fn resume_clock(&mut self) {
        if self.segment_start.is_none() {
            self.segment_start = Some(Instant::now());
        }
    }

    /// Stops the wall clock, banking elapsed time, for a suspension.
    pub(crate) fn suspend_clock(&mut self) {
        if let Some(start) = self.segment_start.take() {
            self.consumed += start.elapsed();
        }
    }

    /// Total wall-clock time consumed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let running = self.segment_start.map(|s| s.elapsed()).unwrap_or_default();
        self.consumed + running
    }

    /// Peak live memory observed, in bytes.
    #[must_use]
    pub fn peak_memory_bytes(&self) -> usize {
        self.peak_memory
    }

    fn check_memory(&self, additional: usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_memory_bytes {
            let projected = self.current_memory.saturating_add(additional);
            if projected > limit {
                return Err(ResourceError::Memory {
                    limit,
                    used: projected,
                });
            }
        }
        Ok(())
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        let size = get_size();
        self.check_memory(size)?;
        self.current_memory += size;
        self.peak_memory = self.peak_memory.max(self.current_memory);
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.current_memory = self.current_memory.saturating_sub(get_size());
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_duration() {
            if self.timed_out {
                return Ok(());
            }
            let elapsed = self.elapsed();
            if elapsed > limit {
                self.timed_out = true;
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        let limit = self
            .limits
            .max_recursion_depth
            .unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
        if current_depth >= limit {
            return Err(ResourceError::Recursion {
                limit,
                depth: current_depth,
            });
        }
        Ok(())
    }

    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError> {
        if estimated_bytes <= LARGE_RESULT_THRESHOLD {
            return Ok(());
        }
        self.check_memory(estimated_bytes)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }

    fn on_suspend(&mut self) {
        self.suspend_clock();
    }

    fn on_resume(&mut self) {
        self.resume_clock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_limit_fields_are_rejected() {
        let err = serde_json::from_str::<ResourceLimits>(r#"{"max_cpu_cores": 4}"#);
        assert!(err.is_err());
    }

    #[test]
    fn memory_limit_rejects_projected_overflow() {
        let mut tracker = LimitedTracker::new(ResourceLimits {
            max_memory_bytes: Some(1000),
            ..ResourceLimits::default()
        });
        assert!(tracker.on_allocate(|| 600).is_ok());
        assert!(tracker.on_allocate(|| 600).is_err());
        tracker.on_free(|| 600);
        assert!(tracker.on_allocate(|| 600).is_ok());
        // The failed allocation never landed, so peak reflects only live bytes.
        assert_eq!(tracker.peak_memory_bytes(), 600);
        assert_eq!(tracker.current_memory_bytes(), Some(600));
    }

    #[test]
    fn large_result_precheck_uses_threshold() {
        let tracker = LimitedTracker::new(ResourceLimits {
            max_memory_bytes: Some(10),
            ..ResourceLimits::default()
        });
        // Below the threshold nothing is compared.
        assert!(tracker.check_large_result(LARGE_RESULT_THRESHOLD).is_ok());
        // Above it, the projected size must fit the ceiling.
        assert!(tracker.check_large_result(LARGE_RESULT_THRESHOLD + 1).is_err());
    }

    #[test]
    fn recursion_ceiling_applies_by_default() {
        let tracker = NoLimitTracker;
        assert!(tracker.check_recursion_depth(10).is_ok());
        assert!(
            tracker
                .check_recursion_depth(DEFAULT_MAX_RECURSION_DEPTH)
                .is_err()
        );
    }
}

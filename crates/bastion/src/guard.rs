//! Per-program resource guard: the state behind every injected check.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Something a guard disposes when its scope closes.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

/// Budgets enforced while a scope is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_stack_bytes")]
    pub stack_bytes: u64,
    #[serde(default = "default_time", with = "duration_ms")]
    pub time: Duration,
    #[serde(default = "default_allocations")]
    pub allocations: u64,
}

fn default_stack_bytes() -> u64 {
    512 * 1024
}

fn default_time() -> Duration {
    Duration::from_millis(500)
}

fn default_allocations() -> u64 {
    1_000_000
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            stack_bytes: default_stack_bytes(),
            time: default_time(),
            allocations: default_allocations(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// A guard entry point ran while no scope was open for the program.
    NoActiveScope,
    StackLimit { used: u64, limit: u64 },
    TimeLimit { elapsed: Duration, limit: Duration },
    MemoryLimit { total: u64, limit: u64 },
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::NoActiveScope => f.write_str("guard used outside of an open scope"),
            GuardError::StackLimit { used, limit } => write!(
                f,
                "operation aborted: stack limit of {limit} bytes exceeded ({used} bytes used)"
            ),
            GuardError::TimeLimit { elapsed, limit } => write!(
                f,
                "operation aborted: time limit of {}ms exceeded ({}ms elapsed)",
                limit.as_millis(),
                elapsed.as_millis()
            ),
            GuardError::MemoryLimit { total, limit } => write!(
                f,
                "operation aborted: allocation limit of {limit} exceeded ({total} requested)"
            ),
        }
    }
}

impl std::error::Error for GuardError {}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_nanos() -> u64 {
    u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Address of a fresh local in the caller's frame; differences between two calls
/// approximate native stack growth.
#[inline(never)]
fn stack_marker() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Runtime guard for one program. Usable from any thread; all state is atomic except the
/// disposable list.
pub struct ResourceGuard {
    active: AtomicBool,
    stack_baseline: AtomicUsize,
    started_nanos: AtomicU64,
    stack_limit: AtomicU64,
    time_limit_nanos: AtomicU64,
    allocation_limit: AtomicU64,
    allocated: AtomicU64,
    disposables: Mutex<Vec<Arc<dyn Disposable>>>,
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("active", &self.is_active())
            .field("allocated", &self.allocated())
            .finish_non_exhaustive()
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            stack_baseline: AtomicUsize::new(0),
            started_nanos: AtomicU64::new(0),
            stack_limit: AtomicU64::new(0),
            time_limit_nanos: AtomicU64::new(0),
            allocation_limit: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            disposables: Mutex::new(Vec::new()),
        }
    }

    /// Resets all counters and starts the clock. The stack baseline is captured lazily by
    /// the first `on_entry`, on whatever thread runs the program.
    pub(crate) fn activate(&self, limits: ResourceLimits) {
        self.stack_limit.store(limits.stack_bytes, Ordering::Relaxed);
        self.time_limit_nanos.store(
            u64::try_from(limits.time.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.allocation_limit
            .store(limits.allocations, Ordering::Relaxed);
        self.allocated.store(0, Ordering::Relaxed);
        self.stack_baseline.store(0, Ordering::Relaxed);
        self.started_nanos.store(now_nanos(), Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
        tracing::trace!(
            stack_bytes = limits.stack_bytes,
            time_ms = limits.time.as_millis() as u64,
            allocations = limits.allocations,
            "guard activated"
        );
    }

    /// Deactivates and disposes everything still tracked.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let drained: Vec<Arc<dyn Disposable>> = match self.disposables.lock() {
            Ok(mut list) => list.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for item in drained {
            item.dispose();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    fn ensure_active(&self) -> Result<(), GuardError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(GuardError::NoActiveScope)
        }
    }

    /// Routine entry: records the stack baseline the first time, then checks stack and time.
    pub fn on_entry(&self) -> Result<(), GuardError> {
        self.ensure_active()?;
        let here = stack_marker();
        let _ = self.stack_baseline.compare_exchange(
            0,
            here,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.check_stack(here)?;
        self.check_time()
    }

    /// Backward control transfer: time only.
    pub fn on_backward_jump(&self) -> Result<(), GuardError> {
        self.ensure_active()?;
        self.check_time()
    }

    /// Charges `count` allocation units. Negative counts are rejected.
    pub fn charge(&self, count: i64) -> Result<(), GuardError> {
        self.ensure_active()?;
        let limit = self.allocation_limit.load(Ordering::Relaxed);
        let Ok(count) = u64::try_from(count) else {
            tracing::warn!(count, "negative allocation count");
            return Err(GuardError::MemoryLimit { total: 0, limit });
        };
        let previous = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(count))
            })
            .unwrap_or_else(|current| current);
        let total = previous.saturating_add(count);
        if total > limit {
            tracing::warn!(total, limit, "allocation limit exceeded");
            return Err(GuardError::MemoryLimit { total, limit });
        }
        Ok(())
    }

    /// Registers a disposable to be disposed when the scope closes.
    pub fn track(&self, item: Arc<dyn Disposable>) -> Result<(), GuardError> {
        self.ensure_active()?;
        match self.disposables.lock() {
            Ok(mut list) => list.push(item),
            Err(poisoned) => poisoned.into_inner().push(item),
        }
        Ok(())
    }

    /// Remaining time budget; zero once exceeded.
    pub fn time_until_limit(&self) -> Result<Duration, GuardError> {
        self.ensure_active()?;
        let limit = self.time_limit_nanos.load(Ordering::Relaxed);
        Ok(Duration::from_nanos(limit.saturating_sub(self.elapsed_nanos())))
    }

    fn elapsed_nanos(&self) -> u64 {
        now_nanos().saturating_sub(self.started_nanos.load(Ordering::Relaxed))
    }

    fn check_stack(&self, here: usize) -> Result<(), GuardError> {
        let baseline = self.stack_baseline.load(Ordering::Acquire);
        let used = baseline.abs_diff(here) as u64;
        let limit = self.stack_limit.load(Ordering::Relaxed);
        if used > limit {
            tracing::warn!(used, limit, "stack limit exceeded");
            return Err(GuardError::StackLimit { used, limit });
        }
        Ok(())
    }

    fn check_time(&self) -> Result<(), GuardError> {
        let elapsed = self.elapsed_nanos();
        let limit = self.time_limit_nanos.load(Ordering::Relaxed);
        if elapsed > limit {
            let elapsed = Duration::from_nanos(elapsed);
            let limit = Duration::from_nanos(limit);
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "time limit exceeded"
            );
            return Err(GuardError::TimeLimit { elapsed, limit });
        }
        Ok(())
    }

    /// Wraps a sequence so that every item is charged one unit before it is handed out.
    pub fn charged<I: Iterator>(self: &Arc<Self>, inner: I) -> Charged<I> {
        Charged {
            inner,
            guard: Arc::clone(self),
            yielded: 0,
        }
    }
}

/// Iterator adapter returned by [`ResourceGuard::charged`].
pub struct Charged<I> {
    inner: I,
    guard: Arc<ResourceGuard>,
    yielded: u64,
}

impl<I: Iterator> Iterator for Charged<I> {
    type Item = Result<I::Item, GuardError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Err(err) = self.guard.charge(1) {
            return Some(Err(err));
        }
        // The scope's running total must already cover every item handed out so far,
        // this one included.
        debug_assert!(
            self.guard.allocated() > self.yielded,
            "item read before it was charged"
        );
        self.yielded += 1;
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn limits(allocations: u64) -> ResourceLimits {
        ResourceLimits {
            allocations,
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn inactive_guard_rejects_every_check() {
        let guard = ResourceGuard::new();
        assert_eq!(guard.on_entry(), Err(GuardError::NoActiveScope));
        assert_eq!(guard.on_backward_jump(), Err(GuardError::NoActiveScope));
        assert_eq!(guard.charge(1), Err(GuardError::NoActiveScope));
        assert_eq!(guard.time_until_limit(), Err(GuardError::NoActiveScope));
    }

    #[test]
    fn allocation_budget_is_cumulative() {
        let guard = ResourceGuard::new();
        guard.activate(limits(50));
        guard.charge(10).expect("within budget");
        let err = guard.charge(50).unwrap_err();
        assert_eq!(err, GuardError::MemoryLimit { total: 60, limit: 50 });
        assert!(matches!(guard.charge(-1), Err(GuardError::MemoryLimit { .. })));
    }

    #[test]
    fn counter_saturates() {
        let guard = ResourceGuard::new();
        guard.activate(limits(u64::MAX));
        guard.charge(i64::MAX).expect("first");
        guard.charge(i64::MAX).expect("second");
        guard.charge(i64::MAX).expect("saturated");
        assert_eq!(guard.allocated(), u64::MAX);
    }

    #[test]
    fn time_limit_trips_after_deadline() {
        let guard = ResourceGuard::new();
        guard.activate(ResourceLimits {
            time: Duration::from_millis(5),
            ..ResourceLimits::default()
        });
        guard.on_backward_jump().expect("fresh clock");
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            guard.on_backward_jump(),
            Err(GuardError::TimeLimit { .. })
        ));
        assert_eq!(guard.time_until_limit(), Ok(Duration::ZERO));
    }

    #[inline(never)]
    fn recurse(guard: &ResourceGuard, depth: u32) -> Result<u32, GuardError> {
        let pad = std::hint::black_box([0u8; 256]);
        guard.on_entry()?;
        if depth == 0 {
            return Ok(u32::from(pad[0]));
        }
        recurse(guard, depth - 1).map(|d| d + 1)
    }

    #[test]
    fn stack_limit_trips_on_deep_recursion() {
        let guard = ResourceGuard::new();
        guard.activate(ResourceLimits {
            stack_bytes: 16 * 1024,
            ..ResourceLimits::default()
        });
        assert!(recurse(&guard, 4).is_ok());
        assert!(matches!(
            recurse(&guard, 10_000),
            Err(GuardError::StackLimit { .. })
        ));
    }

    struct Counter(Arc<AtomicUsize>);

    impl Disposable for Counter {
        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn deactivation_disposes_tracked_items() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let guard = ResourceGuard::new();
        guard.activate(limits(10));
        guard
            .track(Arc::new(Counter(Arc::clone(&disposed))))
            .expect("track");
        guard
            .track(Arc::new(Counter(Arc::clone(&disposed))))
            .expect("track");
        guard.deactivate();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(!guard.is_active());
    }

    #[test]
    fn charged_iterator_stops_at_budget() {
        let guard = Arc::new(ResourceGuard::new());
        guard.activate(limits(3));
        let results: Vec<_> = guard.charged(0..10).take(4).collect();
        assert_eq!(results[..3], [Ok(0), Ok(1), Ok(2)]);
        assert!(matches!(results[3], Err(GuardError::MemoryLimit { .. })));
    }

    #[test]
    fn charged_iterator_charges_each_item_as_it_is_pulled() {
        let guard = Arc::new(ResourceGuard::new());
        guard.activate(limits(100));
        let mut items = guard.charged(0..10);
        assert_eq!(guard.allocated(), 0);
        assert_eq!(items.next(), Some(Ok(0)));
        assert_eq!(guard.allocated(), 1);
        assert_eq!(items.by_ref().count(), 9);
        assert_eq!(guard.allocated(), 10);
    }
}

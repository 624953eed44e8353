//! Timer wheel.
//!
//! Grounded on `original_source/code/fiber/timer.cpp`/`timer.h` for the
//! ordered-set shape (`add_timer`/`add_condition_timer`/`next_timeout_ms`/
//! `drain_expired`) and the cancel/reset/refresh handle operations, with the
//! ordering comparator corrected per SPEC_FULL.md §4.3: the original's
//! `Timer::Compare::operator()` returns `true` unconditionally once `lhs` is
//! non-null, before ever comparing deadlines, which breaks the strict-weak-
//! ordering `BTreeSet` requires. This implementation orders by (deadline
//! ascending, then a monotonic identity counter) and never touches pointer
//! identity.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

fn next_timer_id() -> u64 {
    NEXT_TIMER_ID.fetch_add(1, Ordering::SeqCst)
}

struct TimerEntry {
    id: u64,
    deadline_ms: u64,
    period_ms: u64,
    cyclic: bool,
    callback: Mutex<Option<Callback>>,
    condition: Option<Weak<()>>,
    cancelled: AtomicBool,
}

impl TimerEntry {
    fn fresh(id: u64, deadline_ms: u64, period_ms: u64, cyclic: bool, callback: Option<Callback>, condition: Option<Weak<()>>) -> TimerEntry {
        TimerEntry {
            id,
            deadline_ms,
            period_ms,
            cyclic,
            callback: Mutex::new(callback),
            condition,
            cancelled: AtomicBool::new(false),
        }
    }
}

/// `BTreeSet` needs `Ord`; wrapping the `Arc` lets the set and any
/// outstanding `TimerHandle` share one entry instead of duplicating state.
struct TimerWrapper(Arc<TimerEntry>);

impl PartialEq for TimerWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline_ms == other.0.deadline_ms && self.0.id == other.0.id
    }
}
impl Eq for TimerWrapper {}
impl PartialOrd for TimerWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerWrapper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.deadline_ms.cmp(&other.0.deadline_ms).then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// A handle to a live timer. `cancel`/`reset`/`refresh` operate through the
/// owning manager, never by reaching into the set directly.
pub struct TimerHandle {
    id: u64,
    manager: Weak<TimerManagerInner>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.cancel(self.id);
        }
    }

    /// Updates the period and reinserts. `from_now` measures the new
    /// deadline from the current time; otherwise from the timer's original
    /// base (its last deadline minus its old period).
    pub fn reset(&self, period_ms: u64, from_now: bool) {
        if let Some(inner) = self.manager.upgrade() {
            inner.reset(self.id, period_ms, from_now);
        }
    }

    /// Bumps the deadline to now + period and reinserts.
    pub fn refresh(&self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.refresh(self.id);
        }
    }
}

struct TimerManagerInner {
    origin: Instant,
    timers: RwLock<BTreeSet<TimerWrapper>>,
    last_check_ms: Mutex<u64>,
}

impl TimerManagerInner {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn insert(&self, entry: Arc<TimerEntry>) {
        let mut timers = self.timers.write().unwrap();
        let was_head = timers.iter().next().map(|head| entry.deadline_ms < head.0.deadline_ms).unwrap_or(true);
        timers.insert(TimerWrapper(entry));
        drop(timers);
        if was_head {
            self.on_first_inserted();
        }
    }

    /// Overridden conceptually by the I/O manager (it wraps a
    /// `TimerManager` and tickles its epoll wait from here); the bare timer
    /// manager has nothing listening, so this just traces.
    fn on_first_inserted(&self) {
        log::trace!("timer became new head of the set");
    }

    fn find(&self, id: u64) -> Option<Arc<TimerEntry>> {
        self.timers.read().unwrap().iter().find(|w| w.0.id == id).map(|w| w.0.clone())
    }

    fn remove_by_id(&self, id: u64) -> Option<Arc<TimerEntry>> {
        let mut timers = self.timers.write().unwrap();
        let target = timers.iter().find(|w| w.0.id == id).map(|w| w.0.clone());
        if let Some(entry) = &target {
            timers.remove(&TimerWrapper(entry.clone()));
        }
        target
    }

    fn cancel(&self, id: u64) {
        if let Some(entry) = self.find(id) {
            entry.cancelled.store(true, Ordering::SeqCst);
            *entry.callback.lock().unwrap() = None;
        }
        self.remove_by_id(id);
    }

    fn reset(&self, id: u64, period_ms: u64, from_now: bool) {
        if let Some(old) = self.remove_by_id(id) {
            let base = if from_now {
                self.now_ms()
            } else {
                old.deadline_ms.saturating_sub(old.period_ms)
            };
            let new_entry = Arc::new(TimerEntry::fresh(
                old.id,
                base + period_ms,
                period_ms,
                old.cyclic,
                old.callback.lock().unwrap().take(),
                old.condition.clone(),
            ));
            self.insert(new_entry);
        }
    }

    fn refresh(&self, id: u64) {
        if let Some(old) = self.remove_by_id(id) {
            let new_entry = Arc::new(TimerEntry::fresh(
                old.id,
                self.now_ms() + old.period_ms,
                old.period_ms,
                old.cyclic,
                old.callback.lock().unwrap().take(),
                old.condition.clone(),
            ));
            self.insert(new_entry);
        }
    }
}

/// Ordered set of absolute-deadline timers.
pub struct TimerManager {
    inner: Arc<TimerManagerInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Arc::new(TimerManagerInner {
                origin: Instant::now(),
                timers: RwLock::new(BTreeSet::new()),
                last_check_ms: Mutex::new(0),
            }),
        }
    }

    fn insert_timer(&self, period_ms: u64, callback: Callback, condition: Option<Weak<()>>, cyclic: bool) -> TimerHandle {
        let id = next_timer_id();
        let entry = Arc::new(TimerEntry::fresh(id, self.inner.now_ms() + period_ms, period_ms, cyclic, Some(callback), condition));
        self.inner.insert(entry);
        TimerHandle {
            id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_timer<F>(&self, period_ms: u64, callback: F, cyclic: bool) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert_timer(period_ms, Box::new(callback), None, cyclic)
    }

    /// Like `add_timer`, but the callback only runs if `condition` is still
    /// alive at fire time. Per SPEC_FULL.md §9: if the condition has expired
    /// between lookup and fire, the resolution is "do not fire".
    pub fn add_condition_timer<F>(&self, period_ms: u64, callback: F, condition: Weak<()>, cyclic: bool) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert_timer(period_ms, Box::new(callback), Some(condition), cyclic)
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.timers.read().unwrap().is_empty()
    }

    /// `None` if there are no timers; `Some(0)` if the earliest is already
    /// due; otherwise the remaining milliseconds.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let timers = self.inner.timers.read().unwrap();
        let head = timers.iter().next()?;
        let now = self.inner.now_ms();
        Some(head.0.deadline_ms.saturating_sub(now))
    }

    /// Moves the callbacks of all timers with `deadline_ms <= now` into
    /// `out`, reinserting cyclic timers with a fresh deadline. A timer
    /// cancelled concurrently (`cancelled` set, callback already cleared) is
    /// dropped silently rather than reinserted or fired.
    ///
    /// Detects backward clock jumps of more than an hour and, if seen,
    /// treats every existing timer as expired (defensive against a
    /// misbehaving monotonic clock source; this implementation's own clock
    /// cannot go backward, but the check mirrors the original's guard).
    pub fn drain_expired(&self, out: &mut Vec<Callback>) {
        let now = self.inner.now_ms();
        let mut last_check = self.inner.last_check_ms.lock().unwrap();
        let rolled_back = now + Duration::from_secs(3600).as_millis() as u64 < *last_check;
        *last_check = now;
        drop(last_check);

        let mut expired = Vec::new();
        {
            let mut timers = self.inner.timers.write().unwrap();
            loop {
                let due = match timers.iter().next() {
                    Some(head) => rolled_back || head.0.deadline_ms <= now,
                    None => false,
                };
                if !due {
                    break;
                }
                let entry = timers.iter().next().unwrap().0.clone();
                timers.remove(&TimerWrapper(entry.clone()));
                expired.push(entry);
            }
        }

        for entry in expired {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let alive = match &entry.condition {
                Some(weak) => weak.upgrade().is_some(),
                None => true,
            };
            let callback = entry.callback.lock().unwrap().take();
            if alive {
                if let Some(cb) = callback {
                    out.push(cb);
                }
            }
            if entry.cyclic {
                let refreshed = Arc::new(TimerEntry::fresh(
                    entry.id,
                    now + entry.period_ms,
                    entry.period_ms,
                    true,
                    None,
                    entry.condition.clone(),
                ));
                self.inner.insert(refreshed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_timer_fires_once_when_due() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.add_timer(0, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, false);
        std::thread::sleep(Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 1);
        for cb in out {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = mgr.add_timer(0, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, false);
        handle.cancel();
        std::thread::sleep(Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn condition_timer_does_not_fire_once_condition_is_gone() {
        let mgr = TimerManager::new();
        let condition = Arc::new(());
        let weak = Arc::downgrade(&condition);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.add_condition_timer(0, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, weak, false);
        drop(condition);
        std::thread::sleep(Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn cyclic_timer_is_reinserted_after_firing() {
        let mgr = TimerManager::new();
        mgr.add_timer(5, || {}, true);
        std::thread::sleep(Duration::from_millis(10));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 1);
        assert!(mgr.has_timer());
    }

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let mgr = TimerManager::new();
        assert!(mgr.next_timeout_ms().is_none());
        mgr.add_timer(1000, || {}, false);
        let remaining = mgr.next_timeout_ms().unwrap();
        assert!(remaining <= 1000);
    }
}

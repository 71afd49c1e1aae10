//          Copyright Corey Richardson 2015
// Distributed under the Boost Software License, Version 1.0.
//    (See accompanying file LICENSE_1_0.txt or copy at
//          http://www.boost.org/LICENSE_1_0.txt)

//! GPU timer providers.
//!
//! The profiler never talks to a graphics API itself. Each section that wants
//! GPU timing carries a [`GpuTimer`], which owns a pool of timestamp queries
//! addressed by [`TimerIdx`]. Every slot of the section table needs
//! `FRAME_DELAY * 2` of them: a begin and an end stamp per in-flight frame.

use std::cell::RefCell;
use std::rc::Rc;

use clock_ticks;

use super::{SectionId, FRAME_DELAY};

/// Index of a single timestamp in a provider's pool.
pub type TimerIdx = u32;

/// Maps a section slot and sub-frame to the index of its begin or end stamp.
///
/// Providers rely on this exact layout; begin and end of one sub-frame are
/// always adjacent, begin first.
#[inline]
pub fn timer_idx(slot: SectionId, sub_frame: u32, begin: bool) -> TimerIdx {
    slot * (FRAME_DELAY * 2) + sub_frame * 2 + if begin { 0 } else { 1 }
}

/// Whether `idx` addresses the begin stamp of its pair.
#[inline]
pub fn is_timer_idx_begin(idx: TimerIdx) -> bool {
    idx % 2 == 0
}

/// The section slot `idx` belongs to.
#[inline]
pub fn timer_idx_slot(idx: TimerIdx) -> SectionId {
    idx / (FRAME_DELAY * 2)
}

/// A source of GPU timestamps, implemented once per graphics API.
///
/// All methods take `&self`: providers are shared between sections (and
/// between profilers), so implementations keep their pools behind a `Cell` or
/// `RefCell`. The profiler never calls a provider re-entrantly.
pub trait GpuTimer {
    /// Short label shown in reports, e.g. `"GL "` or `"VK "`.
    fn timer_type_name(&self) -> &str;

    /// Non-blocking check whether the stamp at `idx` can be read back.
    fn timer_available(&self, idx: TimerIdx) -> bool;

    /// Record a "write the current GPU timestamp into `idx`" command.
    fn timer_setup(&self, idx: TimerIdx);

    /// Nanoseconds between two available stamps.
    fn timer_result(&self, begin: TimerIdx, end: TimerIdx) -> u64;

    /// Grow the pool to hold at least `timers` stamps.
    fn timer_ensure_size(&self, timers: u32);

    /// Flush the command stream. Only called for sections that asked for it.
    fn timer_flush(&self) {}
}

/// Identity of a provider, ignoring the vtable half of the fat pointer.
pub(crate) fn same_timer(a: &Option<Rc<dyn GpuTimer>>, b: &Option<Rc<dyn GpuTimer>>) -> bool {
    match (a, b) {
        (&None, &None) => true,
        (&Some(ref a), &Some(ref b)) => {
            Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
        }
        _ => false,
    }
}

/// A provider whose timestamps come from the host clock.
///
/// Stands in for a real query pool on software renderers and in tests: a
/// stamp is "available" as soon as it was written, and writing a begin stamp
/// invalidates its end partner so stale pairs are never read.
pub struct HostTimers {
    stamps: RefCell<Vec<Option<u64>>>,
}

impl HostTimers {
    pub fn new() -> HostTimers {
        HostTimers { stamps: RefCell::new(Vec::new()) }
    }

    /// Number of stamps the pool can hold.
    pub fn len(&self) -> usize {
        self.stamps.borrow().len()
    }
}

impl Default for HostTimers {
    fn default() -> HostTimers {
        HostTimers::new()
    }
}

impl GpuTimer for HostTimers {
    fn timer_type_name(&self) -> &str {
        "HOST"
    }

    fn timer_available(&self, idx: TimerIdx) -> bool {
        self.stamps.borrow().get(idx as usize).map_or(false, |s| s.is_some())
    }

    fn timer_setup(&self, idx: TimerIdx) {
        let mut stamps = self.stamps.borrow_mut();
        let i = idx as usize;
        if i >= stamps.len() {
            error!("HostTimers: timer {} outside of pool of {}", idx, stamps.len());
            return;
        }
        stamps[i] = Some(clock_ticks::precise_time_ns());
        if is_timer_idx_begin(idx) && i + 1 < stamps.len() {
            stamps[i + 1] = None;
        }
    }

    fn timer_result(&self, begin: TimerIdx, end: TimerIdx) -> u64 {
        let stamps = self.stamps.borrow();
        match (stamps.get(begin as usize), stamps.get(end as usize)) {
            (Some(&Some(b)), Some(&Some(e))) => e.saturating_sub(b),
            _ => 0,
        }
    }

    fn timer_ensure_size(&self, timers: u32) {
        let mut stamps = self.stamps.borrow_mut();
        if stamps.len() < timers as usize {
            stamps.resize(timers as usize, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn index_layout() {
        assert_eq!(timer_idx(0, 0, true), 0);
        assert_eq!(timer_idx(0, 0, false), 1);
        assert_eq!(timer_idx(0, 3, false), 7);
        assert_eq!(timer_idx(2, 1, true), 2 * FRAME_DELAY * 2 + 2);

        let idx = timer_idx(5, 2, false);
        assert!(!is_timer_idx_begin(idx));
        assert_eq!(timer_idx_slot(idx), 5);
        assert!(is_timer_idx_begin(timer_idx(5, 2, true)));
    }

    #[test]
    fn host_timers_pair() {
        let timers = HostTimers::new();
        timers.timer_ensure_size(16);
        assert_eq!(timers.len(), 16);
        assert!(!timers.timer_available(1));

        let before = clock_ticks::precise_time_ns();
        timers.timer_setup(0);
        timers.timer_setup(1);
        let after = clock_ticks::precise_time_ns();
        assert!(timers.timer_available(1));
        assert!(timers.timer_result(0, 1) <= after - before);

        // a pair with a missing stamp reads as zero
        assert_eq!(timers.timer_result(2, 3), 0);
        timers.timer_setup(2);
        assert_eq!(timers.timer_result(2, 3), 0);

        // a new begin stamp hides the old end stamp
        timers.timer_setup(0);
        assert!(!timers.timer_available(1));
    }

    #[test]
    fn host_timers_ignore_out_of_pool() {
        let timers = HostTimers::new();
        timers.timer_setup(3);
        assert!(!timers.timer_available(3));
        assert_eq!(timers.timer_result(2, 3), 0);
    }

    #[test]
    fn provider_identity() {
        let a: Rc<dyn GpuTimer> = Rc::new(HostTimers::new());
        let b: Rc<dyn GpuTimer> = Rc::new(HostTimers::new());
        assert!(same_timer(&None, &None));
        assert!(same_timer(&Some(a.clone()), &Some(a.clone())));
        assert!(!same_timer(&Some(a.clone()), &Some(b)));
        assert!(!same_timer(&Some(a), &None));
    }
}

//          Copyright Corey Richardson 2015
// Distributed under the Boost Software License, Version 1.0.
//    (See accompanying file LICENSE_1_0.txt or copy at
//          http://www.boost.org/LICENSE_1_0.txt)

//! A real-time frame profiler for CPU and GPU timings.
//!
//! Every frame, the render loop opens and closes (possibly nested) sections.
//! A section always measures CPU time; if it carries a [`GpuTimer`] it also
//! records a pair of GPU timestamps. GPU results arrive a few frames late, so
//! each section slot keeps `FRAME_DELAY` samples in flight and `end_frame`
//! folds the oldest one into a running average once the provider reports it
//! ready.
//!
//! Sections are identified by call order: the Nth section opened in a frame
//! lands in slot N. A frame must therefore open its sections in the same order
//! every time for the averages to mean anything. Whenever the sequence
//! changes, statistics are wiped for `CONFIG_DELAY` frames before averaging
//! starts over.
//!
//! Not thread-safe. A profiler, and every profiler sharing its table, must be
//! driven from one thread.

#[macro_use]
extern crate log;
extern crate clock_ticks;

use std::cell::{Cell, RefCell};
use std::cmp;
use std::fmt::Write;
use std::rc::Rc;
use std::thread;

pub mod timer;

pub use timer::{is_timer_idx_begin, timer_idx, timer_idx_slot, GpuTimer, HostTimers, TimerIdx};
use timer::same_timer;

/// Frames a detected change in the section sequence keeps statistics cleared.
pub const CONFIG_DELAY: u32 = 8;
/// Frames in flight before GPU results are read back.
pub const FRAME_DELAY: u32 = 4;
/// Initial capacity of the section table.
pub const START_SECTIONS: u32 = 64;

/// Slot of a section within the current frame's sequence.
///
/// Only valid for the `end_section` matching the `begin_section` that
/// returned it.
pub type SectionId = u32;

/// Monotonic high resolution clock in microseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Clock {
        Clock
    }

    pub fn micro_seconds(&self) -> f64 {
        clock_ticks::precise_time_ns() as f64 / 1000.0
    }
}

/// Averaged timings of a section, in microseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Averages {
    pub cpu: f64,
    pub gpu: f64,
    /// Set when later sections with the same name, level and provider were
    /// summed in (a loop body), rather than a single section's average.
    pub accumulated: bool,
}

/// Snapshot of one slot of the last completed frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SectionInfo {
    /// `None` for accumulation splits.
    pub name: Option<&'static str>,
    pub level: u32,
    pub splitter: bool,
    /// Resolved samples in the current average.
    pub num_times: u32,
}

#[derive(Default)]
struct Entry {
    name: Option<&'static str>,
    timer: Option<Rc<dyn GpuTimer>>,
    flush: bool,
    level: u32,
    // in-flight samples, indexed by sub-frame
    cpu_times: [f64; FRAME_DELAY as usize],
    gpu_times: [f64; FRAME_DELAY as usize],

    num_times: u32,
    cpu_time: f64,
    gpu_time: f64,

    splitter: bool,
    accumulated: bool,
}

#[derive(Default)]
struct Data {
    reset_delay: u32,
    num_frames: u32,
    level: u32,
    frame_entries: u32,
    last_entries: u32,
    entries: Vec<Entry>,
}

impl Data {
    fn grow(&mut self, new_size: u32) {
        let old_size = self.entries.len();
        if new_size as usize <= old_size {
            return;
        }
        debug!("growing section table from {} to {}", old_size, new_size);
        self.entries.resize_with(new_size as usize, Entry::default);
    }

    fn next_slot(&mut self) -> SectionId {
        let sec = self.frame_entries;
        self.frame_entries += 1;
        if sec as usize >= self.entries.len() {
            let doubled = self.entries.len() as u32 * 2;
            self.grow(cmp::max(doubled, sec + 1));
        }
        sec
    }

    fn sub_frame(&self) -> u32 {
        self.num_frames % FRAME_DELAY
    }

    fn required_timers(&self) -> u32 {
        self.entries.len() as u32 * FRAME_DELAY * 2
    }

    fn last_count(&self) -> usize {
        cmp::min(self.last_entries as usize, self.entries.len())
    }

    fn clear_accumulated(&mut self) {
        let last = self.last_count();
        for entry in &mut self.entries[..last] {
            entry.accumulated = false;
        }
    }

    /// Average of `slot`, plus every later matching section up to the next
    /// split at or above its level. Marks the summed-in sections so the
    /// caller's traversal skips them.
    fn averaged(&mut self, slot: SectionId) -> Option<Averages> {
        let i = slot as usize;
        let last = self.last_count();

        let (name, level, timer, mut cpu, mut gpu) = match self.entries.get(i) {
            Some(entry) if entry.num_times > 0 && !entry.accumulated && !entry.splitter => {
                let n = entry.num_times as f64;
                (entry.name, entry.level, entry.timer.clone(), entry.cpu_time / n, entry.gpu_time / n)
            }
            _ => return None,
        };

        let mut accumulated = false;
        for other in self.entries[..last].iter_mut().skip(i + 1) {
            if other.splitter {
                if other.level <= level {
                    break;
                }
                continue;
            }
            if other.name == name
                && other.level == level
                && same_timer(&other.timer, &timer)
                && !other.accumulated
                && other.num_times > 0
            {
                let n = other.num_times as f64;
                cpu += other.cpu_time / n;
                gpu += other.gpu_time / n;
                other.accumulated = true;
                accumulated = true;
            }
        }

        Some(Averages { cpu: cpu, gpu: gpu, accumulated: accumulated })
    }
}

/// Times nested sections of a frame on the CPU and, optionally, the GPU.
pub struct Profiler {
    data: Rc<RefCell<Data>>,
    clock: Clock,
    default_timer: RefCell<Option<Rc<dyn GpuTimer>>>,
    last_print: Cell<f64>,
}

/// A "guard" for calling `Profiler::end_section` when it is destroyed.
pub struct Section<'a> {
    profiler: &'a Profiler,
    id: SectionId,
}

impl<'a> Section<'a> {
    pub fn id(&self) -> SectionId {
        self.id
    }
}

impl<'a> Drop for Section<'a> {
    fn drop(&mut self) {
        self.profiler.end_section(self.id)
    }
}

/// A guard for one frame: `end_frame` on destruction, followed by a report
/// into the borrowed string when the print interval elapsed.
pub struct Frame<'a> {
    profiler: &'a Profiler,
    print: bool,
    stats: &'a mut String,
}

impl<'a> Frame<'a> {
    /// Whether this frame writes a report when it ends.
    pub fn will_print(&self) -> bool {
        self.print
    }
}

impl<'a> Drop for Frame<'a> {
    fn drop(&mut self) {
        self.profiler.end_frame();
        if self.print {
            self.profiler.print(self.stats);
            // average the next report over fresh samples only
            self.profiler.reset(1);
        }
    }
}

impl Default for Profiler {
    fn default() -> Profiler {
        Profiler::new()
    }
}

impl Profiler {
    /// Create a profiler with its own table of `START_SECTIONS` slots.
    pub fn new() -> Profiler {
        Profiler::with_capacity(START_SECTIONS)
    }

    /// Create a profiler with its own table of `sections` slots.
    pub fn with_capacity(sections: u32) -> Profiler {
        let profiler = Profiler::from_data(Rc::new(RefCell::new(Data::default())));
        profiler.data.borrow_mut().grow(sections);
        profiler
    }

    /// Create a profiler that records into `master`'s table.
    ///
    /// Both profilers see and mutate the same sections, so their frames must
    /// not overlap.
    pub fn with_master(master: &Profiler) -> Profiler {
        let profiler = Profiler::from_data(master.data.clone());
        profiler.data.borrow_mut().grow(START_SECTIONS);
        profiler
    }

    fn from_data(data: Rc<RefCell<Data>>) -> Profiler {
        Profiler {
            data: data,
            clock: Clock::new(),
            default_timer: RefCell::new(None),
            last_print: Cell::new(0.0),
        }
    }

    /// Provider used by sections that don't name one.
    pub fn set_default_gpu_timer(&self, timer: Option<Rc<dyn GpuTimer>>) {
        if let Some(ref timer) = timer {
            timer.timer_ensure_size(self.required_timers());
        }
        *self.default_timer.borrow_mut() = timer;
    }

    /// Start a frame.
    ///
    /// Logs an error if there are pending `end_section` calls, but there are
    /// otherwise no ill effects.
    pub fn begin_frame(&self) {
        let mut data = self.data.borrow_mut();
        if data.level != 0 {
            error!("Pending `end_section` calls on Profiler::begin_frame");
        }
        data.frame_entries = 0;
        data.level = 0;
    }

    /// Finish a frame and resolve the oldest in-flight samples.
    ///
    /// Pending `end_section` calls are a programmer error: logged, and fatal
    /// in debug builds.
    pub fn end_frame(&self) {
        let mut guard = self.data.borrow_mut();
        let data = &mut *guard;

        if data.level != 0 {
            error!("Pending `end_section` calls on Profiler::end_frame");
            // a second panic while unwinding through a `Frame` would abort
            debug_assert!(thread::panicking(), "unbalanced sections at end of frame");
        }

        if data.frame_entries != data.last_entries {
            debug!("section count changed from {} to {}", data.last_entries, data.frame_entries);
            data.last_entries = data.frame_entries;
            data.reset_delay = CONFIG_DELAY;
        }

        // keeps wiping every frame until the sequence settles
        if data.reset_delay > 0 {
            data.reset_delay -= 1;
            for entry in &mut data.entries {
                entry.num_times = 0;
                entry.cpu_time = 0.0;
                entry.gpu_time = 0.0;
            }
            data.num_frames = 0;
        }

        if data.num_frames > FRAME_DELAY {
            let query_frame = (data.num_frames + 1) % FRAME_DELAY;
            let qf = query_frame as usize;
            let frame_entries = data.frame_entries as usize;

            for (i, entry) in data.entries.iter_mut().enumerate().take(frame_entries) {
                if entry.splitter {
                    continue;
                }

                let slot = i as SectionId;
                let available = match entry.timer {
                    Some(ref timer) => {
                        let end = timer_idx(slot, query_frame, false);
                        if timer.timer_available(end) {
                            let nanos = timer.timer_result(timer_idx(slot, query_frame, true), end);
                            entry.gpu_times[qf] = nanos as f64 / 1000.0;
                            true
                        } else {
                            false
                        }
                    }
                    None => true,
                };

                if available {
                    entry.gpu_time += entry.gpu_times[qf];
                    entry.cpu_time += entry.cpu_times[qf];
                    entry.num_times += 1;
                }
            }
        }

        data.num_frames += 1;
    }

    /// Open a section timed on the CPU and, if a default timer is set, the GPU.
    pub fn begin_section(&self, name: &'static str) -> SectionId {
        self.begin_section_ex(name, None, false)
    }

    /// Open a section timed with `timer` (falling back to the default timer).
    ///
    /// With `flush`, the provider's command stream is flushed after the end
    /// stamp: more accurate isolated timings at the cost of a stall.
    pub fn begin_section_ex(&self, name: &'static str, timer: Option<Rc<dyn GpuTimer>>, flush: bool) -> SectionId {
        let timer = timer.or_else(|| self.default_timer.borrow().clone());

        let mut guard = self.data.borrow_mut();
        let data = &mut *guard;

        let sub_frame = data.sub_frame();
        let sec = data.next_slot();
        if let Some(ref timer) = timer {
            timer.timer_ensure_size(data.required_timers());
        }

        let level = data.level;
        data.level += 1;

        let changed = {
            let entry = &mut data.entries[sec as usize];
            let changed = entry.name != Some(name) || !same_timer(&entry.timer, &timer);
            if changed {
                entry.name = Some(name);
                entry.timer = timer.clone();
            }
            entry.flush = flush;
            entry.level = level;
            entry.splitter = false;

            let sf = sub_frame as usize;
            entry.cpu_times[sf] = -self.clock.micro_seconds();
            entry.gpu_times[sf] = 0.0;
            changed
        };

        if changed {
            trace!("slot {} now holds section {:?}", sec, name);
            data.reset_delay = CONFIG_DELAY;
        }

        if let Some(ref timer) = timer {
            timer.timer_setup(timer_idx(sec, sub_frame, true));
        }

        sec
    }

    /// Close the section `sec` returned by `begin_section`.
    pub fn end_section(&self, sec: SectionId) {
        let mut guard = self.data.borrow_mut();
        let data = &mut *guard;

        if data.level == 0 {
            error!("Profiler::end_section({}) without an open section", sec);
            return;
        }

        let sub_frame = data.sub_frame();
        let entry = match data.entries.get_mut(sec as usize) {
            Some(entry) => entry,
            None => {
                error!("Profiler::end_section({}) for an unknown section", sec);
                return;
            }
        };

        if let Some(ref timer) = entry.timer {
            timer.timer_setup(timer_idx(sec, sub_frame, false));
            if entry.flush {
                timer.timer_flush();
            }
        }
        entry.cpu_times[sub_frame as usize] += self.clock.micro_seconds();

        data.level -= 1;
    }

    /// Open a section, returning a guard that closes it on destruction.
    pub fn section(&self, name: &'static str) -> Section {
        let id = self.begin_section(name);
        Section { profiler: self, id: id }
    }

    /// Like `section`, with an explicit timer and flush request.
    pub fn section_ex(&self, name: &'static str, timer: Option<Rc<dyn GpuTimer>>, flush: bool) -> Section {
        let id = self.begin_section_ex(name, timer, flush);
        Section { profiler: self, id: id }
    }

    /// Start a frame, returning a guard that ends it on destruction.
    ///
    /// If more than `print_interval` passed between `cur_time` and the last
    /// printing frame, the guard writes the report into `stats` after ending
    /// the frame.
    pub fn frame<'a>(&'a self, cur_time: f64, print_interval: f64, stats: &'a mut String) -> Frame<'a> {
        let print = cur_time - self.last_print.get() > print_interval;
        if print {
            self.last_print.set(cur_time);
        }
        self.begin_frame();
        Frame { profiler: self, print: print, stats: stats }
    }

    /// Insert a split point that the accumulation of same-named sections at
    /// this level or deeper will not cross.
    ///
    /// Use between loops that open sections with identical names, outside of
    /// the loop's own sections.
    pub fn accumulation_split(&self) {
        let mut guard = self.data.borrow_mut();
        let data = &mut *guard;

        let sec = data.next_slot();
        let level = data.level;
        let changed = {
            let entry = &mut data.entries[sec as usize];
            let changed = !entry.splitter;
            entry.name = None;
            entry.timer = None;
            entry.level = level;
            entry.splitter = true;
            changed
        };
        if changed {
            data.reset_delay = CONFIG_DELAY;
        }
    }

    /// Discard all sections and statistics, keeping the table capacity.
    pub fn clear(&self) {
        let mut data = self.data.borrow_mut();
        for entry in &mut data.entries {
            *entry = Entry::default();
        }
        data.last_entries = 0;
        data.num_frames = 0;
    }

    /// Restart averaging after `delay` frames, e.g. once caches warmed up
    /// after a configuration change. `CONFIG_DELAY` is the usual choice.
    pub fn reset(&self, delay: u32) {
        self.data.borrow_mut().reset_delay = delay;
    }

    /// Pretty print the current averages into `stats`, one line per section.
    pub fn print(&self, stats: &mut String) {
        const SPACES: &'static str = "        ";

        stats.clear();

        let mut guard = self.data.borrow_mut();
        let data = &mut *guard;
        data.clear_accumulated();

        for i in 0..data.last_count() {
            let avg = match data.averaged(i as SectionId) {
                Some(avg) => avg,
                None => continue,
            };

            let entry = &data.entries[i];
            let indent = &SPACES[7 - cmp::min(entry.level, 7) as usize..];
            let name = entry.name.unwrap_or("");
            let api = entry.timer.as_ref().map_or("N/A", |t| t.timer_type_name());

            // writing into a String cannot fail
            let _ = if avg.accumulated {
                writeln!(
                    stats,
                    "{}Timer {};\t {} {:6}; CPU {:6}; (microseconds, accumulated loop)",
                    indent, name, api, avg.gpu as u32, avg.cpu as u32
                )
            } else {
                writeln!(
                    stats,
                    "{}Timer {};\t {} {:6}; CPU {:6}; (microseconds, avg {})",
                    indent, name, api, avg.gpu as u32, avg.cpu as u32, entry.num_times
                )
            };
        }
    }

    /// Averages of the first section of the last frame called `name`.
    pub fn averaged_values(&self, name: &str) -> Option<Averages> {
        let mut data = self.data.borrow_mut();
        data.clear_accumulated();

        let last = data.last_count();
        let slot = data.entries[..last].iter().position(|e| !e.splitter && e.name == Some(name))?;
        data.averaged(slot as SectionId)
    }

    /// Averages of the section in `slot`, summing in the later sections of
    /// the same loop.
    ///
    /// `None` if the slot has no resolved samples yet, or was already summed
    /// into an earlier slot. Walking the slots of a frame therefore reports
    /// every loop once; call `clear_accumulated` before each walk.
    pub fn averaged_values_at(&self, slot: SectionId) -> Option<Averages> {
        self.data.borrow_mut().averaged(slot)
    }

    /// Start a new walk over `averaged_values_at`.
    pub fn clear_accumulated(&self) {
        self.data.borrow_mut().clear_accumulated();
    }

    /// Number of samples in the average of the first section called `name`,
    /// or of slot 0 without a name.
    pub fn averaged_frames(&self, name: Option<&str>) -> u32 {
        let data = self.data.borrow();
        match name {
            None => data.entries.first().map_or(0, |e| e.num_times),
            Some(name) => data.entries[..data.last_count()]
                .iter()
                .find(|e| !e.splitter && e.name == Some(name))
                .map_or(0, |e| e.num_times),
        }
    }

    /// Snapshot of the slots of the last completed frame.
    pub fn sections(&self) -> Vec<SectionInfo> {
        let data = self.data.borrow();
        data.entries[..data.last_count()]
            .iter()
            .map(|e| SectionInfo { name: e.name, level: e.level, splitter: e.splitter, num_times: e.num_times })
            .collect()
    }

    pub fn micro_seconds(&self) -> f64 {
        self.clock.micro_seconds()
    }

    /// Number of slots in the section table.
    pub fn capacity(&self) -> u32 {
        self.data.borrow().entries.len() as u32
    }

    /// Current nesting depth, 0 outside of any section.
    pub fn level(&self) -> u32 {
        self.data.borrow().level
    }

    /// Frames since averaging last (re)started.
    pub fn frame_count(&self) -> u32 {
        self.data.borrow().num_frames
    }

    /// Sub-frame the current frame's samples are written to.
    pub fn sub_frame(&self) -> u32 {
        self.data.borrow().sub_frame()
    }

    /// Timestamps a provider needs to cover every slot of the table.
    pub fn required_timers(&self) -> u32 {
        self.data.borrow().required_timers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(p: &Profiler, names: &[&'static str]) {
        p.begin_frame();
        for &name in names {
            let id = p.begin_section(name);
            p.end_section(id);
        }
        p.end_frame();
    }

    #[test]
    fn slots_follow_call_order() {
        let p = Profiler::new();
        for _ in 0..2 {
            p.begin_frame();
            let a = p.begin_section("a");
            let b = p.begin_section("b");
            p.end_section(b);
            p.end_section(a);
            let c = p.begin_section("c");
            p.end_section(c);
            p.end_frame();
            assert_eq!((a, b, c), (0, 1, 2));
        }
        let levels: Vec<u32> = p.sections().iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![0, 1, 0]);
    }

    #[test]
    fn grow_keeps_existing_slots() {
        let mut data = Data::default();
        data.grow(4);
        data.entries[2].name = Some("kept");
        data.entries[2].num_times = 3;
        data.grow(8);
        assert_eq!(data.entries.len(), 8);
        assert_eq!(data.entries[2].name, Some("kept"));
        assert_eq!(data.entries[2].num_times, 3);
        assert_eq!(data.entries[7].name, None);

        // never shrinks
        data.grow(2);
        assert_eq!(data.entries.len(), 8);
    }

    #[test]
    fn overflow_doubles() {
        let p = Profiler::with_capacity(2);
        frame(&p, &["a", "b", "c"]);
        assert_eq!(p.capacity(), 4);
        assert_eq!(p.sections().len(), 3);
    }

    #[test]
    fn reset_wipes_every_frame_while_counting_down() {
        let p = Profiler::new();
        for _ in 0..(CONFIG_DELAY + FRAME_DELAY + 3) {
            frame(&p, &["a"]);
        }
        assert!(p.averaged_frames(Some("a")) > 0);

        frame(&p, &["a", "b"]);
        assert_eq!(p.data.borrow().reset_delay, CONFIG_DELAY - 1);
        for left in (0..CONFIG_DELAY - 1).rev() {
            {
                let mut data = p.data.borrow_mut();
                data.entries[0].num_times = 42;
            }
            frame(&p, &["a", "b"]);
            assert_eq!(p.data.borrow().reset_delay, left);
            assert_eq!(p.averaged_frames(Some("a")), 0);
            assert_eq!(p.frame_count(), 1);
        }

        // settled, counts survive now
        p.data.borrow_mut().entries[0].num_times = 42;
        frame(&p, &["a", "b"]);
        assert_eq!(p.averaged_frames(Some("a")), 42);
    }

    #[test]
    fn renamed_slot_arms_reset() {
        let p = Profiler::new();
        for _ in 0..(CONFIG_DELAY + 1) {
            frame(&p, &["a"]);
        }
        assert_eq!(p.data.borrow().reset_delay, 0);

        frame(&p, &["z"]);
        assert_eq!(p.data.borrow().reset_delay, CONFIG_DELAY - 1);
    }

    #[test]
    fn explicit_reset() {
        let p = Profiler::new();
        p.reset(3);
        assert_eq!(p.data.borrow().reset_delay, 3);
    }

    #[test]
    fn split_replaces_section() {
        let p = Profiler::new();
        for _ in 0..(CONFIG_DELAY + 1) {
            frame(&p, &["a", "b"]);
        }
        assert_eq!(p.data.borrow().reset_delay, 0);

        p.begin_frame();
        let a = p.begin_section("a");
        p.end_section(a);
        p.accumulation_split();
        p.end_frame();
        assert_eq!(p.data.borrow().reset_delay, CONFIG_DELAY - 1);

        let sections = p.sections();
        assert!(sections[1].splitter);
        assert_eq!(sections[1].name, None);
    }

    #[test]
    fn clear_keeps_capacity() {
        let p = Profiler::with_capacity(4);
        frame(&p, &["a", "b"]);
        p.clear();
        assert_eq!(p.capacity(), 4);
        assert!(p.sections().is_empty());
        assert_eq!(p.averaged_frames(None), 0);
    }

    #[test]
    fn extra_end_section_is_ignored() {
        let p = Profiler::new();
        p.begin_frame();
        p.end_section(0);
        assert_eq!(p.level(), 0);
        let a = p.begin_section("a");
        p.end_section(a);
        p.end_section(a);
        assert_eq!(p.level(), 0);
        p.end_frame();
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.micro_seconds();
        let b = clock.micro_seconds();
        assert!(b >= a);
    }
}

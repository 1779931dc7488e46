//! A tick source driven by hand
use ktimeout::{PortTimeSlice, PortTimer, TimeoutEngine};
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cpu::impl_port_threading;

/// A deterministic tick source for tests and simulations.
///
/// Time only passes when [`Self::advance`] is called, and the passed ticks
/// are only announced by [`Self::flush`]. In between, they are reported as
/// unannounced ticks through [`PortTimer::elapsed`], like a tickless tick
/// source whose interrupt hasn't fired yet.
///
/// `ManualPort` also emulates a scheduler's time slicing. See
/// [`Self::set_time_slice`].
#[derive(Debug)]
pub struct ManualPort {
    /// Ticks passed but not announced yet
    pending: AtomicU32,

    /// The last request made through [`PortTimer::set_timeout`]
    programmed: SpinMutex<Option<(i32, bool)>>,

    slice: SpinMutex<SliceState>,

    /// The total number of ticks charged through [`PortTimeSlice::time_slice`]
    charged: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SliceState {
    /// The slice length. `0` means time slicing is disabled.
    len: i32,
    remaining: i32,
    expirations: u64,
}

impl Default for ManualPort {
    fn default() -> Self {
        Self::new()
    }
}

impl_port_threading!(ManualPort);

impl ManualPort {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            programmed: SpinMutex::new(None),
            slice: SpinMutex::new(SliceState {
                len: 0,
                remaining: 0,
                expirations: 0,
            }),
            charged: AtomicU64::new(0),
        }
    }

    /// Let `ticks` ticks pass without announcing them.
    pub fn advance(&self, ticks: u32) {
        log::trace!("advance({ticks})");
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_add(ticks))
            });
    }

    /// Get the number of ticks passed since the last [`Self::flush`].
    pub fn pending_ticks(&self) -> u32 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Announce all passed ticks to `engine`, firing the timeouts that
    /// expired.
    pub fn flush(&self, engine: &TimeoutEngine<Self>) {
        // Clear the counter first; the engine must not see these ticks both
        // as announced and unannounced
        let mut ticks = self.pending.swap(0, Ordering::Relaxed);
        log::trace!("flush: announcing {ticks} tick(s)");

        loop {
            let chunk = ticks.min(i32::MAX as u32);
            engine.announce(chunk as i32);
            ticks -= chunk;
            if ticks == 0 {
                break;
            }
        }
    }

    /// [`Self::advance`] and then [`Self::flush`].
    pub fn tick(&self, engine: &TimeoutEngine<Self>, ticks: u32) {
        self.advance(ticks);
        self.flush(engine);
    }

    /// Let time pass until the deadline most recently requested by the engine
    /// and announce it. Returns the number of ticks that passed, or `None` if
    /// nothing is scheduled.
    pub fn run_to_deadline(&self, engine: &TimeoutEngine<Self>) -> Option<u32> {
        let (ticks, _) = self.programmed()?;
        if ticks < 0 || ticks == i32::MAX {
            // Nothing to wait for
            return None;
        }

        // The request is relative to the time of the request, which already
        // includes the pending ticks
        let ticks = (ticks as u32).saturating_sub(self.pending_ticks()).max(1);
        self.tick(engine, ticks);
        Some(ticks)
    }

    /// Get the last wake-up request made by the engine.
    pub fn programmed(&self) -> Option<(i32, bool)> {
        *self.programmed.lock()
    }

    /// Enable time slicing with the specified slice length, or disable it by
    /// passing `0`. Starts a new slice.
    pub fn set_time_slice(&self, len: i32) {
        log::trace!("set_time_slice({len})");
        assert!(len >= 0, "slice length must not be negative");
        let mut slice = self.slice.lock();
        slice.len = len;
        slice.remaining = len;
    }

    /// Get the number of times a time slice ran out.
    pub fn slice_expirations(&self) -> u64 {
        self.slice.lock().expirations
    }

    /// Get the total number of ticks the engine has announced so far.
    pub fn charged_ticks(&self) -> u64 {
        self.charged.load(Ordering::Relaxed)
    }
}

impl PortTimer for ManualPort {
    fn set_timeout(&self, ticks: i32, is_idle: bool) {
        log::trace!("set_timeout({ticks}, {is_idle})");
        *self.programmed.lock() = Some((ticks, is_idle));
    }

    fn elapsed(&self) -> u32 {
        self.pending.load(Ordering::Relaxed)
    }
}

impl PortTimeSlice for ManualPort {
    fn time_slice(&self, ticks: i32) {
        self.charged.fetch_add(ticks.max(0) as u64, Ordering::Relaxed);

        let mut slice = self.slice.lock();
        if slice.len == 0 {
            return;
        }

        slice.remaining = slice.remaining.saturating_sub(ticks);
        if slice.remaining <= 0 {
            log::debug!("time slice expired");
            slice.expirations += 1;
            slice.remaining = slice.len;
        }
    }

    fn slice_ticks(&self, _cpu_id: usize) -> i32 {
        let slice = self.slice.lock();
        if slice.len == 0 {
            0
        } else {
            slice.remaining
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktimeout::{Config, Timeout};
    use std::sync::{Arc, Mutex};

    fn engine() -> TimeoutEngine<ManualPort> {
        crate::init_logger();
        TimeoutEngine::new(ManualPort::new(), Config::new())
    }

    #[test]
    fn advance_is_reported_as_elapsed() {
        let engine = engine();
        engine.port().advance(3);
        engine.port().advance(4);
        assert_eq!(engine.port().pending_ticks(), 7);
        assert_eq!(engine.tick_get(), 7);

        engine.port().flush(&engine);
        assert_eq!(engine.port().pending_ticks(), 0);
        assert_eq!(engine.tick_get(), 7);
        assert_eq!(engine.port().charged_ticks(), 7);
    }

    #[test]
    fn run_to_deadline() {
        let engine = engine();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for n in [5, 2] {
            let id = engine.create_timeout();
            let fired = Arc::clone(&fired);
            engine.add_timeout(
                id,
                move |engine, _| fired.lock().unwrap().push(engine.tick_get()),
                Timeout::Ticks(n),
            );
        }
        assert_eq!(engine.port().programmed(), Some((2, false)));

        engine.port().advance(1);
        assert_eq!(engine.port().run_to_deadline(&engine), Some(1));
        assert_eq!(*fired.lock().unwrap(), [2]);
        assert_eq!(engine.port().programmed(), Some((3, false)));

        assert_eq!(engine.port().run_to_deadline(&engine), Some(3));
        assert_eq!(*fired.lock().unwrap(), [2, 5]);

        // Only the "maximum wait" request is left
        assert_eq!(engine.port().programmed(), Some((i32::MAX, false)));
        assert_eq!(engine.port().run_to_deadline(&engine), None);
    }

    #[test]
    fn time_slice_emulation() {
        let engine = engine();
        engine.port().set_time_slice(3);
        assert_eq!(engine.next_expiry(), 3);

        engine.port().tick(&engine, 2);
        assert_eq!(engine.next_expiry(), 1);
        assert_eq!(engine.port().programmed(), Some((1, false)));

        engine.port().tick(&engine, 1);
        assert_eq!(engine.port().slice_expirations(), 1);
        assert_eq!(engine.next_expiry(), 3);

        engine.port().set_time_slice(0);
        assert_eq!(engine.next_expiry(), i32::MAX);
    }
}

//! Manages timeouts (timed events) and the tick counter.
//!
//! # Delta Encoding
//!
//! Pending timeouts are kept in a single list sorted by expiration. Each
//! entry stores the number of ticks between the expiration of the previous
//! entry (or `curr_tick` for the first entry) and its own expiration:
//!
//! ```text
//!   curr_tick                     ticks ─────▶
//! ──────┼────────┬───────────────┬───────────────┬──────
//!       ╞════════╡═══════════════╡═══════════════╡
//!        dticks=2     dticks=3        dticks=3
//!           A            B               C
//! ```
//!
//! Inserting or removing an entry only adjusts the `dticks` of its successor,
//! and the summed `dticks` up to any entry always equals its distance from
//! `curr_tick`.
//!
//! # Unannounced Ticks
//!
//! In a tickless configuration, the tick source doesn't interrupt on every
//! tick. Ticks that have elapsed since the last [`announce`] are reported by
//! [`PortTimer::elapsed`] and are accounted for whenever a timeout is
//! registered or queried. While [`announce`] is in progress,
//! `announce_remaining` holds the ticks it hasn't attributed yet, and the
//! unannounced tick count is treated as zero so they aren't counted twice.
//!
//! [`announce`]: TimeoutEngine::announce
//! [`PortTimer::elapsed`]: crate::PortTimer::elapsed
use alloc::sync::Arc;
use core::fmt;
use slab::Slab;

use crate::{
    error::{AbortTimeoutError, DestroyTimeoutError},
    klock::{CpuLockCell, CpuLockGuard},
    port::Port,
    time::{Config, Ticks, Timeout, Timepoint, TICKS_FOREVER_32},
    utils::intrusive_list::{ItemError, Link, Linked, ListAccessor, ListHead},
};


/// Timeout callback function.
///
/// Called with the engine lock released, right after the associated timeout
/// was unlinked, so it may register or abort timeouts (including the one
/// that just expired). The second parameter identifies the expired timeout.
pub type TimeoutFn<P> = Arc<dyn Fn(&TimeoutEngine<P>, TimeoutId) + Send + Sync>;

/// A handle to a timeout owned by [`TimeoutEngine`].
///
/// Obtained by [`TimeoutEngine::create_timeout`]. The handle stays valid
/// until [`TimeoutEngine::destroy_timeout`]; afterwards it refers to nothing,
/// even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId {
    index: usize,
    generation: u32,
}

/// A timeout control block.
struct TimeoutCb<P: Port> {
    /// The number of ticks between the expiration of the previous timeout in
    /// the list (or `curr_tick`) and this timeout's expiration. Meaningless
    /// while the timeout is unlinked.
    dticks: Ticks,

    /// `Some(_)` if and only if the timeout is pending.
    link: Option<Link>,

    /// The callback function. `None` until the first `add_timeout`.
    callback: Option<TimeoutFn<P>>,

    /// Distinguishes this timeout from previous occupants of the same slot.
    generation: u32,
}

impl<P: Port> Linked for TimeoutCb<P> {
    #[inline]
    fn link(&self) -> Option<Link> {
        self.link
    }

    #[inline]
    fn link_mut(&mut self) -> &mut Option<Link> {
        &mut self.link
    }
}

impl<P: Port> fmt::Debug for TimeoutCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutCb")
            .field("dticks", &self.dticks)
            .field("link", &self.link)
            .field("callback", &self.callback.as_ref().map(|_| ..))
            .field("generation", &self.generation)
            .finish()
    }
}

/// The engine state protected by CPU Lock.
struct TimeoutGlobals<P: Port> {
    /// The number of ticks announced since boot.
    curr_tick: u64,

    /// The ticks of the in-progress [`TimeoutEngine::announce`] call that
    /// haven't been added to `curr_tick` yet. Zero when no announcement is in
    /// progress.
    announce_remaining: i32,

    /// The pending timeouts, sorted by expiration.
    list_head: ListHead,

    /// Storage for all timeouts, pending or not.
    pool: Slab<TimeoutCb<P>>,

    /// The generation assigned to the next timeout created.
    next_generation: u32,
}

impl<P: Port> fmt::Debug for TimeoutGlobals<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        struct Deltas<'a, P: Port>(&'a TimeoutGlobals<P>);

        impl<P: Port> fmt::Debug for Deltas<'_, P> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_list()
                    .entries(self.0.list_head.iter(&self.0.pool).map(|(_, cb)| cb.dticks))
                    .finish()
            }
        }

        f.debug_struct("TimeoutGlobals")
            .field("curr_tick", &self.curr_tick)
            .field("announce_remaining", &self.announce_remaining)
            .field("deltas", &Deltas(self))
            .field("num_timeouts", &self.pool.len())
            .finish()
    }
}

impl<P: Port> TimeoutGlobals<P> {
    /// Find the slot of the timeout identified by `id`.
    #[inline]
    fn resolve(&self, id: TimeoutId) -> Option<usize> {
        self.pool
            .get(id.index)
            .filter(|cb| cb.generation == id.generation)
            .map(|_| id.index)
    }

    #[inline]
    fn list(&mut self) -> ListAccessor<'_, Slab<TimeoutCb<P>>> {
        ListAccessor::new(&mut self.list_head, &mut self.pool)
    }

    #[inline]
    fn is_linked(&self, index: usize) -> bool {
        self.pool[index].link.is_some()
    }

    /// Insert the unlinked timeout `index` into the list according to its
    /// `dticks`, which is relative to `curr_tick` on entry and relative to
    /// its new predecessor on return.
    ///
    /// A timeout expiring at the same tick as existing ones is placed after
    /// them, so simultaneous timeouts fire in the order they were added.
    fn insert_timeout(&mut self, index: usize) {
        let mut list = self.list();
        let mut cursor = list.front();

        while let Some(t) = cursor {
            let t_dticks = list.pool()[t].dticks;
            let dticks = list.pool()[index].dticks;
            if t_dticks > dticks {
                // Insert before `t`, which is now relative to `index`
                list.pool_mut()[t].dticks = t_dticks - dticks;
                break;
            }
            list.pool_mut()[index].dticks = dticks - t_dticks;
            cursor = list.next(t);
        }

        // `cursor == None` appends `index` with its remaining `dticks`
        list.insert(index, cursor);
    }

    /// Unlink the timeout `index`, folding its `dticks` into its successor.
    fn remove_timeout(&mut self, index: usize) -> Result<(), ItemError> {
        let mut list = self.list();
        if let Some(next) = list.next(index) {
            let dticks = list.pool()[index].dticks;
            list.pool_mut()[next].dticks += dticks;
        }
        list.remove(index).map(drop)
    }

    /// Sum the `dticks` of the pending timeout `index` and all timeouts before
    /// it, giving its distance from `curr_tick`.
    fn ticks_until(&self, index: usize) -> Ticks {
        let mut ticks: Ticks = 0;
        for (t, cb) in self.list_head.iter(&self.pool) {
            ticks = ticks.saturating_add(cb.dticks);
            if t == index {
                break;
            }
        }
        ticks
    }
}

/// The timeout engine.
///
/// Owns the tick counter and the pending timeout list. Every method may be
/// called from any thread or interrupt handler on any CPU.
pub struct TimeoutEngine<P: Port> {
    port: P,
    config: Config,
    g: CpuLockCell<TimeoutGlobals<P>>,
}

impl<P: Port> fmt::Debug for TimeoutEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutEngine")
            .field("config", &self.config)
            .field("g", &self.g)
            .finish()
    }
}

// Initialization
// ---------------------------------------------------------------------------

impl<P: Port> TimeoutEngine<P> {
    /// Construct a `TimeoutEngine` with the tick counter at zero and no
    /// pending timeouts.
    pub fn new(port: P, config: Config) -> Self {
        Self {
            port,
            config,
            g: CpuLockCell::new(TimeoutGlobals {
                curr_tick: 0,
                announce_remaining: 0,
                list_head: ListHead::new(),
                pool: Slab::new(),
                next_generation: 0,
            }),
        }
    }

    /// Get a reference to the port.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    fn lock(&self) -> CpuLockGuard<'_, P, TimeoutGlobals<P>> {
        self.g.lock(&self.port)
    }

    /// Get the number of ticks elapsed since the last announcement that
    /// haven't been announced yet.
    #[inline]
    fn elapsed(&self, g: &TimeoutGlobals<P>) -> u32 {
        if self.config.tickless && g.announce_remaining == 0 {
            self.port.elapsed()
        } else {
            0
        }
    }

    /// Calculate the number of ticks until the next deadline, taking the
    /// current time slice into account. The result is what the tick source
    /// should be programmed with.
    fn next_timeout(&self, g: &TimeoutGlobals<P>) -> i32 {
        let max_wait = self.config.max_wait();

        let mut ret = match g.list_head.front() {
            Some(first) => {
                let ticks_elapsed = self.elapsed(g) as Ticks;
                let remaining = g.pool[first].dticks.saturating_sub(ticks_elapsed);
                if remaining > i32::MAX as Ticks {
                    max_wait
                } else {
                    remaining.max(0) as i32
                }
            }
            None => max_wait,
        };

        // The time slice is a second deadline source
        let slice_ticks = self.port.slice_ticks(self.port.cpu_id());
        if slice_ticks > 0 && (ret == TICKS_FOREVER_32 || slice_ticks < ret) {
            ret = slice_ticks;
        }

        ret
    }
}

// Timeout Management
// ---------------------------------------------------------------------------

impl<P: Port> TimeoutEngine<P> {
    /// Create an unlinked timeout and return a handle to it.
    pub fn create_timeout(&self) -> TimeoutId {
        let mut g = self.lock();

        let generation = g.next_generation;
        g.next_generation = generation.wrapping_add(1);

        let index = g.pool.insert(TimeoutCb {
            dticks: 0,
            link: None,
            callback: None,
            generation,
        });

        let id = TimeoutId { index, generation };
        log::trace!("create_timeout → {id:?}");
        id
    }

    /// Release the timeout identified by `id`, aborting it first if it's still
    /// pending. `id` is invalid afterwards.
    pub fn destroy_timeout(&self, id: TimeoutId) -> Result<(), DestroyTimeoutError> {
        log::trace!("destroy_timeout({id:?})");
        let mut g = self.lock();

        let index = g.resolve(id).ok_or(DestroyTimeoutError::BadId)?;

        if g.is_linked(index) {
            log::debug!("destroying {id:?} while it's still pending");
            // Can't fail; the timeout is linked
            let _ = g.remove_timeout(index);
        }

        let cb = g.pool.remove(index);

        // The callback may own arbitrary state; drop it outside CPU Lock
        drop(g);
        drop(cb);

        Ok(())
    }

    /// Register the timeout `id` to call `callback` when `timeout` expires.
    ///
    /// Relative timeouts of less than one tick (including
    /// [`Timeout::NoWait`]) are rounded up to one tick, so `callback` is never
    /// called from inside this method. [`Timeout::Forever`] leaves the timeout
    /// unlinked.
    ///
    /// # Panics
    ///
    /// Panics if the timeout is already pending or `id` is no longer valid.
    pub fn add_timeout(
        &self,
        id: TimeoutId,
        callback: impl Fn(&Self, TimeoutId) + Send + Sync + 'static,
        timeout: Timeout,
    ) {
        self.add_timeout_shared(id, Arc::new(callback), timeout);
    }

    /// Like [`Self::add_timeout`], but takes a shared callback function, which
    /// lets a client re-register a timeout without allocating.
    pub fn add_timeout_shared(&self, id: TimeoutId, callback: TimeoutFn<P>, timeout: Timeout) {
        log::trace!("add_timeout({id:?}, {timeout:?})");
        let mut g = self.lock();

        let Some(index) = g.resolve(id) else {
            panic!("{id:?} does not refer to a live timeout");
        };

        let ticks = match timeout {
            Timeout::Forever => return,
            Timeout::NoWait => 1,
            Timeout::Ticks(ticks) => ticks.max(1),
            Timeout::AbsTicks(at) => {
                let now = g.curr_tick.wrapping_add(self.elapsed(&g) as u64);
                // A deadline in the past expires on the next tick
                (at.saturating_sub(now).min(Ticks::MAX as u64) as Ticks).max(1)
            }
        };

        assert!(!g.is_linked(index), "timeout is already linked");

        let elapsed = self.elapsed(&g) as Ticks;
        let cb = &mut g.pool[index];
        cb.dticks = ticks.saturating_add(elapsed);
        let old_callback = cb.callback.replace(callback);

        g.insert_timeout(index);

        // An in-progress `announce` reprograms the tick source when it's done
        if g.list_head.front() == Some(index) && g.announce_remaining == 0 {
            // The earliest deadline has changed
            let next = self.next_timeout(&g);
            log::trace!("set_timeout({next}, false)");
            self.port.set_timeout(next, false);
        }

        drop(g);
        drop(old_callback);
    }

    /// Unregister the timeout `id`.
    ///
    /// Returns [`AbortTimeoutError::NotFound`] if the timeout isn't pending,
    /// e.g., because it has just expired. Calling this twice is harmless.
    pub fn abort_timeout(&self, id: TimeoutId) -> Result<(), AbortTimeoutError> {
        log::trace!("abort_timeout({id:?})");
        let mut g = self.lock();

        let index = g.resolve(id).ok_or(AbortTimeoutError::NotFound)?;

        g.remove_timeout(index).map_err(|ItemError::NotLinked| {
            log::debug!("abort_timeout({id:?}): the timeout isn't pending");
            AbortTimeoutError::NotFound
        })
    }

    /// Get a flag indicating whether the timeout `id` is not pending.
    pub fn is_inactive(&self, id: TimeoutId) -> bool {
        let g = self.lock();
        g.resolve(id).map_or(true, |index| !g.is_linked(index))
    }

    /// Get the number of ticks until the timeout `id` expires. Returns `0` if
    /// the timeout isn't pending.
    pub fn time_remaining(&self, id: TimeoutId) -> Ticks {
        let g = self.lock();
        match g.resolve(id) {
            Some(index) if g.is_linked(index) => g
                .ticks_until(index)
                .saturating_sub(self.elapsed(&g) as Ticks)
                .max(0),
            _ => 0,
        }
    }

    /// Get the absolute tick at which the timeout `id` expires. Returns the
    /// last announced tick if the timeout isn't pending.
    pub fn timeout_expires(&self, id: TimeoutId) -> u64 {
        let g = self.lock();
        match g.resolve(id) {
            Some(index) if g.is_linked(index) => {
                g.curr_tick.wrapping_add(g.ticks_until(index) as u64)
            }
            _ => g.curr_tick,
        }
    }

    /// Get the number of ticks until the next deadline (a pending timeout or
    /// the end of the current time slice).
    ///
    /// Returns [`Config::max_wait`] if there is nothing to wait for.
    pub fn next_expiry(&self) -> i32 {
        let g = self.lock();
        self.next_timeout(&g)
    }

    /// Request a wake-up no later than `ticks` ticks from now, unless a
    /// timeout is going to wake the CPU sooner anyway.
    ///
    /// Used by the scheduler, e.g., when a new time slice begins or the CPU
    /// is about to idle.
    pub fn set_timeout_expiry(&self, ticks: i32, is_idle: bool) {
        log::trace!("set_timeout_expiry({ticks}, {is_idle})");
        let g = self.lock();

        let next_to = self.next_timeout(&g);
        let forever = next_to == TICKS_FOREVER_32;
        let sooner = forever || ticks <= next_to;
        let imminent = !forever && next_to <= 1;

        // If the next deadline is imminent, the tick source is already armed
        // for it; reprogramming would only delay the interrupt. With SMP,
        // another CPU may have programmed a later wake-up than `next_to`.
        if !imminent && (sooner || self.config.smp) {
            let ticks = if forever { ticks } else { ticks.min(next_to) };
            log::trace!("set_timeout({ticks}, {is_idle})");
            self.port.set_timeout(ticks, is_idle);
        }
    }
}

// Global Time Management
// ---------------------------------------------------------------------------

impl<P: Port> TimeoutEngine<P> {
    /// Announce that `ticks` ticks have elapsed.
    ///
    /// Called by the tick source (usually from its interrupt handler) with
    /// the engine lock released. Expired timeouts are unlinked and their
    /// callbacks invoked in expiration order; timeouts expiring at the same
    /// tick fire in the order they were added.
    pub fn announce(&self, ticks: i32) {
        log::trace!("announce({ticks})");
        debug_assert!(ticks >= 0, "announced a negative tick count");
        let ticks = ticks.max(0);

        self.port.time_slice(ticks);

        let mut g = self.lock();
        g.announce_remaining = ticks;

        while let Some(first) = g.list_head.front() {
            let dt = g.pool[first].dticks;
            if dt > g.announce_remaining as Ticks {
                break;
            }

            // `0 <= dt <= announce_remaining`, so this fits in `i32`
            g.curr_tick = g.curr_tick.wrapping_add(dt as u64);
            g.announce_remaining -= dt as i32;

            let cb = &mut g.pool[first];
            cb.dticks = 0;
            let id = TimeoutId {
                index: first,
                generation: cb.generation,
            };
            let callback = cb.callback.clone();

            // The successor's `dticks` is already relative to `curr_tick`
            g.list().pop_front();

            // Callbacks may call back into the engine, so release CPU Lock
            drop(g);
            log::trace!("{id:?} expired");
            if let Some(callback) = callback {
                callback(self, id);
            }
            g = self.lock();
        }

        let remaining = g.announce_remaining;
        if let Some(first) = g.list_head.front() {
            g.pool[first].dticks -= remaining as Ticks;
        }

        g.curr_tick = g.curr_tick.wrapping_add(remaining as u64);
        g.announce_remaining = 0;

        let next = self.next_timeout(&g);
        log::trace!("set_timeout({next}, false)");
        self.port.set_timeout(next, false);
    }

    /// Get the current tick count, including ticks that haven't been announced
    /// yet.
    pub fn tick_get(&self) -> u64 {
        let g = self.lock();
        g.curr_tick.wrapping_add(self.elapsed(&g) as u64)
    }

    /// Get the lower 32 bits of the current tick count.
    ///
    /// In a ticked configuration this only includes announced ticks; it's
    /// up to the caller to deal with the wrap-around.
    pub fn tick_get_32(&self) -> u32 {
        if self.config.tickless {
            self.tick_get() as u32
        } else {
            self.lock().curr_tick as u32
        }
    }

    /// Alias of [`Self::tick_get`].
    #[inline]
    pub fn uptime_ticks(&self) -> u64 {
        self.tick_get()
    }

    /// Get the time since boot in milliseconds, rounded down.
    pub fn uptime_ms(&self) -> u64 {
        self.config.ticks_to_ms_floor(self.tick_get())
    }

    /// Calculate the point in time at which `timeout` would end if it started
    /// now.
    pub fn timepoint_calc(&self, timeout: Timeout) -> Timepoint {
        match timeout {
            Timeout::Forever => Timepoint::FOREVER,
            Timeout::NoWait => Timepoint::NO_WAIT,
            Timeout::Ticks(ticks) => {
                Timepoint::from_tick(self.tick_get().saturating_add(ticks.max(1) as u64))
            }
            Timeout::AbsTicks(at) => Timepoint::from_tick(at),
        }
    }

    /// Calculate the relative timeout that ends at `timepoint`.
    ///
    /// Returns [`Timeout::NoWait`] if `timepoint` has already passed.
    pub fn timepoint_timeout(&self, timepoint: Timepoint) -> Timeout {
        if timepoint.is_forever() {
            return Timeout::Forever;
        }
        if timepoint == Timepoint::NO_WAIT {
            return Timeout::NoWait;
        }

        let now = self.tick_get();
        match timepoint.tick().saturating_sub(now) {
            0 => Timeout::NoWait,
            remaining => Timeout::Ticks(remaining.min(Ticks::MAX as u64) as Ticks),
        }
    }
}

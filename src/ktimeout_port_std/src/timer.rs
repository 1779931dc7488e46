//! A real-time tick source backed by a timer thread
use ktimeout::{PortTimeSlice, PortTimer, TimeoutEngine, TICKS_FOREVER};
use spin::Mutex as SpinMutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::cpu::impl_port_threading;

/// A tickless tick source that follows the host's monotonic clock.
///
/// The ticks are only announced when a deadline requested through
/// [`PortTimer::set_timeout`] is reached, which requires a running
/// [`TimerThread`].
#[derive(Debug)]
pub struct StdPort {
    origin: Instant,
    tick_period: Duration,

    /// The number of ticks announced so far, counted from `origin`
    announced: AtomicU64,

    /// The command channel to the running [`TimerThread`], if any
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
}

/// Stands in for deadlines that `Instant` can't represent
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug)]
enum TimerCmd {
    SetTimeout { at: Instant },
    /// Nothing to wait for
    Idle,
}

impl_port_threading!(StdPort);

impl PortTimeSlice for StdPort {}

impl StdPort {
    /// Construct a `StdPort` ticking at `ticks_per_sec` ticks per second.
    /// The tick count is zero at the time of the call.
    pub fn new(ticks_per_sec: u32) -> Self {
        assert!(ticks_per_sec != 0, "`ticks_per_sec` must not be zero");
        Self {
            origin: Instant::now(),
            tick_period: Duration::from_secs(1) / ticks_per_sec,
            announced: AtomicU64::new(0),
            timer_cmd_send: SpinMutex::new(None),
        }
    }

    /// Get the number of whole ticks since `origin`.
    fn now_ticks(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos() / self.tick_period.as_nanos().max(1);
        nanos.min(u64::MAX as u128) as u64
    }

    /// Get the time at which the tick count reaches `tick`. A time too far
    /// to represent is replaced with [`FAR_FUTURE`] from now.
    fn tick_instant(&self, tick: u64) -> Option<Instant> {
        let nanos = self.tick_period.as_nanos().saturating_mul(tick as u128);
        let offset = Duration::new(
            u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX),
            (nanos % 1_000_000_000) as u32,
        );
        self.origin
            .checked_add(offset)
            .or_else(|| Instant::now().checked_add(FAR_FUTURE))
    }

    /// Announce the ticks that have passed since the last announcement.
    fn announce_elapsed(&self, engine: &TimeoutEngine<Self>) {
        let now = self.now_ticks();
        let mut last = self.announced.load(Ordering::Relaxed);

        // `announce` takes at most `i32::MAX` ticks at once
        loop {
            let ticks = now.saturating_sub(last).min(i32::MAX as u64);
            last += ticks;

            // Only the timer thread updates `announced`
            self.announced.store(last, Ordering::Relaxed);

            log::trace!("timer: announcing {ticks} tick(s)");
            engine.announce(ticks as i32);

            if last >= now {
                break;
            }
        }
    }

    fn send(&self, cmd: TimerCmd) {
        if let Some(timer_cmd_send) = &*self.timer_cmd_send.lock() {
            // The timer thread only exits after the sender is dropped
            let _ = timer_cmd_send.send(cmd);
        } else {
            log::debug!("{cmd:?} ignored: the timer thread isn't running");
        }
    }
}

impl PortTimer for StdPort {
    fn set_timeout(&self, ticks: i32, is_idle: bool) {
        log::trace!("set_timeout({ticks}, {is_idle})");

        if ticks as i64 == TICKS_FOREVER {
            self.send(TimerCmd::Idle);
            return;
        }

        // `ticks` is counted from the current tick, which includes the ticks
        // that haven't been announced yet
        let current = self.announced.load(Ordering::Relaxed) + self.elapsed() as u64;
        let cmd = match self.tick_instant(current + ticks.max(0) as u64) {
            Some(at) => TimerCmd::SetTimeout { at },
            None => TimerCmd::Idle,
        };
        self.send(cmd);
    }

    /// Saturates at `u32::MAX`, which is only reachable if the timer thread
    /// isn't running.
    fn elapsed(&self) -> u32 {
        let ticks = self
            .now_ticks()
            .saturating_sub(self.announced.load(Ordering::Relaxed));
        ticks.min(u32::MAX as u64) as u32
    }
}

/// The thread that drives [`StdPort`] by announcing ticks when a requested
/// deadline is reached.
///
/// The thread stops when the `TimerThread` is dropped or [`Self::stop`] is
/// called.
#[derive(Debug)]
pub struct TimerThread {
    engine: Arc<TimeoutEngine<StdPort>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    /// Start a timer thread for `engine`.
    ///
    /// # Panics
    ///
    /// Panics if a timer thread is already running for `engine`.
    pub fn start(engine: Arc<TimeoutEngine<StdPort>>) -> Self {
        let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();

        {
            let mut slot = engine.port().timer_cmd_send.lock();
            assert!(slot.is_none(), "the timer thread is already running");
            *slot = Some(timer_cmd_send);
        }

        log::trace!("starting the timer thread");
        let join_handle = std::thread::spawn({
            let engine = Arc::clone(&engine);
            move || {
                // Timeouts may have been registered before we started.
                // Announcing right away programs the first deadline.
                let mut next_deadline = Some(Instant::now());
                loop {
                    let recv_result = if let Some(next_deadline) = next_deadline {
                        timer_cmd_recv
                            .recv_timeout(next_deadline.saturating_duration_since(Instant::now()))
                    } else {
                        timer_cmd_recv
                            .recv()
                            .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
                    };
                    match recv_result {
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            next_deadline = None;
                            // This reprograms the deadline through the
                            // channel we are receiving from
                            engine.port().announce_elapsed(&engine);
                        }
                        Ok(TimerCmd::SetTimeout { at }) => {
                            next_deadline = Some(at);
                        }
                        Ok(TimerCmd::Idle) => {
                            next_deadline = None;
                        }
                    }
                }
            }
        });

        Self {
            engine,
            join_handle: Some(join_handle),
        }
    }

    /// Get the engine driven by this thread.
    pub fn engine(&self) -> &Arc<TimeoutEngine<StdPort>> {
        &self.engine
    }

    /// Stop the timer thread and wait for it to exit. Ticks that have passed
    /// are still reported as unannounced ticks.
    ///
    /// A panic in a timeout callback is propagated from here.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        // `timer_cmd_recv.recv` will return `Err(_)` when we drop the
        // corresponding sender
        log::trace!("stopping the timer thread");
        *self.engine.port().timer_cmd_send.lock() = None;
        let result = join_handle.join();
        log::trace!("stopped the timer thread");

        if let Err(e) = result {
            if !std::thread::panicking() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

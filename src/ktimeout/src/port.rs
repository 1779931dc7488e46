//! The interface between the engine and the platform it runs on

/// Opaque value returned by [`PortThreading::enter_cpu_lock`] and handed back
/// to [`PortThreading::leave_cpu_lock`]. Usually the previous interrupt mask.
pub type IrqKey = usize;

/// CPU identification and local interrupt masking.
///
/// # Safety
///
/// [`cpu_id`] must return a value that is unique among all execution contexts
/// that can run simultaneously, and it must not change while the engine lock
/// is held. While local interrupts are masked by `enter_cpu_lock`, no
/// interrupt handler that calls into the engine may preempt the current
/// context on the same CPU.
///
/// [`cpu_id`]: Self::cpu_id
pub unsafe trait PortThreading {
    /// Get the identifier of the current CPU.
    fn cpu_id(&self) -> usize;

    /// Mask local interrupts and return the previous state.
    ///
    /// Calls may be nested; each call is paired with one `leave_cpu_lock`
    /// that receives the returned key.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the engine lock.
    unsafe fn enter_cpu_lock(&self) -> IrqKey;

    /// Restore the interrupt state saved by the matching `enter_cpu_lock`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the engine lock, with the key returned by
    /// the matching `enter_cpu_lock` call.
    unsafe fn leave_cpu_lock(&self, key: IrqKey);
}

/// The hardware tick source.
pub trait PortTimer {
    /// Arrange for [`TimeoutEngine::announce`] to be called no later than
    /// `ticks` ticks from now.
    ///
    /// `ticks` is [`TICKS_FOREVER`]` as i32` if there is nothing to wait for.
    /// `is_idle` indicates that the CPU is about to idle, which allows the
    /// tick source to suppress ticks more aggressively.
    ///
    /// Precondition: the engine lock is held. This method must not call into
    /// the engine.
    ///
    /// [`TimeoutEngine::announce`]: crate::TimeoutEngine::announce
    /// [`TICKS_FOREVER`]: crate::TICKS_FOREVER
    fn set_timeout(&self, ticks: i32, is_idle: bool);

    /// Get the number of ticks that have elapsed since the last call to
    /// [`TimeoutEngine::announce`] but haven't been announced yet.
    ///
    /// Tick sources that announce every tick can return `0`.
    ///
    /// [`TimeoutEngine::announce`]: crate::TimeoutEngine::announce
    fn elapsed(&self) -> u32;
}

/// Time-slice accounting, owned by the scheduler.
///
/// The default implementation describes a system with time slicing disabled.
pub trait PortTimeSlice {
    /// Called at the beginning of [`TimeoutEngine::announce`] (with the engine
    /// lock released) so that the scheduler can charge `ticks` to the running
    /// thread.
    ///
    /// [`TimeoutEngine::announce`]: crate::TimeoutEngine::announce
    fn time_slice(&self, ticks: i32) {
        let _ = ticks;
    }

    /// Get the number of ticks left in the time slice of the thread running
    /// on `cpu_id`, or `0` if that thread isn't time-sliced.
    ///
    /// Precondition: the engine lock is held.
    fn slice_ticks(&self, cpu_id: usize) -> i32 {
        let _ = cpu_id;
        0
    }
}

/// Everything a platform implements to host [`TimeoutEngine`].
///
/// [`TimeoutEngine`]: crate::TimeoutEngine
pub trait Port: PortThreading + PortTimer + PortTimeSlice + Send + Sync + 'static {}
impl<T: PortThreading + PortTimer + PortTimeSlice + Send + Sync + 'static> Port for T {}

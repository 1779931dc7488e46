//! Emulation of per-CPU state on top of host threads
//!
//! Every host thread poses as a separate CPU. Masking "local interrupts" only
//! marks the current thread; the hosted tick sources never preempt a thread,
//! so the mask is only used to validate the engine's locking discipline.
use ktimeout::IrqKey;
use std::{
    cell::Cell,
    sync::atomic::{AtomicUsize, Ordering},
};

static NEXT_CPU_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The CPU ID of the current thread. Assigned on first use.
    static CPU_ID: usize = {
        let id = NEXT_CPU_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("thread {:?} is CPU {id}", std::thread::current().id());
        id
    };

    static CPU_LOCK: Cell<bool> = Cell::new(false);
}

/// Get the CPU ID assigned to the current thread.
pub fn current_cpu_id() -> usize {
    CPU_ID.with(|id| *id)
}

/// Get a flag indicating whether the current thread has masked its local
/// interrupts, i.e., it's holding an engine lock.
pub fn is_cpu_lock_active() -> bool {
    CPU_LOCK.with(Cell::get)
}

pub(crate) fn enter_cpu_lock() -> IrqKey {
    CPU_LOCK.with(|x| x.replace(true)) as IrqKey
}

pub(crate) fn leave_cpu_lock(key: IrqKey) {
    CPU_LOCK.with(|x| x.set(key != 0));
}

/// Implement `PortThreading` for a hosted port type.
macro_rules! impl_port_threading {
    ($Ty:ty) => {
        // Safety: Every host thread gets a unique CPU ID, and the hosted tick
        // sources never preempt a thread
        unsafe impl ::ktimeout::PortThreading for $Ty {
            #[inline]
            fn cpu_id(&self) -> usize {
                $crate::cpu::current_cpu_id()
            }

            #[inline]
            unsafe fn enter_cpu_lock(&self) -> ::ktimeout::IrqKey {
                $crate::cpu::enter_cpu_lock()
            }

            #[inline]
            unsafe fn leave_cpu_lock(&self, key: ::ktimeout::IrqKey) {
                $crate::cpu::leave_cpu_lock(key)
            }
        }
    };
}
pub(crate) use impl_port_threading;

//! Engine state locking mechanism
//!
//! The engine state is protected by a spin lock that masks local interrupts
//! while held (*CPU Lock*). Holding it from a thread prevents the tick
//! interrupt on the same CPU from observing a half-updated timeout list;
//! spinning prevents other CPUs from doing the same.
use core::{fmt, mem::ManuallyDrop, ops};
#[cfg(feature = "spin_validate")]
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::port::{IrqKey, PortThreading};

/// Value of [`CpuLockCell::owner`] indicating the lock is free.
#[cfg(feature = "spin_validate")]
const NO_OWNER: usize = 0;

/// Cell type that can be accessed by acquiring CPU Lock.
pub(crate) struct CpuLockCell<T> {
    inner: spin::Mutex<T>,

    /// `cpu_id + 1` of the CPU currently holding the lock, or [`NO_OWNER`].
    #[cfg(feature = "spin_validate")]
    owner: AtomicUsize,
}

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self {
            inner: spin::Mutex::new(x),
            #[cfg(feature = "spin_validate")]
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Enter CPU Lock and get an RAII guard.
    ///
    /// Spins while another CPU holds the lock. With `spin_validate`, panics
    /// if the current CPU already holds it; otherwise that would deadlock.
    pub(crate) fn lock<'a, Port: PortThreading>(
        &'a self,
        port: &'a Port,
    ) -> CpuLockGuard<'a, Port, T> {
        // Safety: Paired with `leave_cpu_lock` in `CpuLockGuard::drop`
        let key = unsafe { port.enter_cpu_lock() };

        #[cfg(feature = "spin_validate")]
        let owner = port.cpu_id() + 1;

        // Another CPU can't store our ID, so a relaxed load is enough to
        // detect our own acquisition
        #[cfg(feature = "spin_validate")]
        if self.owner.load(Ordering::Relaxed) == owner {
            // Don't leave interrupts masked on the way out
            // Safety: Paired with `enter_cpu_lock` above
            unsafe { port.leave_cpu_lock(key) };
            panic!("recursive spinlock acquisition on CPU {}", owner - 1);
        }

        let guard = self.inner.lock();

        #[cfg(feature = "spin_validate")]
        self.owner.store(owner, Ordering::Relaxed);

        CpuLockGuard {
            cell: self,
            port,
            guard: ManuallyDrop::new(guard),
            key,
        }
    }

    /// Get a flag indicating whether any CPU holds the lock.
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: fmt::Debug> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Don't spin here; the formatter might be running inside CPU Lock
        if let Some(inner) = self.inner.try_lock() {
            f.write_str("CpuLockCell(")?;
            inner.fmt(f)?;
            f.write_str(")")
        } else {
            f.write_str("CpuLockCell(< locked >)")
        }
    }
}

/// RAII guard for a CPU Lock state.
pub(crate) struct CpuLockGuard<'a, Port: PortThreading, T> {
    #[cfg_attr(not(feature = "spin_validate"), allow(dead_code))]
    cell: &'a CpuLockCell<T>,
    port: &'a Port,
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    key: IrqKey,
}

impl<Port: PortThreading, T> Drop for CpuLockGuard<'_, Port, T> {
    fn drop(&mut self) {
        #[cfg(feature = "spin_validate")]
        {
            let owner = self.port.cpu_id() + 1;
            let actual = self.cell.owner.swap(NO_OWNER, Ordering::Relaxed);
            assert_eq!(
                actual, owner,
                "spinlock released by a CPU that doesn't hold it"
            );
        }

        // Release the spin lock before unmasking interrupts, or an interrupt
        // handler taking the lock on this CPU would spin forever
        // Safety: `self.guard` is not used after this point
        unsafe { ManuallyDrop::drop(&mut self.guard) };

        // Safety: Paired with `enter_cpu_lock` in `CpuLockCell::lock`
        unsafe { self.port.leave_cpu_lock(self.key) };
    }
}

impl<Port: PortThreading, T> ops::Deref for CpuLockGuard<'_, Port, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<Port: PortThreading, T> ops::DerefMut for CpuLockGuard<'_, Port, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// A single-CPU port that tracks the interrupt mask.
    struct MaskPort {
        masked: Cell<bool>,
        enter_count: Cell<usize>,
    }

    unsafe impl PortThreading for MaskPort {
        fn cpu_id(&self) -> usize {
            0
        }

        unsafe fn enter_cpu_lock(&self) -> IrqKey {
            self.enter_count.set(self.enter_count.get() + 1);
            self.masked.replace(true) as IrqKey
        }

        unsafe fn leave_cpu_lock(&self, key: IrqKey) {
            self.masked.set(key != 0);
        }
    }

    fn port() -> MaskPort {
        MaskPort {
            masked: Cell::new(false),
            enter_count: Cell::new(0),
        }
    }

    #[test]
    fn lock_masks_interrupts() {
        let port = port();
        let cell = CpuLockCell::new(1u32);

        {
            let mut guard = cell.lock(&port);
            assert!(port.masked.get());
            assert!(cell.is_locked());
            *guard += 1;
        }

        assert!(!port.masked.get());
        assert!(!cell.is_locked());
        assert_eq!(*cell.lock(&port), 2);
        assert_eq!(port.enter_count.get(), 2);
    }

    #[test]
    fn lock_restores_outer_mask() {
        let port = port();
        let cell = CpuLockCell::new(());

        // Interrupts were already masked by someone else
        // Safety: Test code, paired below
        let key = unsafe { port.enter_cpu_lock() };
        drop(cell.lock(&port));
        assert!(port.masked.get());
        unsafe { port.leave_cpu_lock(key) };
        assert!(!port.masked.get());
    }

    #[test]
    fn debug_does_not_spin() {
        let port = port();
        let cell = CpuLockCell::new(42u32);
        assert_eq!(format!("{:?}", cell), "CpuLockCell(42)");

        let _guard = cell.lock(&port);
        assert_eq!(format!("{:?}", cell), "CpuLockCell(< locked >)");
    }

    #[cfg(feature = "spin_validate")]
    #[test]
    #[should_panic(expected = "recursive spinlock acquisition on CPU 0")]
    fn recursive_lock_panics() {
        let port = port();
        let cell = CpuLockCell::new(());
        let _outer = cell.lock(&port);
        let _inner = cell.lock(&port);
    }

    #[cfg(feature = "spin_validate")]
    #[test]
    fn recursive_lock_leaves_interrupt_state_balanced() {
        let port = port();
        let cell = CpuLockCell::new(());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _outer = cell.lock(&port);
            let _inner = cell.lock(&port);
        }));
        assert!(result.is_err());
        assert!(!port.masked.get());
        assert!(!cell.is_locked());
    }
}

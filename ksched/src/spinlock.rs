//! Ticket spinlock implementation in the spirit of [spin](https://crates.io/crates/spin).
use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop as cpu_relax;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicUsize, Ordering};

/// This type provides MUTual EXclusion based on spinning.
///
/// Waiters take a ticket and spin until the owner counter reaches it, so the
/// lock is FIFO-fair under contention.
///
/// The behaviour is similar to the namesake in `std::sync`, except that the
/// lock is never poisoned on panic.
///
/// # Simple examples
///
/// ```
/// use ksched::sync::Spinlock;
/// let spin_mutex = Spinlock::new(0);
///
/// // Modify the data
/// {
///     let mut data = spin_mutex.lock();
///     *data = 2;
/// }
///
/// // Read the data
/// let answer = {
///     let data = spin_mutex.lock();
///     *data
/// };
///
/// assert_eq!(answer, 2);
/// ```
///
/// # Thread-safety example
///
/// ```
/// use ksched::sync::Spinlock;
/// use std::sync::{Arc, Barrier};
///
/// let numthreads = 50;
/// let spin_mutex = Arc::new(Spinlock::new(0));
///
/// // We use a barrier to ensure the readout happens after all writing
/// let barrier = Arc::new(Barrier::new(numthreads + 1));
///
/// for _ in 0..numthreads {
///     let my_barrier = barrier.clone();
///     let my_lock = spin_mutex.clone();
///     std::thread::spawn(move || {
///         let mut guard = my_lock.lock();
///         *guard += 1;
///
///         // Release the lock to prevent a deadlock
///         drop(guard);
///         my_barrier.wait();
///     });
/// }
///
/// barrier.wait();
///
/// let answer = { *spin_mutex.lock() };
/// assert_eq!(answer, numthreads);
/// ```
pub struct Spinlock<T: ?Sized> {
    next: AtomicUsize,
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

/// A guard to which the protected data can be accessed
///
/// When the guard falls out of scope it will release the lock.
pub struct SpinlockGuard<'a, T: ?Sized + 'a>(&'a Spinlock<T>);

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new spinlock wrapping the supplied data.
    ///
    /// May be used statically:
    ///
    /// ```
    /// use ksched::sync::Spinlock;
    ///
    /// static MUTEX: Spinlock<()> = Spinlock::new(());
    ///
    /// fn demo() {
    ///     let lock = MUTEX.lock();
    ///     // do something with lock
    ///     drop(lock);
    /// }
    /// ```
    pub const fn new(user_data: T) -> Spinlock<T> {
        Spinlock {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(user_data),
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        // We know statically that there are no outstanding references to
        // `self` so there's no need to lock.
        let Spinlock { data, .. } = self;
        data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the spinlock without a guard.
    ///
    /// This is useful with [release](`Self::release`) when RAII does not fit.
    pub fn acquire(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            cpu_relax();
        }
    }

    /// Locks the spinlock and returns a guard.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    ///
    /// ```
    /// use ksched::sync::Spinlock;
    ///
    /// let mylock = Spinlock::new(0);
    /// {
    ///     let mut data = mylock.lock();
    ///     // The lock is now locked and the data can be accessed
    ///     *data += 1;
    ///     // The lock is implicitly dropped
    /// }
    /// ```
    pub fn lock(&self) -> SpinlockGuard<T> {
        self.acquire();
        SpinlockGuard(self)
    }

    /// Force unlock the spinlock.
    ///
    /// # Safety
    ///
    /// This is *extremely* unsafe if the lock is not held by the current
    /// thread. However, this can be useful in some instances for exposing
    /// the lock to code that doesn't know how to deal with RAII.
    pub unsafe fn release(&self) {
        self.owner.fetch_add(1, Ordering::Release);
    }

    /// Tries to lock the spinlock. If it is already locked, it will return
    /// None. Otherwise it returns a guard within Some.
    pub fn try_lock(&self) -> Option<SpinlockGuard<T>> {
        let cur = self.owner.load(Ordering::Relaxed);
        if self
            .next
            .compare_exchange(cur, cur.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard(self))
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the lock mutably, no actual locking needs to
    /// take place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Spinlock {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "Spinlock {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + Default> Default for Spinlock<T> {
    fn default() -> Spinlock<T> {
        Spinlock::new(Default::default())
    }
}

impl<'a, T: ?Sized> SpinlockGuard<'a, T> {
    /// Returns a reference to the spinlock a guard came from.
    pub fn source(self: &SpinlockGuard<'a, T>) -> &'a Spinlock<T> {
        self.0
    }
}

impl<'a, T: ?Sized> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.0.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.0.data.get() }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for SpinlockGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized> Drop for SpinlockGuard<'a, T> {
    /// The dropping of the SpinlockGuard will release the lock it was created from.
    fn drop(&mut self) {
        unsafe {
            self.0.release();
        }
    }
}

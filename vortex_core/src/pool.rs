//! Thread-local-cached object pool for reusable scratch allocations.
//!
//! Worker and tracer threads drain requests in batches; the batch vectors
//! are recycled through this pool so the steady state allocates nothing.
//!
//! # Design
//!
//! Each thread keeps up to [`LOCAL_CAP`] instances in a thread-local free
//! list. Releases beyond that spill into a bounded global bag shared by all
//! threads; releases beyond the bag's capacity drop the object.
//!
//! # Thread Safety
//!
//! The local free list is only touched by its owning thread; the spill bag
//! is guarded by a mutex taken only on local-cache miss or overflow.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use thread_local::ThreadLocal;

/// Maximum instances cached per thread.
pub const LOCAL_CAP: usize = 8;

/// Default capacity of the global spill bag.
pub const DEFAULT_OVERFLOW_CAP: usize = 64;

/// Pool of reusable `T` instances with per-thread caching.
pub struct ObjectPool<T: Send + 'static> {
    local: ThreadLocal<RefCell<Vec<T>>>,
    overflow: Mutex<Vec<T>>,
    overflow_cap: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Create a pool that constructs fresh instances with `make`.
    pub fn new(make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_overflow_cap(DEFAULT_OVERFLOW_CAP, make)
    }

    /// Create a pool with an explicit spill-bag capacity.
    pub fn with_overflow_cap(
        overflow_cap: usize,
        make: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            local: ThreadLocal::new(),
            overflow: Mutex::new(Vec::new()),
            overflow_cap,
            make: Box::new(make),
        }
    }

    /// Take an instance: thread-local cache first, then the spill bag,
    /// then the factory.
    pub fn acquire(&self) -> Pooled<'_, T> {
        let obj = self
            .local
            .get_or(|| RefCell::new(Vec::with_capacity(LOCAL_CAP)))
            .borrow_mut()
            .pop()
            .or_else(|| self.overflow.lock().pop())
            .unwrap_or_else(|| (self.make)());
        Pooled {
            pool: self,
            obj: Some(obj),
        }
    }

    /// Number of instances in the global spill bag.
    pub fn overflow_len(&self) -> usize {
        self.overflow.lock().len()
    }

    fn release(&self, obj: T) {
        let local = self
            .local
            .get_or(|| RefCell::new(Vec::with_capacity(LOCAL_CAP)));
        let mut cache = local.borrow_mut();
        if cache.len() < LOCAL_CAP {
            cache.push(obj);
            return;
        }
        drop(cache);
        let mut bag = self.overflow.lock();
        if bag.len() < self.overflow_cap {
            bag.push(obj);
        }
        // Past both bounds the object is simply dropped.
    }
}

/// RAII handle returning the object to its pool on drop.
pub struct Pooled<'a, T: Send + 'static> {
    pool: &'a ObjectPool<T>,
    obj: Option<T>,
}

impl<T: Send + 'static> Pooled<'_, T> {
    /// Detach the object from the pool; it will not be recycled.
    pub fn detach(mut self) -> T {
        self.obj.take().expect("pooled object already detached")
    }
}

impl<T: Send + 'static> Deref for Pooled<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.obj.as_ref().expect("pooled object already detached")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("pooled object already detached")
    }
}

impl<T: Send + 'static> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            self.pool.release(obj);
        }
    }
}

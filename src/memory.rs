use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, OnceLock, PoisonError, RwLock},
};

/// A shared pool of reusable coefficient buffers.  Clones refer to the same
/// pool.
#[derive(Clone, Default)]
pub struct MemoryPool {
    free: Arc<Mutex<Vec<Vec<u64>>>>,
}

/// A zero-initialized buffer that goes back to its pool when dropped.
pub struct PoolBuffer {
    data: Vec<u64>,
    pool: MemoryPool,
}

static GLOBAL_POOL: OnceLock<RwLock<MemoryPool>> = OnceLock::new();

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn global_slot() -> &'static RwLock<MemoryPool> {
        GLOBAL_POOL.get_or_init(|| RwLock::new(MemoryPool::new()))
    }

    /// The pool picked up by evaluators created without an explicit one.
    pub fn global() -> MemoryPool {
        Self::global_slot()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps the global pool.  Existing holders keep using the previous one.
    pub fn set_global(pool: MemoryPool) {
        *Self::global_slot()
            .write()
            .unwrap_or_else(PoisonError::into_inner) = pool;
    }

    pub fn allocate(&self, len: usize) -> PoolBuffer {
        let recycled = {
            let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
            match free.iter().position(|buffer| buffer.capacity() >= len) {
                Some(index) => Some(free.swap_remove(index)),
                None => free.pop(),
            }
        };
        let mut data = recycled.unwrap_or_default();
        data.clear();
        data.resize(len, 0);
        PoolBuffer {
            data,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ptr_eq(&self, other: &MemoryPool) -> bool {
        Arc::ptr_eq(&self.free, &other.free)
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("free", &self.free_count())
            .finish()
    }
}

impl Deref for PoolBuffer {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u64] {
        &mut self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryPool;

    #[test]
    fn buffers_are_recycled_zeroed() {
        let pool = MemoryPool::new();
        {
            let mut buffer = pool.allocate(16);
            buffer[3] = 42;
            assert_eq!(pool.free_count(), 0);
        }
        assert_eq!(pool.free_count(), 1);
        let buffer = pool.allocate(8);
        assert_eq!(buffer.len(), 8);
        assert!(buffer.iter().all(|&x| x == 0));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn buffers_return_on_early_exit() {
        fn fails(pool: &MemoryPool) -> Result<(), ()> {
            let _a = pool.allocate(4);
            let _b = pool.allocate(4);
            Err(())
        }
        let pool = MemoryPool::new();
        assert!(fails(&pool).is_err());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn swapping_global_keeps_existing_handles() {
        let before = MemoryPool::global();
        let replacement = MemoryPool::new();
        MemoryPool::set_global(replacement.clone());
        assert!(MemoryPool::global().ptr_eq(&replacement));
        assert!(!before.ptr_eq(&replacement));
        MemoryPool::set_global(before);
    }
}

use std::sync::Mutex;

/// An object that can be stored in a [`Pool`].
///
/// `reset` must return the object to its pristine state so that a later
/// `acquire` observes no data from a previous request.
pub trait Poolable: Default + Send {
    fn reset(&mut self);
}

impl Poolable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// A simple free-list pool that recycles objects to reduce allocation churn
/// on the per-request hot path.
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<T>>,
}

impl<T: Poolable> Pool<T> {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns a reset object from the pool, or a fresh default.
    pub fn acquire(&self) -> T {
        self.free
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Returns an object to the pool. The object is reset before it becomes
    /// visible to other acquirers.
    pub fn release(&self, mut value: T) {
        value.reset();
        self.free.lock().expect("pool lock poisoned").push(value);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool: Pool<Vec<u8>> = Pool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        pool.release(buf);
        assert_eq!(pool.len(), 1);

        // The recycled buffer must come back empty.
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_acquire_from_empty_pool() {
        let pool: Pool<Vec<u8>> = Pool::new();
        let buf = pool.acquire();
        assert!(buf.is_empty());
    }
}

//! Bounded object pools.
//!
//! Each pool is a lock-free `ArrayQueue` of idle objects. `get` pops an idle
//! object (or builds a fresh one) and resets it before handing it out, so a
//! caller never observes state left behind by a previous exchange. `put`
//! returns an object; when the pool is already full the object is dropped.

use crossbeam::queue::ArrayQueue;

/// Size of the buffers used to relay tunnel bytes.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle objects kept per pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Clears every field of a pooled object back to its empty state.
pub trait Reset {
    fn reset(&mut self);
}

impl<T: Reset + ?Sized> Reset for Box<T> {
    fn reset(&mut self) {
        (**self).reset();
    }
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
        self.resize(BUFFER_SIZE, 0);
    }
}

pub struct Pool<T> {
    idle: ArrayQueue<T>,
    make: fn() -> T,
}

impl<T: Reset> Pool<T> {
    pub fn new(capacity: usize, make: fn() -> T) -> Self {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
            make,
        }
    }

    pub fn get(&self) -> T {
        let mut item = self.idle.pop().unwrap_or_else(self.make);
        item.reset();
        item
    }

    pub fn put(&self, item: T) {
        // A full pool drops the object.
        let _ = self.idle.push(item);
    }

    /// Number of idle objects currently held.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}

/// Pool of relay buffers, each exactly [`BUFFER_SIZE`] bytes long.
pub type BufferPool = Pool<Vec<u8>>;

pub fn buffer_pool(capacity: usize) -> BufferPool {
    Pool::new(capacity, || vec![0; BUFFER_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scratch {
        name: String,
        hits: u32,
    }

    impl Reset for Scratch {
        fn reset(&mut self) {
            self.name.clear();
            self.hits = 0;
        }
    }

    #[test]
    fn test_get_resets_recycled_object() {
        let pool: Pool<Scratch> = Pool::new(4, Scratch::default);
        let mut item = pool.get();
        item.name.push_str("example.com");
        item.hits = 7;
        pool.put(item);
        assert_eq!(pool.idle(), 1);

        let item = pool.get();
        assert!(item.name.is_empty());
        assert_eq!(item.hits, 0);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_full_pool_drops_returned_object() {
        let pool: Pool<Scratch> = Pool::new(1, Scratch::default);
        pool.put(Scratch::default());
        pool.put(Scratch::default());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let pool: Pool<Scratch> = Pool::new(0, Scratch::default);
        pool.put(Scratch::default());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_buffer_is_restored_to_full_size() {
        let pool = buffer_pool(2);
        let mut buf = pool.get();
        assert_eq!(buf.len(), BUFFER_SIZE);
        buf[0] = 0xff;
        buf.truncate(10);
        pool.put(buf);

        let buf = pool.get();
        assert_eq!(buf.len(), BUFFER_SIZE);
        assert_eq!(buf[0], 0);
    }
}

pub mod byte_pool;
pub mod int_pool;
pub mod queue;

pub use byte_pool::BytePool;
pub use int_pool::IntPool;
pub use queue::ByteQueue;

use std::sync::Mutex;

/// Process-wide free list. Connections borrow their ConnBuffer and
/// ReplyWriter from pools of this shape and return them on close.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Pool<T> {
    pub const fn new() -> Pool<T> {
        Pool {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Pops a pooled item, or builds a fresh one with `init`.
    pub fn get(&self, init: impl FnOnce() -> T) -> T {
        self.items.lock().unwrap().pop().unwrap_or_else(init)
    }

    pub fn put(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_prefers_pooled_items() {
        let pool: Pool<Vec<u8>> = Pool::new();
        pool.put(vec![1, 2, 3]);

        let item = pool.get(Vec::new);
        assert_eq!(item, vec![1, 2, 3]);

        let fresh = pool.get(Vec::new);
        assert!(fresh.is_empty());
    }
}

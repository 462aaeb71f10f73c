/// Baseline number of ints the scratch grows by.
const INT_SLAB: usize = 16 * 1024;

const RECLAIM_AFTER_RESETS: u32 = 100;

/// Scratch storage for argument offset/length pairs recorded while parsing
/// one batch of commands. The caller resets it after every parse call;
/// every 100 resets the backing storage is released.
///
/// Not thread-safe: exactly one ConnBuffer owns each pool.
pub struct IntPool {
    buf: Vec<usize>,
    resets: u32,
}

impl IntPool {
    pub fn new() -> IntPool {
        IntPool {
            buf: Vec::new(),
            resets: 0,
        }
    }

    pub fn push(&mut self, v: usize) {
        if self.buf.capacity() == 0 {
            self.buf.reserve(INT_SLAB);
        }
        self.buf.push(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.resets += 1;
        if self.resets >= RECLAIM_AFTER_RESETS {
            self.buf = Vec::new();
            self.resets = 0;
        }
    }
}

impl Default for IntPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_resets() {
        let mut pool = IntPool::new();
        pool.push(7);
        pool.push(4);
        assert_eq!(pool.as_slice(), &[7, 4]);

        pool.reset();
        assert!(pool.is_empty());
        assert!(pool.buf.capacity() >= INT_SLAB);
    }

    #[test]
    fn periodic_reset_releases_storage() {
        let mut pool = IntPool::new();
        pool.push(1);
        for _ in 0..RECLAIM_AFTER_RESETS {
            pool.reset();
        }
        assert_eq!(pool.buf.capacity(), 0);
    }
}

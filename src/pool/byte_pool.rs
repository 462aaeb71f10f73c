use bytes::{Bytes, BytesMut};

/// Size of one parse scratch slab.
pub const SLAB_SIZE: usize = 64 * 1024;

const RECLAIM_AFTER_RESETS: u32 = 1000;

/// Per-connection pool of parse scratch slabs.
///
/// `get` hands out an empty slab, `put` reclaims a frozen slab once every
/// `Bytes` view into it has been dropped, and `reset` marks the end of a
/// parse/drain cycle. Every 1000 cycles the spare slabs are released so a
/// burst of traffic does not pin memory for the life of the connection.
///
/// Not thread-safe: exactly one ConnBuffer owns each pool.
pub struct BytePool {
    spares: Vec<BytesMut>,
    resets: u32,
}

impl BytePool {
    pub fn new() -> BytePool {
        BytePool {
            spares: Vec::new(),
            resets: 0,
        }
    }

    /// Returns an empty slab with `SLAB_SIZE` capacity, recycled when one
    /// is available.
    pub fn get(&mut self) -> BytesMut {
        self.spares
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(SLAB_SIZE))
    }

    /// Hands a slab back. Reclaims it only if no argument view into it is
    /// still alive and it has not grown past the slab size; otherwise the
    /// memory is freed when the last view goes away.
    pub fn put(&mut self, buf: Bytes) {
        if let Ok(mut buf) = buf.try_into_mut() {
            if buf.capacity() <= SLAB_SIZE {
                buf.clear();
                self.spares.push(buf);
            }
        }
    }

    pub fn reset(&mut self) {
        self.resets += 1;
        if self.resets >= RECLAIM_AFTER_RESETS {
            self.spares = Vec::new();
            self.resets = 0;
        }
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaims_slab_once_views_are_dropped() {
        let mut pool = BytePool::new();
        let mut slab = pool.get();
        slab.extend_from_slice(b"hello");
        let ptr = slab.as_ptr() as usize;

        pool.put(slab.freeze());

        let again = pool.get();
        assert_eq!(again.as_ptr() as usize, ptr);
        assert!(again.is_empty());
        assert!(again.capacity() >= SLAB_SIZE);
    }

    #[test]
    fn shared_slab_is_not_reclaimed() {
        let mut pool = BytePool::new();
        let mut slab = pool.get();
        slab.extend_from_slice(b"hello");
        let frozen = slab.freeze();
        let view = frozen.slice(0..3);

        pool.put(frozen);
        assert!(pool.spares.is_empty());
        assert_eq!(&view[..], b"hel");
    }

    #[test]
    fn oversized_buffers_are_dropped() {
        let mut pool = BytePool::new();
        let mut big = BytesMut::with_capacity(SLAB_SIZE * 2);
        big.extend_from_slice(b"x");

        pool.put(big.freeze());
        assert!(pool.spares.is_empty());
    }

    #[test]
    fn periodic_reset_releases_spares() {
        let mut pool = BytePool::new();
        pool.put(pool_slab());
        assert_eq!(pool.spares.len(), 1);

        for _ in 0..RECLAIM_AFTER_RESETS {
            pool.reset();
        }
        assert!(pool.spares.is_empty());
    }

    fn pool_slab() -> Bytes {
        let mut slab = BytesMut::with_capacity(SLAB_SIZE);
        slab.extend_from_slice(b"x");
        slab.freeze()
    }
}

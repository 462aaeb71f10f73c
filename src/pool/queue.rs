use std::sync::Mutex;

use bytes::BytesMut;

use crate::resp::writer::BUFFER_SIZE;

const CLEAN_UP_QUEUE_AFTER_USES: u32 = 100;

/// Process-wide free list of reply output buffers.
///
/// The worker copies each batch's reply bytes into one of these before
/// submitting the async write; the write-completion hands the buffer back.
/// Every 100 returns the whole list is dropped, which sheds any buffer that
/// grew to fit an oversized reply.
pub struct ByteQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    items: Vec<BytesMut>,
    use_counter: u32,
}

impl ByteQueue {
    pub const fn new() -> ByteQueue {
        ByteQueue {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                use_counter: 0,
            }),
        }
    }

    /// Pops a spare buffer, or allocates one at the reply-buffer baseline.
    pub fn pop(&self) -> BytesMut {
        let mut inner = self.inner.lock().unwrap();
        inner
            .items
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_SIZE))
    }

    pub fn push(&self, mut buf: BytesMut) {
        let mut inner = self.inner.lock().unwrap();
        inner.use_counter += 1;
        if inner.use_counter >= CLEAN_UP_QUEUE_AFTER_USES {
            inner.items = Vec::new();
            inner.use_counter = 0;
        }
        buf.clear();
        inner.items.push(buf);
    }
}

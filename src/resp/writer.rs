use bytes::BytesMut;

use super::encode::{self, Value};

/// Baseline capacity of a reply buffer.
pub(crate) const BUFFER_SIZE: usize = 256 * 1024;

const CLEAN_UP_BUFFER_AFTER_USES: u32 = 1000;

/// Append-only reply buffer.
///
/// Handlers write reply primitives through this; the connection worker
/// snapshots the accumulated bytes after each drained batch and calls
/// [`flush`](ReplyWriter::flush). Flushing performs no I/O — it resets the
/// length, and every 1000 flushes replaces the backing storage with a fresh
/// baseline buffer to shed growth left behind by an oversized reply.
pub struct ReplyWriter {
    buf: BytesMut,
    use_counter: u32,
}

impl ReplyWriter {
    pub fn new() -> ReplyWriter {
        ReplyWriter {
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            use_counter: 0,
        }
    }

    /// Allocation-free husk used when swapping a pooled writer out of a
    /// closing connection.
    pub(crate) fn hollow() -> ReplyWriter {
        ReplyWriter {
            buf: BytesMut::new(),
            use_counter: 0,
        }
    }

    pub fn write_string(&mut self, s: &str) {
        encode::append_string(&mut self.buf, s);
    }

    pub fn write_error(&mut self, msg: &str) {
        encode::append_error(&mut self.buf, msg);
    }

    pub fn write_int(&mut self, n: i64) {
        encode::append_int(&mut self.buf, n);
    }

    pub fn write_u64(&mut self, n: u64) {
        encode::append_uint(&mut self.buf, n);
    }

    pub fn write_bulk(&mut self, bulk: &[u8]) {
        encode::append_bulk(&mut self.buf, bulk);
    }

    pub fn write_bulk_string(&mut self, bulk: &str) {
        encode::append_bulk_string(&mut self.buf, bulk);
    }

    /// Writes an array header; the caller then writes `count` sub-replies.
    pub fn write_array(&mut self, count: usize) {
        encode::append_array(&mut self.buf, count);
    }

    pub fn write_null(&mut self) {
        encode::append_null(&mut self.buf);
    }

    /// Appends pre-encoded bytes verbatim.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_any(&mut self, value: &Value) {
        encode::append_any(&mut self.buf, value);
    }

    /// Live view of the unflushed reply bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Marks the accumulated bytes as handed off. The length resets to
    /// zero; every 1000 flushes the backing storage is reallocated at
    /// baseline capacity.
    pub fn flush(&mut self) {
        self.use_counter += 1;
        if self.use_counter >= CLEAN_UP_BUFFER_AFTER_USES {
            self.buf = BytesMut::with_capacity(BUFFER_SIZE);
            self.use_counter = 0;
        } else {
            self.buf.clear();
        }
    }
}

impl Default for ReplyWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_accumulate_until_flush() {
        let mut writer = ReplyWriter::new();
        writer.write_string("OK");
        writer.write_bulk(b"v");
        assert_eq!(writer.buffer(), b"+OK\r\n$1\r\nv\r\n");

        writer.flush();
        assert!(writer.buffer().is_empty());

        writer.write_int(1);
        assert_eq!(writer.buffer(), b":1\r\n");
    }

    #[test]
    fn raw_bytes_pass_through_verbatim() {
        let mut writer = ReplyWriter::new();
        writer.write_raw(b"+PONG\r\n");
        assert_eq!(writer.buffer(), b"+PONG\r\n");
    }

    #[test]
    fn flush_decay_releases_oversized_storage() {
        let mut writer = ReplyWriter::new();
        writer.write_raw(&vec![b'x'; BUFFER_SIZE + 1024]);
        assert!(writer.buf.capacity() > BUFFER_SIZE);

        for _ in 0..CLEAN_UP_BUFFER_AFTER_USES {
            writer.flush();
        }
        assert!(writer.buf.capacity() <= BUFFER_SIZE + 1024);
        assert!(writer.buffer().is_empty());
    }
}

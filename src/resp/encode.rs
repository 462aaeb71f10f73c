//! Append-only RESP reply encoders.
//!
//! Ref: <https://redis.io/docs/reference/protocol-spec>

use bytes::{BufMut, Bytes, BytesMut};

/// Tree of reply values for dynamic replies (`Conn::write_any`).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null bulk string (`$-1`).
    Null,
    /// Encoded as bulk `"0"` or `"1"`.
    Bool(bool),
    /// RESP integer (`:<n>`).
    Int(i64),
    /// Bulk string holding the decimal text.
    Float(f64),
    Str(String),
    Bulk(Bytes),
    /// Error reply; `ERR ` is prepended unless the message starts with an
    /// all-uppercase code word.
    Err(String),
    Simple(String),
    Array(Vec<Value>),
    /// Encoded as a flat array of alternating keys and values.
    Map(Vec<(Value, Value)>),
}

pub fn append_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(b'+');
    buf.put_slice(s.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Appends an error reply. When the first whitespace-delimited word of
/// `msg` is not entirely uppercase ASCII letters, `ERR ` is prepended so
/// clients always see a code word.
pub fn append_error(buf: &mut BytesMut, msg: &str) {
    buf.put_u8(b'-');
    let word = msg.split_ascii_whitespace().next().unwrap_or("");
    let has_code = !word.is_empty() && word.bytes().all(|b| b.is_ascii_uppercase());
    if !has_code {
        buf.put_slice(b"ERR ");
    }
    buf.put_slice(msg.as_bytes());
    buf.put_slice(b"\r\n");
}

pub fn append_int(buf: &mut BytesMut, n: i64) {
    buf.put_u8(b':');
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

pub fn append_uint(buf: &mut BytesMut, n: u64) {
    buf.put_u8(b':');
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

pub fn append_bulk(buf: &mut BytesMut, bulk: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(bulk.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(bulk);
    buf.put_slice(b"\r\n");
}

pub fn append_bulk_string(buf: &mut BytesMut, bulk: &str) {
    append_bulk(buf, bulk.as_bytes());
}

/// Appends an array header; the caller then appends `count` sub-replies.
pub fn append_array(buf: &mut BytesMut, count: usize) {
    buf.put_u8(b'*');
    buf.put_slice(count.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

pub fn append_null(buf: &mut BytesMut) {
    buf.put_slice(b"$-1\r\n");
}

pub fn append_any(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => append_null(buf),
        Value::Bool(b) => append_bulk_string(buf, if *b { "1" } else { "0" }),
        Value::Int(n) => append_int(buf, *n),
        Value::Float(f) => append_bulk_string(buf, &f.to_string()),
        Value::Str(s) => append_bulk_string(buf, s),
        Value::Bulk(b) => append_bulk(buf, b),
        Value::Err(msg) => append_error(buf, msg),
        Value::Simple(s) => append_string(buf, s),
        Value::Array(items) => {
            append_array(buf, items.len());
            for item in items {
                append_any(buf, item);
            }
        }
        Value::Map(entries) => {
            append_array(buf, entries.len() * 2);
            for (key, value) in entries {
                append_any(buf, key);
                append_any(buf, value);
            }
        }
    }
}

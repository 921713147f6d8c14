//! RESP values and their wire encoding.
//!
//! Every reply the engine produces, and every command it forwards to a
//! replica, is turned into bytes here. The alphabet is the one `input`
//! decodes, so engine-to-engine replication can reuse the same codec on both
//! ends.

use bytes::{BufMut, Bytes, BytesMut};

/// A single RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Status line: `+OK\r\n`
    SimpleString(String),
    /// Error line: `-ERR message\r\n`
    Error(String),
    /// Integer line: `:42\r\n`
    Integer(i64),
    /// Bulk payload: `$3\r\nfoo\r\n`
    BulkString(Bytes),
    /// Nil bulk: `$-1\r\n`
    Null,
    /// Multi-bulk array: `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Encodes the value into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        self.encode_into(&mut buffer);
        buffer.freeze()
    }

    /// Appends the wire representation of the value to `buffer`.
    ///
    /// Status and error lines cannot carry CR or LF, so those bytes are
    /// replaced by spaces to keep the frame parseable.
    pub fn encode_into(&self, buffer: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buffer.put_u8(b'+');
                put_line(buffer, s);
            }
            RespValue::Error(e) => {
                buffer.put_u8(b'-');
                put_line(buffer, e);
            }
            RespValue::Integer(i) => {
                buffer.put_slice(format!(":{}\r\n", i).as_bytes());
            }
            RespValue::BulkString(data) => {
                buffer.put_slice(format!("${}\r\n", data.len()).as_bytes());
                buffer.put_slice(data);
                buffer.put_slice(b"\r\n");
            }
            RespValue::Null => buffer.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                buffer.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(buffer);
                }
            }
        }
    }
}

fn put_line(buffer: &mut BytesMut, line: &str) {
    buffer.extend(
        line.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    buffer.put_slice(b"\r\n");
}

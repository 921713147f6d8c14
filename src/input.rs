//! Request decoding.
//!
//! This module frames raw bytes coming off a connection (a client socket, a
//! master's replication stream or a dump file) into [`Command`]s. A frame is
//! either a multi-bulk request (`*<n>\r\n` followed by `n` bulk elements) or
//! an inline line, which is taken whole as the command name.
//!
//! Decoding never yields a partial command. Any framing violation fails the
//! read and the caller is expected to drop the connection: there is no
//! resynchronization.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::command::Command;

/// Longest header or inline line accepted, excluding the CRLF.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;
/// Largest bulk payload accepted.
pub const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;
/// Largest element count accepted in a multi-bulk header.
pub const MAX_MULTI_BULK_LENGTH: usize = 1024 * 1024;
/// Bulk payloads are buffered as they arrive, starting from at most this many
/// bytes, never from the declared length.
const INITIAL_BULK_CAPACITY: usize = 16 * 1024;

/// Errors that can occur while reading a command from a stream.
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid multibulk length '{0}'")]
    InvalidMultiBulkLength(String),
    #[error("invalid bulk length '{0}'")]
    InvalidBulkLength(String),
    #[error("expected '{expected}', got '{found}'")]
    UnexpectedByte { expected: char, found: char },
    #[error("line is not terminated by CRLF")]
    MissingCrlf,
    #[error("empty command")]
    EmptyCommand,
    #[error("line too long")]
    LineTooLong,
    #[error("bulk payload of {0} bytes exceeds the limit")]
    BulkTooLarge(usize),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(err.to_string())
        }
    }
}

/// Reads one full command from `reader`.
///
/// # Returns
///
/// * `Ok(Command)` - A complete command. Element 0 of a multi-bulk frame is
///   the name, element 1 the key and the rest the arguments.
/// * `Err(ProtocolError::ConnectionClosed)` - The stream ended cleanly before
///   a new frame started
/// * `Err(ProtocolError)` - Any other framing violation
///
/// # Examples
///
/// ```ignore
/// let mut reader = BufReader::new(&b"*2\r\n$4\r\nHLEN\r\n$4\r\nfoo0\r\n"[..]);
/// let command = read_command(&mut reader).await?;
/// // command.name() == "HLEN", command.key() == "foo0"
/// ```
pub async fn read_command<R>(reader: &mut R) -> Result<Command, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;

    match line.split_first() {
        Some((b'*', digits)) => {
            let count = parse_length(digits).ok_or_else(|| {
                ProtocolError::InvalidMultiBulkLength(String::from_utf8_lossy(digits).into_owned())
            })?;

            if count == 0 {
                return Err(ProtocolError::EmptyCommand);
            }

            if count > MAX_MULTI_BULK_LENGTH {
                return Err(ProtocolError::InvalidMultiBulkLength(count.to_string()));
            }

            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                elements.push(read_bulk(reader).await?);
            }

            let mut elements = elements.into_iter();

            let name = match elements.next() {
                Some(name) => into_string(name, "command name")?,
                None => return Err(ProtocolError::EmptyCommand),
            };

            let key = match elements.next() {
                Some(key) => into_string(key, "key")?,
                None => String::new(),
            };

            Ok(Command::new(name, key, elements.collect()))
        }
        Some(_) => {
            let name = String::from_utf8(line)
                .map_err(|_| ProtocolError::InvalidUtf8("inline command"))?;

            Ok(Command::new(name, String::new(), Vec::new()))
        }
        None => Err(ProtocolError::EmptyCommand),
    }
}

/// Reads bytes up to and including CRLF and returns the line without it.
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    let mut line = Vec::new();

    let number_of_bytes = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut line)
        .await?;

    if number_of_bytes == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }

    if line.last() != Some(&b'\n') {
        if number_of_bytes as u64 >= limit {
            return Err(ProtocolError::LineTooLong);
        }

        return Err(ProtocolError::UnexpectedEof);
    }

    if !line.ends_with(b"\r\n") {
        return Err(ProtocolError::MissingCrlf);
    }

    line.truncate(line.len() - 2);
    Ok(line)
}

/// Reads a `$<len>\r\n<payload>\r\n` element.
async fn read_bulk<R>(reader: &mut R) -> Result<Bytes, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let header = match read_line(reader).await {
        Ok(header) => header,
        Err(ProtocolError::ConnectionClosed) => return Err(ProtocolError::UnexpectedEof),
        Err(e) => return Err(e),
    };

    let (marker, digits) = match header.split_first() {
        Some((marker, digits)) => (*marker, digits),
        None => return Err(ProtocolError::InvalidBulkLength(String::new())),
    };

    if marker != b'$' {
        return Err(ProtocolError::UnexpectedByte {
            expected: '$',
            found: marker as char,
        });
    }

    let length = parse_length(digits).ok_or_else(|| {
        ProtocolError::InvalidBulkLength(String::from_utf8_lossy(digits).into_owned())
    })?;

    if length > MAX_BULK_LENGTH {
        return Err(ProtocolError::BulkTooLarge(length));
    }

    let mut payload = Vec::with_capacity((length + 2).min(INITIAL_BULK_CAPACITY));
    (&mut *reader)
        .take(length as u64 + 2)
        .read_to_end(&mut payload)
        .await?;

    if payload.len() < length + 2 {
        return Err(ProtocolError::UnexpectedEof);
    }

    if &payload[length..] != b"\r\n" {
        return Err(ProtocolError::MissingCrlf);
    }

    payload.truncate(length);
    Ok(Bytes::from(payload))
}

/// Parses a non-negative decimal length. Signs and empty strings are rejected.
fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse::<usize>().ok()
}

fn into_string(element: Bytes, what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(element.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(what))
}

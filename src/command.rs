use bytes::Bytes;

use crate::resp::RespValue;

/// A parsed request: command name, key and the remaining arguments.
///
/// Commands are produced by the codec and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    key: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>, key: impl Into<String>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Returns the argument at `index` if it is valid UTF-8.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.arg(index)
            .and_then(|arg| std::str::from_utf8(arg).ok())
    }

    /// Multi-bulk form of the command, as a client (or a master forwarding a
    /// write) would send it.
    ///
    /// The key element is omitted only when both the key and the argument
    /// list are empty, so decoding the result yields an equal command.
    pub fn to_resp(&self) -> RespValue {
        let mut elements = Vec::with_capacity(self.args.len() + 2);
        elements.push(RespValue::bulk(self.name.clone()));

        if !self.key.is_empty() || !self.args.is_empty() {
            elements.push(RespValue::bulk(self.key.clone()));
        }

        elements.extend(self.args.iter().cloned().map(RespValue::BulkString));

        RespValue::Array(elements)
    }
}

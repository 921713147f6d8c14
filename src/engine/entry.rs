use std::any::Any;
use std::fmt;

use bytes::Bytes;

use crate::{command::Command, engine::CommandError, resp::RespValue};

/// Capability every plugin-owned value implements.
///
/// The engine only ever serializes values; interpreting them is left to the
/// plugin that created them, which gets its concrete type back through
/// [`Entry::value`].
pub trait EntryValue: Any + Send + Sync + fmt::Debug {
    /// Opaque payload handed back to the owning plugin's loader.
    fn serialize(&self) -> Result<Vec<u8>, CommandError>;

    fn as_any(&self) -> &dyn Any;
}

/// A value stored under a key, tagged with the type of the plugin owning it.
#[derive(Debug)]
pub struct Entry {
    type_tag: String,
    value: Box<dyn EntryValue>,
}

impl Entry {
    pub fn new(type_tag: impl Into<String>, value: impl EntryValue) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: Box::new(value),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Checked access to the concrete value.
    ///
    /// Returns `CommandError::WrongType` when the entry holds another type.
    pub fn value<T: EntryValue>(&self) -> Result<&T, CommandError> {
        self.value
            .as_any()
            .downcast_ref::<T>()
            .ok_or(CommandError::WrongType)
    }

    pub fn serialize(&self, key: &str) -> Result<SerializedEntry, CommandError> {
        Ok(SerializedEntry {
            key: key.to_string(),
            type_tag: self.type_tag.clone(),
            bytes: Bytes::from(self.value.serialize()?),
        })
    }
}

/// Transfer form of an entry, used by the dump file and by replication.
///
/// On the wire it travels as `LOAD <key> <type> <len> <bytes>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedEntry {
    pub key: String,
    pub type_tag: String,
    pub bytes: Bytes,
}

impl SerializedEntry {
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_load_command(&self) -> RespValue {
        RespValue::Array(vec![
            RespValue::bulk("LOAD"),
            RespValue::bulk(self.key.clone()),
            RespValue::bulk(self.type_tag.clone()),
            RespValue::bulk(self.byte_len().to_string()),
            RespValue::BulkString(self.bytes.clone()),
        ])
    }

    /// Parses the arguments of a `LOAD` command.
    pub fn from_load_command(command: &Command) -> Result<Self, CommandError> {
        if command.key().is_empty() || command.args().len() != 3 {
            return Err(CommandError::WrongArity("LOAD".to_string()));
        }

        let type_tag = command
            .arg_str(0)
            .ok_or_else(|| CommandError::plugin("REPLICATION", "invalid entry type"))?;

        let declared_length = command
            .arg_str(1)
            .and_then(|len| len.parse::<usize>().ok())
            .ok_or_else(|| CommandError::plugin("REPLICATION", "invalid entry length"))?;

        let bytes = command.args()[2].clone();

        if bytes.len() != declared_length {
            return Err(CommandError::plugin(
                "REPLICATION",
                format!(
                    "entry length mismatch: declared {}, got {}",
                    declared_length,
                    bytes.len()
                ),
            ));
        }

        Ok(Self {
            key: command.key().to_string(),
            type_tag: type_tag.to_string(),
            bytes,
        })
    }
}

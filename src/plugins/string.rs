use std::any::Any;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    command::Command,
    engine::{
        CommandError, CommandResult, CommandSpec, Entry, EntryValue, Plugin, PluginManifest,
        SerializedEntry,
    },
    resp::RespValue,
    session::Session,
};

pub const PLUGIN_NAME: &str = "STRING";
pub const T_STRING: &str = "STRING";

#[derive(Debug, Default)]
pub struct StringValue {
    value: RwLock<Bytes>,
}

impl StringValue {
    pub fn get(&self) -> Result<Bytes, CommandError> {
        self.value
            .read()
            .map(|value| value.clone())
            .map_err(|_| poisoned())
    }

    fn set(&self, value: Bytes) -> Result<(), CommandError> {
        *self.value.write().map_err(|_| poisoned())? = value;
        Ok(())
    }

    /// Adds `delta` to the stored integer. An empty value counts as zero.
    fn increment(&self, delta: i64) -> Result<i64, CommandError> {
        let mut value = self.value.write().map_err(|_| poisoned())?;

        let current = if value.is_empty() {
            0
        } else {
            std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    CommandError::plugin(PLUGIN_NAME, "value is not an integer or out of range")
                })?
        };

        let next = current.checked_add(delta).ok_or_else(|| {
            CommandError::plugin(PLUGIN_NAME, "increment or decrement would overflow")
        })?;

        *value = Bytes::from(next.to_string());

        Ok(next)
    }
}

impl EntryValue for StringValue {
    fn serialize(&self) -> Result<Vec<u8>, CommandError> {
        Ok(self.get()?.to_vec())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn poisoned() -> CommandError {
    CommandError::plugin(PLUGIN_NAME, "string lock poisoned")
}

/// Plain byte-string values: `SET`, `GET` and `INCRBY`.
#[derive(Debug, Default)]
pub struct StringPlugin;

#[async_trait]
impl Plugin for StringPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: PLUGIN_NAME,
            commands: vec![
                CommandSpec::writer("SET", "value:bytes", 1),
                CommandSpec::reader("GET", "", 0),
                CommandSpec::writer("INCRBY", "delta:int", 1),
            ],
            types: vec![T_STRING],
        }
    }

    fn create_entry(&self, _command: &Command) -> Result<Entry, CommandError> {
        Ok(Entry::new(T_STRING, StringValue::default()))
    }

    fn load_entry(&self, serialized: &SerializedEntry) -> Result<Entry, CommandError> {
        Ok(Entry::new(
            T_STRING,
            StringValue {
                value: RwLock::new(serialized.bytes.clone()),
            },
        ))
    }

    async fn handle(
        &self,
        command: &Command,
        entry: Option<Arc<Entry>>,
        _session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        let value = entry
            .as_deref()
            .map(|entry| entry.value::<StringValue>())
            .transpose()?;

        let response = match (command.name().to_ascii_uppercase().as_str(), value) {
            ("SET", Some(value)) => {
                let new_value = command
                    .arg(0)
                    .cloned()
                    .ok_or_else(|| CommandError::WrongArity("SET".to_string()))?;
                value.set(new_value)?;

                RespValue::ok()
            }
            ("GET", Some(value)) => RespValue::BulkString(value.get()?),
            ("GET", None) => RespValue::Null,
            ("INCRBY", Some(value)) => {
                let delta = command
                    .arg_str(0)
                    .and_then(|delta| delta.parse::<i64>().ok())
                    .ok_or_else(|| {
                        CommandError::plugin(PLUGIN_NAME, "delta is not an integer")
                    })?;

                RespValue::Integer(value.increment(delta)?)
            }
            _ => return Err(CommandError::UnknownCommand(command.name().to_string())),
        };

        Ok(CommandResult::Response(response))
    }
}

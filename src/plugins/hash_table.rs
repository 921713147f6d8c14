use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

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

pub const PLUGIN_NAME: &str = "HASH";
pub const T_HASH_TABLE: &str = "HASH";

/// A field -> value table stored under one key.
#[derive(Debug, Default)]
pub struct HashTable {
    table: RwLock<HashMap<Bytes, Bytes>>,
}

impl HashTable {
    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Bytes, Bytes>>, CommandError> {
        self.table
            .read()
            .map_err(|_| CommandError::plugin(PLUGIN_NAME, "hash table lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Bytes, Bytes>>, CommandError> {
        self.table
            .write()
            .map_err(|_| CommandError::plugin(PLUGIN_NAME, "hash table lock poisoned"))
    }

    pub fn get(&self, field: &[u8]) -> Result<Option<Bytes>, CommandError> {
        Ok(self.read()?.get(field).cloned())
    }

    pub fn len(&self) -> Result<usize, CommandError> {
        Ok(self.read()?.len())
    }
}

impl EntryValue for HashTable {
    fn serialize(&self) -> Result<Vec<u8>, CommandError> {
        bincode::serialize(&*self.read()?)
            .map_err(|e| CommandError::plugin(PLUGIN_NAME, format!("could not serialize: {}", e)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct HashTablePlugin;

impl HashTablePlugin {
    fn hset(command: &Command, table: &HashTable) -> Result<CommandResult, CommandError> {
        let (field, value) = field_and_value(command)?;
        table.write()?.insert(field, value);

        Ok(CommandResult::Response(RespValue::ok()))
    }

    fn hget(command: &Command, table: Option<&HashTable>) -> Result<CommandResult, CommandError> {
        let field = field(command)?;

        let value = match table {
            Some(table) => table.get(&field)?,
            None => None,
        };

        Ok(CommandResult::Response(
            value.map_or(RespValue::Null, RespValue::BulkString),
        ))
    }

    fn hdel(command: &Command, table: &HashTable) -> Result<CommandResult, CommandError> {
        let field = field(command)?;
        let removed = table.write()?.remove(&field).is_some();

        Ok(CommandResult::Response(RespValue::Integer(removed as i64)))
    }

    fn hlen(table: Option<&HashTable>) -> Result<CommandResult, CommandError> {
        let len = match table {
            Some(table) => table.len()?,
            None => 0,
        };

        Ok(CommandResult::Response(RespValue::Integer(len as i64)))
    }

    fn hgetall(table: Option<&HashTable>) -> Result<CommandResult, CommandError> {
        let Some(table) = table else {
            return Ok(CommandResult::Response(RespValue::Array(Vec::new())));
        };

        let mut pairs: Vec<(Bytes, Bytes)> = table
            .read()?
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        pairs.sort();

        Ok(CommandResult::Response(RespValue::Array(
            pairs
                .into_iter()
                .flat_map(|(field, value)| {
                    [RespValue::BulkString(field), RespValue::BulkString(value)]
                })
                .collect(),
        )))
    }
}

#[async_trait]
impl Plugin for HashTablePlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: PLUGIN_NAME,
            commands: vec![
                CommandSpec::writer("HSET", "field:string value:string", 2),
                CommandSpec::reader("HGET", "field:string", 1),
                CommandSpec::writer("HDEL", "field:string", 1),
                CommandSpec::reader("HLEN", "", 0),
                CommandSpec::reader("HGETALL", "", 0),
            ],
            types: vec![T_HASH_TABLE],
        }
    }

    fn create_entry(&self, _command: &Command) -> Result<Entry, CommandError> {
        Ok(Entry::new(T_HASH_TABLE, HashTable::default()))
    }

    fn load_entry(&self, serialized: &SerializedEntry) -> Result<Entry, CommandError> {
        let table: HashMap<Bytes, Bytes> = bincode::deserialize(&serialized.bytes).map_err(|e| {
            CommandError::plugin(PLUGIN_NAME, format!("could not deserialize: {}", e))
        })?;

        Ok(Entry::new(
            T_HASH_TABLE,
            HashTable {
                table: RwLock::new(table),
            },
        ))
    }

    async fn handle(
        &self,
        command: &Command,
        entry: Option<Arc<Entry>>,
        _session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        let table = entry
            .as_deref()
            .map(|entry| entry.value::<HashTable>())
            .transpose()?;

        match (command.name().to_ascii_uppercase().as_str(), table) {
            ("HSET", Some(table)) => Self::hset(command, table),
            ("HGET", table) => Self::hget(command, table),
            ("HDEL", Some(table)) => Self::hdel(command, table),
            ("HLEN", table) => Self::hlen(table),
            ("HGETALL", table) => Self::hgetall(table),
            _ => Err(CommandError::UnknownCommand(command.name().to_string())),
        }
    }
}

fn field(command: &Command) -> Result<Bytes, CommandError> {
    command
        .arg(0)
        .cloned()
        .ok_or_else(|| CommandError::WrongArity(command.name().to_string()))
}

fn field_and_value(command: &Command) -> Result<(Bytes, Bytes), CommandError> {
    match command.args() {
        [field, value] => Ok((field.clone(), value.clone())),
        _ => Err(CommandError::WrongArity(command.name().to_string())),
    }
}

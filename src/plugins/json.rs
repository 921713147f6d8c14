use std::any::Any;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    command::Command,
    engine::{
        CommandError, CommandResult, CommandSpec, Entry, EntryValue, Plugin, PluginManifest,
        SerializedEntry,
    },
    resp::RespValue,
    session::Session,
};

pub const PLUGIN_NAME: &str = "JSON";
pub const T_JSON: &str = "JSON";

/// Deepest container nesting a document may reach. Stays below serde_json's
/// parser limit so every stored document can be loaded back.
pub const MAX_NESTING: usize = 100;

/// A JSON document stored under one key.
#[derive(Debug)]
pub struct JsonDocument {
    root: RwLock<Value>,
}

impl Default for JsonDocument {
    fn default() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
        }
    }
}

impl JsonDocument {
    fn set(&self, path: &[String], value: Value) -> Result<(), CommandError> {
        let mut root = self.root.write().map_err(|_| poisoned())?;
        set_path(&mut root, path, value).map_err(|message| CommandError::plugin(PLUGIN_NAME, message))
    }

    fn get(&self, path: &[String]) -> Result<Option<Value>, CommandError> {
        let root = self.root.read().map_err(|_| poisoned())?;
        Ok(get_path(&root, path).cloned())
    }
}

impl EntryValue for JsonDocument {
    fn serialize(&self) -> Result<Vec<u8>, CommandError> {
        let root = self.root.read().map_err(|_| poisoned())?;
        serde_json::to_vec(&*root).map_err(|e| CommandError::plugin(PLUGIN_NAME, e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn poisoned() -> CommandError {
    CommandError::plugin(PLUGIN_NAME, "document lock poisoned")
}

/// Splits `a.b[0].c` into `["a", "b", "0", "c"]`. `.` alone is the root.
pub fn parse_path(path: &str) -> Vec<String> {
    path.replace('[', ".")
        .replace(']', "")
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn set_path(root: &mut Value, path: &[String], value: Value) -> Result<(), String> {
    if path.len() + nesting(&value) > MAX_NESTING {
        return Err(format!(
            "document would nest deeper than {} levels",
            MAX_NESTING
        ));
    }

    let mut target = root;
    for segment in path {
        if target.is_null() {
            *target = Value::Object(Map::new());
        }

        target = match target {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let index = segment
                    .parse::<usize>()
                    .map_err(|_| format!("'{}' is not an array index", segment))?;

                if index == items.len() {
                    items.push(Value::Null);
                }

                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {} out of range", index))?
            }
            _ => return Err(format!("cannot set '{}' on a scalar value", segment)),
        };
    }

    *target = value;
    Ok(())
}

/// Container depth of a parsed value, bounded by serde_json's parser limit.
fn nesting(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(nesting).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(nesting).max().unwrap_or(0),
        _ => 0,
    }
}

fn get_path<'a>(target: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(target, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

/// JSON documents: `JSET key path json`, `JGET key`, `JQUERY key path`.
#[derive(Debug, Default)]
pub struct JsonPlugin;

#[async_trait]
impl Plugin for JsonPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: PLUGIN_NAME,
            commands: vec![
                CommandSpec::writer("JSET", "path:string json:string", 2),
                CommandSpec::reader("JGET", "", 0),
                CommandSpec::reader("JQUERY", "path:string", 1),
            ],
            types: vec![T_JSON],
        }
    }

    fn create_entry(&self, _command: &Command) -> Result<Entry, CommandError> {
        Ok(Entry::new(T_JSON, JsonDocument::default()))
    }

    fn load_entry(&self, serialized: &SerializedEntry) -> Result<Entry, CommandError> {
        let root: Value = serde_json::from_slice(&serialized.bytes).map_err(|e| {
            CommandError::plugin(PLUGIN_NAME, format!("could not deserialize: {}", e))
        })?;

        Ok(Entry::new(
            T_JSON,
            JsonDocument {
                root: RwLock::new(root),
            },
        ))
    }

    async fn handle(
        &self,
        command: &Command,
        entry: Option<Arc<Entry>>,
        _session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        let document = entry
            .as_deref()
            .map(|entry| entry.value::<JsonDocument>())
            .transpose()?;

        let path = parse_path(command.arg_str(0).unwrap_or("."));

        let response = match (command.name().to_ascii_uppercase().as_str(), document) {
            ("JSET", Some(document)) => {
                let raw = command
                    .arg(1)
                    .ok_or_else(|| CommandError::WrongArity("JSET".to_string()))?;

                let value: Value = serde_json::from_slice(raw).map_err(|e| {
                    debug!(key = command.key(), "invalid JSON: {}", e);
                    CommandError::plugin(PLUGIN_NAME, format!("Invalid JSON: {}", e))
                })?;

                document.set(&path, value)?;

                RespValue::ok()
            }
            ("JGET", Some(document)) => render(document.get(&[])?)?,
            ("JQUERY", Some(document)) => render(document.get(&path)?)?,
            ("JGET", None) | ("JQUERY", None) => RespValue::Null,
            _ => return Err(CommandError::UnknownCommand(command.name().to_string())),
        };

        Ok(CommandResult::Response(response))
    }
}

/// Strings come back raw, everything else as JSON text.
fn render(value: Option<Value>) -> Result<RespValue, CommandError> {
    match value {
        None => Ok(RespValue::Null),
        Some(Value::String(s)) => Ok(RespValue::bulk(s)),
        Some(other) => serde_json::to_vec(&other)
            .map(RespValue::bulk)
            .map_err(|e| CommandError::plugin(PLUGIN_NAME, e.to_string())),
    }
}

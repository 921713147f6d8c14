use thiserror::Error;

use crate::resp::RespValue;

/// Errors produced while dispatching a single command.
///
/// None of these end the session; they are turned into an error reply with
/// [`CommandError::as_resp`].
#[derive(Error, Debug, PartialEq, Clone)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("unknown entry type '{0}'")]
    UnknownType(String),
    #[error("[{plugin}] {message}")]
    Plugin { plugin: String, message: String },
    #[error("[RUNTIME] {0}")]
    RuntimeFault(String),
}

impl CommandError {
    pub fn plugin(plugin: &str, message: impl Into<String>) -> Self {
        CommandError::Plugin {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub fn as_resp(&self) -> RespValue {
        match self {
            CommandError::WrongType => RespValue::Error(format!("WRONGTYPE {}", self)),
            _ => RespValue::Error(format!("ERR {}", self)),
        }
    }
}

/// Fatal startup errors raised while registering plugins.
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("command '{command}' of plugin {plugin} is already registered by {owner}")]
    DuplicateCommand {
        command: String,
        plugin: String,
        owner: String,
    },
    #[error("type '{type_tag}' of plugin {plugin} is already registered by {owner}")]
    DuplicateType {
        type_tag: String,
        plugin: String,
        owner: String,
    },
    #[error("plugin {0} is already registered")]
    DuplicatePlugin(String),
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    command::Command,
    engine::{CommandError, CommandResult, Entry, SerializedEntry},
    session::Session,
};

/// Whether a command may create the entry it operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Runs against the existing entry, or none at all.
    Reader,
    /// Creates the entry through the owning plugin if the key is absent.
    /// Successful writers are forwarded to replication sinks.
    Writer,
}

/// Registration record for one command, as declared by a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Human readable shape of the arguments, e.g. `field:string value:string`.
    pub args_hint: &'static str,
    pub min_args: usize,
    /// `None` means unbounded.
    pub max_args: Option<usize>,
    pub requires_key: bool,
    pub class: CommandClass,
}

impl CommandSpec {
    pub const fn reader(name: &'static str, args_hint: &'static str, args: usize) -> Self {
        Self {
            name,
            args_hint,
            min_args: args,
            max_args: Some(args),
            requires_key: true,
            class: CommandClass::Reader,
        }
    }

    pub const fn writer(name: &'static str, args_hint: &'static str, args: usize) -> Self {
        Self {
            name,
            args_hint,
            min_args: args,
            max_args: Some(args),
            requires_key: true,
            class: CommandClass::Writer,
        }
    }

    /// A reader that does not need a key, such as `PING` or `SYNC`.
    pub const fn keyless(name: &'static str) -> Self {
        Self {
            name,
            args_hint: "",
            min_args: 0,
            max_args: Some(0),
            requires_key: false,
            class: CommandClass::Reader,
        }
    }

    /// A reader whose key element is an operand rather than a keyspace key,
    /// such as `SLAVEOF host port`. The engine never looks the key up.
    pub const fn control(name: &'static str, args_hint: &'static str, args: usize) -> Self {
        Self {
            name,
            args_hint,
            min_args: args,
            max_args: Some(args),
            requires_key: false,
            class: CommandClass::Reader,
        }
    }

    /// Checks the argument shape of `command` against this spec.
    pub fn validate(&self, command: &Command) -> Result<(), CommandError> {
        let count = command.args().len();
        let needs_key = self.requires_key || self.class == CommandClass::Writer;

        if (needs_key && command.key().is_empty())
            || count < self.min_args
            || self.max_args.is_some_and(|max| count > max)
        {
            return Err(CommandError::WrongArity(self.name.to_string()));
        }

        Ok(())
    }
}

/// Everything a plugin contributes to the engine's registries.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub name: &'static str,
    pub commands: Vec<CommandSpec>,
    pub types: Vec<&'static str>,
}

/// A self-contained module providing data types and the commands on them.
///
/// Handlers are keyed by command name: the engine routes every command listed
/// in the manifest to [`Plugin::handle`] of the plugin that declared it.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> PluginManifest;

    /// Builds a fresh entry for a writer command on an absent key.
    fn create_entry(&self, command: &Command) -> Result<Entry, CommandError> {
        Err(CommandError::plugin(
            self.manifest().name,
            format!("'{}' cannot create entries", command.name()),
        ))
    }

    /// Rebuilds an entry from its serialized payload.
    fn load_entry(&self, serialized: &SerializedEntry) -> Result<Entry, CommandError> {
        Err(CommandError::UnknownType(serialized.type_tag.clone()))
    }

    /// Runs `command`. `entry` is `None` only for readers on an absent key.
    async fn handle(
        &self,
        command: &Command,
        entry: Option<Arc<Entry>>,
        session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError>;
}

/// A registered command, bound to the plugin that handles it.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub spec: CommandSpec,
    pub plugin_name: &'static str,
    pub plugin: Arc<dyn Plugin>,
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("spec", &self.spec)
            .field("plugin_name", &self.plugin_name)
            .finish()
    }
}

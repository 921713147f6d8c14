//! The entry store and plugin registry.
//!
//! The [`Engine`] owns the keyspace, the `command -> plugin` and
//! `type -> plugin` registries, the live session registry with its stats, and
//! the replication manager. It is built once, filled with plugins through
//! `&mut self` (so registrations are fixed once it is shared), and then
//! handed to every connection behind an `Arc`.

mod entry;
mod error;
mod plugin;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{RwLock, mpsc, mpsc::error::TrySendError};
use tracing::{debug, error, info, warn};

pub use entry::{Entry, EntryValue, SerializedEntry};
pub use error::{CommandError, RegistryError};
pub use plugin::{CommandClass, CommandDescriptor, CommandSpec, Plugin, PluginManifest};

use crate::{
    command::Command, replication::ReplicationManager, resp::RespValue, session::Session,
};

/// Outcome of a successfully dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Fire-and-forget commands such as `LOAD` produce no reply.
    NoResponse,
    Response(RespValue),
}

/// Tunables injected into the engine and the sessions it creates.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub in_queue_capacity: usize,
    pub out_queue_capacity: usize,
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            in_queue_capacity: 128,
            out_queue_capacity: 128,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide session counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub active_sessions: u64,
    pub total_sessions: u64,
}

/// A replication sink: a session plus the queue feeding its forwarding task.
struct Sink {
    session: Arc<Session>,
    frames: mpsc::Sender<RespValue>,
}

#[derive(Default)]
struct SessionRegistry {
    stats: Stats,
    sessions: HashMap<String, Weak<Session>>,
    sinks: HashMap<String, Sink>,
}

pub struct Engine {
    config: EngineConfig,
    keyspace: RwLock<HashMap<String, Arc<Entry>>>,
    commands: HashMap<String, CommandDescriptor>,
    types: HashMap<String, (&'static str, Arc<dyn Plugin>)>,
    plugins: Vec<&'static str>,
    sessions: Mutex<SessionRegistry>,
    replication: ReplicationManager,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let replication = ReplicationManager::new(config.connect_timeout);

        Self {
            config,
            keyspace: RwLock::new(HashMap::new()),
            commands: HashMap::new(),
            types: HashMap::new(),
            plugins: Vec::new(),
            sessions: Mutex::new(SessionRegistry::default()),
            replication,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    /// Adds every command and type of `plugin` to the registries.
    ///
    /// The whole manifest is checked before anything is inserted, so a
    /// conflicting plugin leaves the registries untouched.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let manifest = plugin.manifest();

        if self.plugins.contains(&manifest.name) {
            return Err(RegistryError::DuplicatePlugin(manifest.name.to_string()));
        }

        let mut commands = HashMap::new();
        for spec in &manifest.commands {
            let name = spec.name.to_ascii_uppercase();
            let owner = self
                .commands
                .get(&name)
                .map(|descriptor| descriptor.plugin_name)
                .or_else(|| commands.contains_key(&name).then_some(manifest.name));

            if let Some(owner) = owner {
                return Err(RegistryError::DuplicateCommand {
                    command: name,
                    plugin: manifest.name.to_string(),
                    owner: owner.to_string(),
                });
            }

            commands.insert(
                name,
                CommandDescriptor {
                    spec: spec.clone(),
                    plugin_name: manifest.name,
                    plugin: Arc::clone(&plugin),
                },
            );
        }

        let mut types = HashMap::new();
        for type_tag in &manifest.types {
            let owner = self
                .types
                .get(*type_tag)
                .map(|(owner, _)| *owner)
                .or_else(|| types.contains_key(*type_tag).then_some(manifest.name));

            if let Some(owner) = owner {
                return Err(RegistryError::DuplicateType {
                    type_tag: type_tag.to_string(),
                    plugin: manifest.name.to_string(),
                    owner: owner.to_string(),
                });
            }

            types.insert(type_tag.to_string(), (manifest.name, Arc::clone(&plugin)));
        }

        info!(
            plugin = manifest.name,
            commands = commands.len(),
            types = types.len(),
            "registered plugin"
        );

        self.commands.extend(commands);
        self.types.extend(types);
        self.plugins.push(manifest.name);

        Ok(())
    }

    pub fn plugins(&self) -> &[&'static str] {
        &self.plugins
    }

    pub fn descriptor(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(&name.to_ascii_uppercase())
    }

    /// Routes `command` to the plugin that registered it.
    ///
    /// Writers on an absent key get a fresh entry from the owning plugin
    /// before the handler runs; readers see `None`. A panic raised while the
    /// command runs is caught here and reported as a plugin error.
    pub async fn dispatch(
        &self,
        command: &Command,
        session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        let Some(descriptor) = self.descriptor(command.name()) else {
            return Err(CommandError::UnknownCommand(command.name().to_string()));
        };

        match AssertUnwindSafe(self.run_command(descriptor, command, session))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    plugin = descriptor.plugin_name,
                    command = command.name(),
                    session = session.id(),
                    "runtime fault in plugin: {}",
                    message
                );

                Err(CommandError::plugin(
                    descriptor.plugin_name,
                    format!("runtime fault: {}", message),
                ))
            }
        }
    }

    async fn run_command(
        &self,
        descriptor: &CommandDescriptor,
        command: &Command,
        session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        descriptor.spec.validate(command)?;

        let entry = match descriptor.spec.class {
            CommandClass::Writer => Some(self.get_or_create_entry(descriptor, command).await?),
            CommandClass::Reader if descriptor.spec.requires_key => {
                self.get_entry(command.key()).await
            }
            CommandClass::Reader => None,
        };

        if let Some(entry) = &entry {
            let owner = self.types.get(entry.type_tag()).map(|(owner, _)| *owner);

            if owner != Some(descriptor.plugin_name) {
                return Err(CommandError::WrongType);
            }
        }

        let result = descriptor.plugin.handle(command, entry, session).await?;

        if descriptor.spec.class == CommandClass::Writer {
            self.replicate(command);
        }

        Ok(result)
    }

    pub async fn get_entry(&self, key: &str) -> Option<Arc<Entry>> {
        self.keyspace.read().await.get(key).cloned()
    }

    /// Looks `key` up and creates its entry if absent, atomically per key.
    async fn get_or_create_entry(
        &self,
        descriptor: &CommandDescriptor,
        command: &Command,
    ) -> Result<Arc<Entry>, CommandError> {
        if let Some(entry) = self.get_entry(command.key()).await {
            return Ok(entry);
        }

        let mut keyspace = self.keyspace.write().await;

        // Another writer may have won the race between the two locks.
        if let Some(entry) = keyspace.get(command.key()) {
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(descriptor.plugin.create_entry(command)?);
        debug!(
            key = command.key(),
            type_tag = entry.type_tag(),
            "created entry"
        );
        keyspace.insert(command.key().to_string(), Arc::clone(&entry));

        Ok(entry)
    }

    /// Rebuilds an entry through the plugin owning its type and stores it,
    /// replacing whatever the key held.
    pub async fn load_serialized_entry(
        &self,
        serialized: &SerializedEntry,
    ) -> Result<(), CommandError> {
        let Some((_, plugin)) = self.types.get(&serialized.type_tag) else {
            return Err(CommandError::UnknownType(serialized.type_tag.clone()));
        };

        let entry = plugin.load_entry(serialized)?;

        if entry.type_tag() != serialized.type_tag {
            return Err(CommandError::UnknownType(entry.type_tag().to_string()));
        }

        self.keyspace
            .write()
            .await
            .insert(serialized.key.clone(), Arc::new(entry));

        Ok(())
    }

    /// Serializes every entry, ordered by key.
    ///
    /// Entries whose plugin fails to serialize them are skipped with a
    /// warning.
    pub async fn snapshot(&self) -> Vec<SerializedEntry> {
        let mut entries: Vec<(String, Arc<Entry>)> = self
            .keyspace
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .filter_map(|(key, entry)| match entry.serialize(&key) {
                Ok(serialized) => Some(serialized),
                Err(e) => {
                    warn!(key = %key, "could not serialize entry: {}", e);
                    None
                }
            })
            .collect()
    }

    pub async fn keyspace_len(&self) -> usize {
        self.keyspace.read().await.len()
    }

    /// Forwards a successful write to every replication sink without
    /// waiting on any of them.
    ///
    /// A sink whose forwarding queue is full has fallen too far behind and is
    /// stopped.
    fn replicate(&self, command: &Command) {
        let mut lagging = Vec::new();

        {
            let registry = self.lock_sessions();
            if registry.sinks.is_empty() {
                return;
            }

            let frame = command.to_resp();
            for (id, sink) in &registry.sinks {
                match sink.frames.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(sink = %id, "replication sink is lagging, dropping it");
                        lagging.push(Arc::clone(&sink.session));
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(sink = %id, "sink closed while replicating")
                    }
                }
            }
        }

        for session in lagging {
            session.stop();
        }
    }

    /// Registers `session` as a replication sink.
    ///
    /// Forwarded writes go through a queue of `out_queue_capacity` frames to a
    /// task that pushes them onto the session's outbound queue, so a slow sink
    /// only ever blocks that task.
    pub fn add_sink(&self, session: Arc<Session>) {
        let (frames, receiver) = mpsc::channel(self.config.out_queue_capacity.max(1));
        tokio::spawn(forward_to_sink(Arc::clone(&session), receiver));

        info!(sink = session.id(), "registered replication sink");
        self.lock_sessions()
            .sinks
            .insert(session.id().to_string(), Sink { session, frames });
    }

    pub fn sink_count(&self) -> usize {
        self.lock_sessions().sinks.len()
    }

    pub(crate) fn register_session(&self, session: &Arc<Session>) {
        let mut registry = self.lock_sessions();
        registry.stats.active_sessions += 1;
        registry.stats.total_sessions += 1;
        registry
            .sessions
            .insert(session.id().to_string(), Arc::downgrade(session));
    }

    pub(crate) fn deregister_session(&self, id: &str) {
        let mut registry = self.lock_sessions();
        registry.stats.active_sessions = registry.stats.active_sessions.saturating_sub(1);
        registry.sessions.remove(id);

        if registry.sinks.remove(id).is_some() {
            info!(sink = id, "removed replication sink");
        }
    }

    pub fn stats(&self) -> Stats {
        self.lock_sessions().stats
    }

    /// Detaches from the current master and stops every live session.
    pub async fn shutdown(&self) {
        info!("shutting down engine");
        self.replication.disconnect().await;

        let sessions: Vec<Arc<Session>> = self
            .lock_sessions()
            .sessions
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for session in sessions {
            session.stop();
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionRegistry> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn forward_to_sink(session: Arc<Session>, mut frames: mpsc::Receiver<RespValue>) {
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = session.stopped() => None,
        };

        let Some(frame) = frame else {
            break;
        };

        if !session.send(frame).await {
            break;
        }
    }

    debug!(sink = session.id(), "replication forwarding finished");
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

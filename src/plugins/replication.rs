use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    command::Command,
    engine::{
        CommandError, CommandResult, CommandSpec, Entry, Plugin, PluginManifest, SerializedEntry,
    },
    replication::MasterAddress,
    resp::RespValue,
    session::Session,
};

pub const PLUGIN_NAME: &str = "REPLICATION";

/// Replication control: `SYNC` (master side), `LOAD` and `SLAVEOF` (replica
/// side).
#[derive(Debug, Default)]
pub struct ReplicationPlugin;

impl ReplicationPlugin {
    /// Turns the requesting session into a replication sink and streams the
    /// whole keyspace to it as `LOAD` frames. The `+OK` reply that follows is
    /// the bootstrap acknowledgement.
    async fn sync(session: &Arc<Session>) -> Result<CommandResult, CommandError> {
        if !session.has_outbound() {
            return Err(CommandError::plugin(
                PLUGIN_NAME,
                "SYNC needs a session that can receive replies",
            ));
        }

        let engine = session.engine();
        engine.add_sink(Arc::clone(session));

        let entries = engine.snapshot().await;
        info!(
            sink = session.id(),
            entries = entries.len(),
            "streaming bootstrap to replica"
        );

        for entry in &entries {
            if !session.send(entry.to_load_command()).await {
                return Ok(CommandResult::NoResponse);
            }
        }

        Ok(CommandResult::Response(RespValue::ok()))
    }

    async fn load(command: &Command, session: &Arc<Session>) -> Result<CommandResult, CommandError> {
        let engine = session.engine();

        if !engine.replication().is_attached().await {
            return Err(CommandError::plugin(
                PLUGIN_NAME,
                "LOAD is only accepted from a master",
            ));
        }

        let serialized = SerializedEntry::from_load_command(command)?;
        engine.load_serialized_entry(&serialized).await?;

        Ok(CommandResult::NoResponse)
    }

    async fn slave_of(
        command: &Command,
        session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        let host = command.key();
        let port = command
            .arg_str(0)
            .ok_or_else(|| CommandError::WrongArity("SLAVEOF".to_string()))?;

        if host.is_empty() {
            return Err(CommandError::WrongArity("SLAVEOF".to_string()));
        }

        let engine = session.engine();

        if host.eq_ignore_ascii_case("NO") && port.eq_ignore_ascii_case("ONE") {
            engine.replication().disconnect().await;
            return Ok(CommandResult::Response(RespValue::ok()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| CommandError::plugin(PLUGIN_NAME, "invalid port number"))?;

        engine
            .replication()
            .slave_of(engine, MasterAddress::new(host, port))
            .await
            .map_err(|e| CommandError::plugin(PLUGIN_NAME, e.to_string()))?;

        Ok(CommandResult::Response(RespValue::ok()))
    }
}

#[async_trait]
impl Plugin for ReplicationPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: PLUGIN_NAME,
            commands: vec![
                CommandSpec::keyless("SYNC"),
                CommandSpec::control("LOAD", "type:string len:int bytes:bytes", 3),
                CommandSpec::control("SLAVEOF", "port:int", 1),
            ],
            types: vec![],
        }
    }

    async fn handle(
        &self,
        command: &Command,
        _entry: Option<Arc<Entry>>,
        session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        match command.name().to_ascii_uppercase().as_str() {
            "SYNC" => Self::sync(session).await,
            "LOAD" => Self::load(command, session).await,
            "SLAVEOF" => Self::slave_of(command, session).await,
            _ => Err(CommandError::UnknownCommand(command.name().to_string())),
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    command::Command,
    dump,
    engine::{CommandError, CommandResult, CommandSpec, Entry, Plugin, PluginManifest},
    resp::RespValue,
    session::Session,
};

pub const PLUGIN_NAME: &str = "SYSTEM";

/// Server-level commands that own no data type: `PING`, `INFO` and `SAVE`.
#[derive(Debug)]
pub struct SystemPlugin {
    dump_path: PathBuf,
}

impl SystemPlugin {
    pub fn new(dump_path: impl Into<PathBuf>) -> Self {
        Self {
            dump_path: dump_path.into(),
        }
    }

    async fn info(session: &Arc<Session>) -> RespValue {
        let engine = session.engine();
        let stats = engine.stats();
        let replication = engine.replication();

        let (role, master) = match replication.master().await {
            Some(master) => ("slave", master.address().to_string()),
            None => ("master", String::new()),
        };
        let master_state = replication.state().await;
        let keys = engine.keyspace_len().await;

        let lines = [
            "# Server".to_string(),
            format!("plugins:{}", engine.plugins().join(",")),
            "# Clients".to_string(),
            format!("active_sessions:{}", stats.active_sessions),
            format!("total_sessions:{}", stats.total_sessions),
            "# Keyspace".to_string(),
            format!("keys:{}", keys),
            "# Replication".to_string(),
            format!("role:{}", role),
            format!("master:{}", master),
            format!("master_state:{}", master_state),
            format!("sinks:{}", engine.sink_count()),
        ];

        RespValue::bulk(lines.join("\r\n"))
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: PLUGIN_NAME,
            commands: vec![
                CommandSpec::keyless("PING"),
                CommandSpec::keyless("INFO"),
                CommandSpec::keyless("SAVE"),
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
        let response = match command.name().to_ascii_uppercase().as_str() {
            "PING" if command.key().is_empty() => RespValue::SimpleString("PONG".to_string()),
            "PING" => RespValue::bulk(command.key().to_string()),
            "INFO" => Self::info(session).await,
            "SAVE" => {
                dump::save(session.engine(), &self.dump_path)
                    .await
                    .map_err(|e| CommandError::plugin(PLUGIN_NAME, e.to_string()))?;

                RespValue::ok()
            }
            _ => return Err(CommandError::UnknownCommand(command.name().to_string())),
        };

        Ok(CommandResult::Response(response))
    }
}

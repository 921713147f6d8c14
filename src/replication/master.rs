use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    command::Command,
    engine::Engine,
    input::read_command,
    replication::{MasterAddress, ReplicationError},
    session::Session,
};

const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// Where a replica stands with respect to its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Offline,
    PendingSync,
    SyncInProgress,
    Live,
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MasterState::Offline => "offline",
            MasterState::PendingSync => "pending_sync",
            MasterState::SyncInProgress => "sync_in_progress",
            MasterState::Live => "live",
        };

        write!(f, "{}", name)
    }
}

/// The replica's record of one master.
///
/// A record is never re-pointed at another address: attaching elsewhere
/// creates a new `Master`.
pub struct Master {
    address: MasterAddress,
    state: Mutex<MasterState>,
    connection: tokio::sync::Mutex<Option<TcpStream>>,
    stop: watch::Sender<bool>,
}

impl Master {
    pub fn new(address: MasterAddress) -> Self {
        let (stop, _) = watch::channel(false);

        Self {
            address,
            state: Mutex::new(MasterState::Offline),
            connection: tokio::sync::Mutex::new(None),
            stop,
        }
    }

    pub fn address(&self) -> &MasterAddress {
        &self.address
    }

    pub fn state(&self) -> MasterState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves from `from` to `to`, returning whether the state was `from`.
    ///
    /// A disconnect racing with the streaming task is never undone by a later
    /// forward transition.
    fn transition(&self, from: MasterState, to: MasterState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if *state != from {
            return false;
        }

        *state = to;
        info!(master = %self.address, "replication state {} -> {}", from, to);

        true
    }

    /// Opens the TCP connection to the master.
    ///
    /// Only valid from `OFFLINE`; moves the record to `PENDING_SYNC`.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ReplicationError> {
        if self.state() != MasterState::Offline {
            warn!(master = %self.address, "could not connect to a connected master");
            return Err(ReplicationError::AlreadyConnected(self.address.clone()));
        }

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((self.address.host.as_str(), self.address.port)),
        )
        .await
        .map_err(|_| ReplicationError::Connect {
            address: self.address.clone(),
            reason: "timed out".to_string(),
        })?
        .map_err(|e| ReplicationError::Connect {
            address: self.address.clone(),
            reason: e.to_string(),
        })?;

        *self.connection.lock().await = Some(stream);

        if !self.transition(MasterState::Offline, MasterState::PendingSync) {
            self.connection.lock().await.take();
            return Err(ReplicationError::AlreadyConnected(self.address.clone()));
        }

        info!(master = %self.address, "connected to master");

        Ok(())
    }

    /// Forces the record to `OFFLINE` and closes the connection. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state != MasterState::Offline {
                info!(master = %self.address, "replication state {} -> offline", *state);
                *state = MasterState::Offline;
            }
        }

        self.stop.send_replace(true);
        self.connection.lock().await.take();
    }

    /// The streaming loop, run once per attached master.
    ///
    /// Any fault ends the loop and leaves the record `OFFLINE`; there is no
    /// automatic reconnect.
    pub async fn run(self: Arc<Self>, engine: Arc<Engine>) {
        match self.stream(&engine).await {
            Ok(()) => info!(master = %self.address, "replication stream stopped"),
            Err(e) => warn!(master = %self.address, "replication stream failed: {}", e),
        }

        self.disconnect().await;
    }

    async fn stream(&self, engine: &Arc<Engine>) -> Result<(), ReplicationError> {
        let Some(stream) = self.connection.lock().await.take() else {
            return Err(ReplicationError::NotAttached);
        };

        let local_address = stream
            .local_addr()
            .map(|address| address.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, reader);

        let sync = Command::new("SYNC", "", Vec::new()).to_resp();
        writer.write_all(&sync.encode()).await?;
        writer.flush().await?;

        if !self.transition(MasterState::PendingSync, MasterState::SyncInProgress) {
            return Ok(());
        }

        let session = Session::pseudo(engine, format!("replication:{}", local_address));
        let mut stop = self.stop.subscribe();
        let mut pending = VecDeque::new();

        let result = loop {
            let command = tokio::select! {
                command = read_command(&mut reader) => command,
                _ = stop.wait_for(|stopped| *stopped) => break Ok(()),
            };

            let command = match command {
                Ok(command) => command,
                Err(e) => break Err(ReplicationError::from(e)),
            };

            if let Err(e) = self.apply(command, &session, &mut pending).await {
                break Err(e);
            }
        };

        session.stop();

        result
    }

    /// Applies one frame from the master.
    ///
    /// `LOAD` frames are bootstrap transfer and apply in any state. Other
    /// commands are only applied once `LIVE`; until the master acknowledges
    /// the `SYNC` they are queued and then replayed in order.
    async fn apply(
        &self,
        command: Command,
        session: &Arc<Session>,
        pending: &mut VecDeque<Command>,
    ) -> Result<(), ReplicationError> {
        if let Some(status) = command.name().strip_prefix('+') {
            if status.eq_ignore_ascii_case("OK")
                && self.transition(MasterState::SyncInProgress, MasterState::Live)
            {
                info!(
                    master = %self.address,
                    queued = pending.len(),
                    "bootstrap acknowledged"
                );

                while let Some(command) = pending.pop_front() {
                    apply_command(&command, session).await;
                }
            } else {
                debug!(master = %self.address, "ignoring status line '{}'", status);
            }

            return Ok(());
        }

        if let Some(message) = command.name().strip_prefix('-') {
            return Err(ReplicationError::MasterRejected(message.to_string()));
        }

        if command.name().eq_ignore_ascii_case("LOAD") || self.state() == MasterState::Live {
            apply_command(&command, session).await;
        } else {
            pending.push_back(command);
        }

        Ok(())
    }
}

async fn apply_command(command: &Command, session: &Arc<Session>) {
    if let Err(e) = session.engine().dispatch(command, session).await {
        warn!(
            command = command.name(),
            key = command.key(),
            "error applying replicated command: {}",
            e
        );
    }
}

impl fmt::Display for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Master({})", self.address)
    }
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

//! Master-slave replication, replica side.
//!
//! A replica attaches to at most one master at a time. `SLAVEOF host port`
//! goes through [`ReplicationManager::slave_of`], which connects, sends
//! `SYNC` and spawns the streaming loop; `SLAVEOF NO ONE` goes through
//! [`ReplicationManager::disconnect`]. The master side lives in the
//! replication plugin (`SYNC`) and in the engine's sink forwarding.

mod master;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub use master::{Master, MasterState};

use crate::{engine::Engine, input::ProtocolError};

#[derive(Error, Debug, PartialEq)]
pub enum ReplicationError {
    #[error("already connected to master {0}")]
    AlreadyConnected(MasterAddress),
    #[error("already replicating from {0}")]
    SameMaster(MasterAddress),
    #[error("could not connect to master {address}: {reason}")]
    Connect {
        address: MasterAddress,
        reason: String,
    },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("master rejected replication: {0}")]
    MasterRejected(String),
    #[error("not attached to a master")]
    NotAttached,
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddress {
    pub host: String,
    pub port: u16,
}

impl MasterAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for MasterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for MasterAddress {
    type Err = String;

    /// Parses `"<host> <port>"`, the form used by `--replicaof`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split_whitespace().collect();

        let [host, port] = parts.as_slice() else {
            return Err(format!("expected '<host> <port>', got '{}'", input));
        };

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| format!("invalid port number '{}'", port))?;

        Ok(Self::new(*host, port))
    }
}

/// Holds the current master record, if any.
pub struct ReplicationManager {
    current: Mutex<Option<Arc<Master>>>,
    connect_timeout: Duration,
}

impl ReplicationManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            connect_timeout,
        }
    }

    /// Attaches to the master at `address` and starts streaming from it.
    ///
    /// An attached master at another address is disconnected first.
    /// Attaching again to the master already attached is an error. When the
    /// connection cannot be made no record is kept and the replica stays
    /// `OFFLINE`. The record lock is not held while connecting.
    pub async fn slave_of(
        &self,
        engine: &Arc<Engine>,
        address: MasterAddress,
    ) -> Result<Arc<Master>, ReplicationError> {
        let previous = {
            let mut current = self.current.lock().await;

            let same_master = current.as_ref().is_some_and(|master| {
                master.address() == &address && master.state() != MasterState::Offline
            });
            if same_master {
                return Err(ReplicationError::SameMaster(address));
            }

            current.take()
        };

        if let Some(master) = previous {
            info!("disconnecting from {} first", master);
            master.disconnect().await;
        }

        let master = Arc::new(Master::new(address));
        master.connect(self.connect_timeout).await?;

        {
            let mut current = self.current.lock().await;

            // Another SLAVEOF may have attached while this one was connecting.
            if let Some(other) = current.as_ref() {
                let err = ReplicationError::AlreadyConnected(other.address().clone());
                drop(current);
                master.disconnect().await;
                return Err(err);
            }

            info!("setting new master to {}", master);
            *current = Some(Arc::clone(&master));
        }

        tokio::spawn(Arc::clone(&master).run(Arc::clone(engine)));

        Ok(master)
    }

    /// Detaches from the current master and drops its record.
    ///
    /// Returns `false` when there was no master.
    pub async fn disconnect(&self) -> bool {
        let Some(master) = self.current.lock().await.take() else {
            return false;
        };

        master.disconnect().await;
        info!("disconnected from {}", master);

        true
    }

    pub async fn master(&self) -> Option<Arc<Master>> {
        self.current.lock().await.clone()
    }

    pub async fn state(&self) -> MasterState {
        match self.current.lock().await.as_ref() {
            Some(master) => master.state(),
            None => MasterState::Offline,
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

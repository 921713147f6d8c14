//! The persistence dump.
//!
//! A dump is nothing but a sequence of `LOAD` frames, encoded with the same
//! codec clients and masters use, so loading one goes through
//! [`read_command`] and [`Engine::load_serialized_entry`] exactly like a
//! replication bootstrap does.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{info, warn};

use crate::{
    engine::{CommandError, Engine, SerializedEntry},
    input::{ProtocolError, read_command},
};

#[derive(Error, Debug, PartialEq)]
pub enum DumpError {
    #[error("I/O error on dump file: {0}")]
    Io(String),
    #[error("malformed dump file: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected '{0}' frame in dump file, only LOAD is allowed")]
    UnexpectedCommand(String),
    #[error("could not load entry: {0}")]
    Entry(#[from] CommandError),
}

impl From<std::io::Error> for DumpError {
    fn from(err: std::io::Error) -> Self {
        DumpError::Io(err.to_string())
    }
}

/// Writes every entry of `engine` to `path`.
///
/// The dump is written to a sibling temporary file first and renamed over
/// `path`; a failed save leaves the previous dump intact. Returns the number
/// of entries written.
pub async fn save(engine: &Engine, path: &Path) -> Result<usize, DumpError> {
    let entries = engine.snapshot().await;
    let tmp_path = tmp_path(path);

    let file = File::create(&tmp_path).await?;
    let mut writer = BufWriter::new(file);
    let mut buffer = BytesMut::new();

    for entry in &entries {
        buffer.clear();
        entry.to_load_command().encode_into(&mut buffer);
        writer.write_all(&buffer).await?;
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    drop(writer);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    info!(path = %path.display(), entries = entries.len(), "saved dump");

    Ok(entries.len())
}

/// Loads the dump at `path` into `engine`. A missing file loads nothing.
///
/// Returns the number of entries loaded.
pub async fn load(engine: &Engine, path: &Path) -> Result<usize, DumpError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no dump file, starting empty");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut loaded = 0;

    loop {
        let command = match read_command(&mut reader).await {
            Ok(command) => command,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(e) => return Err(e.into()),
        };

        if !command.name().eq_ignore_ascii_case("LOAD") {
            return Err(DumpError::UnexpectedCommand(command.name().to_string()));
        }

        let serialized = SerializedEntry::from_load_command(&command)?;
        engine.load_serialized_entry(&serialized).await?;
        loaded += 1;
    }

    info!(path = %path.display(), entries = loaded, "loaded dump");

    Ok(loaded)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{
    engine::Engine,
    input::{ProtocolError, read_command},
    resp::RespValue,
    session::Session,
};

/// Serves one client connection until it closes or its session stops.
///
/// Three tasks cooperate through the session's bounded queues: this one
/// decodes commands off the socket, a spawned one runs the session loop and
/// another writes replies back. When the client stops sending, every command
/// already read is executed and its reply written before the session stops.
/// A protocol error closes the connection at once.
pub async fn handle_client_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
    client_address: String,
) {
    let (reader, writer) = stream.into_split();
    let session = Session::new(&engine, client_address);

    info!(session = session.id(), "accepted client connection");

    let executor = tokio::spawn(Arc::clone(&session).run());
    let replier = tokio::spawn(write_replies(writer, Arc::clone(&session)));

    let mut reader = BufReader::new(reader);
    match read_commands(&mut reader, &session).await {
        Ok(()) | Err(ProtocolError::ConnectionClosed) => {
            debug!(session = session.id(), "client closed connection");

            session.close_inbound();
            let _ = executor.await;
            session.close_outbound();
            let _ = replier.await;

            session.stop();
        }
        Err(e) => {
            warn!(session = session.id(), "closing connection: {}", e);

            session.stop();
            let _ = executor.await;
            let _ = replier.await;
        }
    }
}

/// Feeds decoded commands to the session until the stream fails or the
/// session stops.
async fn read_commands<R>(reader: &mut R, session: &Arc<Session>) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let command = tokio::select! {
            command = read_command(reader) => command?,
            _ = session.stopped() => return Ok(()),
        };

        debug!(
            session = session.id(),
            command = command.name(),
            key = command.key(),
            "received command"
        );

        if !session.submit(command).await {
            return Ok(());
        }
    }
}

/// Writes every reply the session produces, stopping the session if the
/// socket fails.
async fn write_replies<W>(mut writer: W, session: Arc<Session>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = session.receive().await {
        if let Err(e) = write_to_stream(&mut writer, &reply).await {
            warn!(session = session.id(), "error writing to stream: {}", e);
            session.stop();
            break;
        }
    }
}

pub async fn write_to_stream<W>(writer: &mut W, value: &RespValue) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&value.encode()).await?;
    writer.flush().await?;

    Ok(())
}

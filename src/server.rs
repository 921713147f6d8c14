use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::{connection::handle_client_connection, engine::Engine};

/// The TCP front end: accepts clients and gives each one a session.
pub struct Server {
    listener: TcpListener,
    engine: Arc<Engine>,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(address: A, engine: Arc<Engine>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self::new(listener, engine))
    }

    pub fn new(listener: TcpListener, engine: Arc<Engine>) -> Self {
        Self { listener, engine }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Accepts connections until `shutdown` resolves, then shuts the engine
    /// down, stopping every live session.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, engine } = self;
        tokio::pin!(shutdown);

        if let Ok(address) = listener.local_addr() {
            info!("listening on {}", address);
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => handle_accept_result(accept_result, &engine),
            }
        }

        info!("listener stopped");
        engine.shutdown().await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to install ctrl-c handler: {}", e);
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, engine: &Arc<Engine>) {
    match result {
        Ok((stream, client_address)) => {
            tokio::spawn(handle_client_connection(
                stream,
                Arc::clone(engine),
                client_address.to_string(),
            ));
        }
        Err(e) => warn!("failed to accept connection: {}", e),
    }
}

//! The TCP listener.
//!
//! Accepts connections and hands each one a copy of the shared
//! Diffie-Hellman parameters. The parameters come from the configuration
//! when a prime was persisted; otherwise they are generated once, on the
//! first accept, and logged so the operator can persist them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::diffie_hellman::DhParams;
use crate::message::{Message, MessageQueue};

pub struct TcpServer {
    listener: TcpListener,
    diffie_hellman: Option<DhParams>,
    message_queue: Arc<MessageQueue<Message>>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl TcpServer {
    /// Validate the configuration and bind the listener.
    pub async fn bind(
        config: ServerConfig,
        message_queue: Arc<MessageQueue<Message>>,
    ) -> anyhow::Result<TcpServer> {
        config.validate()?;

        let address = config.socket_addr()?;
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("binding listener to {address}"))?;

        info!("listening on {}", listener.local_addr()?);

        let diffie_hellman = match &config.dh_prime {
            Some(prime) => Some(DhParams::load_hex(prime)?),
            None => None,
        };

        Ok(TcpServer {
            listener,
            diffie_hellman,
            message_queue,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn message_queue(&self) -> &Arc<MessageQueue<Message>> {
        &self.message_queue
    }

    /// A snapshot of the live connections, for broadcasting.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .clone()
    }

    /// Accept connections forever. An accept failure is logged and does
    /// not stop the listener.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };

            debug!("new connection from {}", peer);

            let parameters = match self.ensure_diffie_hellman().await {
                Ok(parameters) => parameters,
                Err(e) => {
                    error!("failed to generate Diffie-Hellman parameters: {e:#}");
                    continue;
                }
            };

            let connection = Connection::accepted(stream, parameters, self.message_queue.clone());

            let mut connections = self
                .connections
                .lock()
                .expect("connection registry poisoned");
            connections.retain(|c| c.status() != ConnectionStatus::NotConnected);
            connections.push(connection);
        }
    }

    async fn ensure_diffie_hellman(&mut self) -> anyhow::Result<DhParams> {
        if let Some(parameters) = &self.diffie_hellman {
            return Ok(parameters.clone());
        }

        // Prime generation is CPU heavy; keep it off the accept loop's
        // reactor thread.
        let parameters = tokio::task::spawn_blocking(DhParams::generate)
            .await
            .context("Diffie-Hellman generation task failed")?;

        warn!(
            "please add the following to your configuration: <prime>{}</prime>",
            parameters.prime_hex()
        );

        self.diffie_hellman = Some(parameters.clone());
        Ok(parameters)
    }
}

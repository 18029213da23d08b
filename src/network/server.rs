use crate::crypto::SubjectName;
use crate::issuance::{IssuancePool, DEFAULT_SHUTDOWN_GRACE};
use crate::network::protocol::{self, ProtocolError, WireConfig};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

pub const MAX_CONNECTIONS: usize = 1000;

pub struct Server {
    listener: TcpListener,
    pool: Arc<IssuancePool>,
    wire_config: WireConfig,
}

impl Server {
    pub async fn bind(addr: &str, pool: Arc<IssuancePool>, wire_config: WireConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind server to address: {}", addr))?;

        info!("Server successfully bound to address: {}", addr);
        debug!(
            "Wire config - max_name_len: {}, read_timeout: {:?}, write_timeout: {:?}",
            wire_config.max_name_len, wire_config.read_timeout, wire_config.write_timeout
        );

        Ok(Self {
            listener,
            pool,
            wire_config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serve until ctrl-c
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then drain the pool and open connections
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Server started on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        let mut active_connections: HashMap<usize, JoinHandle<()>> = HashMap::new();
        let mut connection_counter = 0usize;

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            connection_counter += 1;
            let connection_id = connection_counter;

            active_connections.retain(|id, handle| {
                if handle.is_finished() {
                    debug!("Cleaning up completed connection {}", id);
                    false
                } else {
                    true
                }
            });

            if active_connections.len() >= MAX_CONNECTIONS {
                warn!(
                    "Connection limit reached ({}), rejecting connection from {}",
                    MAX_CONNECTIONS, peer_addr
                );
                continue;
            }

            debug!("Accepted connection {} from {}", connection_id, peer_addr);
            let pool = Arc::clone(&self.pool);
            let wire_config = self.wire_config.clone();
            let handle = task::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, pool, wire_config, connection_id, peer_addr)
                        .await
                {
                    warn!("Connection {} failed: {:#}", connection_id, e);
                }
            });
            active_connections.insert(connection_id, handle);
        }

        // New clients are refused while the pool drains
        drop(self.listener);
        debug!("Listener closed");

        // Waiting clients are answered with a shutdown error by the pool
        self.pool.shutdown(DEFAULT_SHUTDOWN_GRACE).await;

        let deadline = tokio::time::Instant::now() + self.wire_config.write_timeout;
        for (id, mut handle) in active_connections {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                debug!("Aborting connection {} on shutdown", id);
                handle.abort();
            }
        }

        info!("Server stopped. Final stats: {}", self.pool.stats());
        Ok(())
    }

    #[instrument(skip_all, fields(connection_id = connection_id, peer = %peer_addr))]
    async fn handle_connection(
        stream: TcpStream,
        pool: Arc<IssuancePool>,
        wire_config: WireConfig,
        connection_id: usize,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let line = match protocol::read_request(&mut reader, &wire_config).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) => {
                reject(&mut writer, &e.to_string(), &wire_config).await;
                return Err(e.into());
            }
        };

        let subject = match SubjectName::parse(&line, wire_config.max_name_len) {
            Ok(subject) => subject,
            Err(e) => {
                info!("Rejected request: {}", e);
                reject(&mut writer, &e.to_string(), &wire_config).await;
                return Ok(());
            }
        };

        let started = Instant::now();
        info!("Got request for {}", subject);

        match pool.request(subject.clone()).await {
            Ok(issued) => {
                info!(
                    "Got result for {} after {:?} (fingerprint {})",
                    subject,
                    started.elapsed(),
                    issued.fingerprint
                );
                protocol::write_response(&mut writer, &issued, &wire_config)
                    .await
                    .context("Failed to send issued key")?;
            }
            Err(e) => {
                warn!("No result for {}: {}", subject, e);
                reject(&mut writer, &e.to_string(), &wire_config).await;
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Error closing connection: {}", e);
        }
        Ok(())
    }
}

/// Best-effort error line; the connection is closed either way
async fn reject<W>(writer: &mut W, reason: &str, wire_config: &WireConfig)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if let Err(e) = protocol::write_error(writer, reason, wire_config).await {
        match e {
            ProtocolError::WriteTimeout { .. } => debug!("Timed out sending error line"),
            _ => debug!("Failed to send error line: {}", e),
        }
    }
}

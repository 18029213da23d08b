use crate::network::protocol::ERROR_PREFIX;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

pub const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Large keys can take minutes to generate
pub const CLIENT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_RESPONSE_SIZE: u64 = 1024 * 1024;

const PUBLIC_KEY_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server closed the connection without a response")]
    EmptyResponse,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// PEM documents returned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedBundle {
    pub public_key_pem: String,
    pub certificate_pem: String,
}

impl IssuedBundle {
    /// Split a raw server response into its two PEM documents
    pub fn parse(response: &str) -> Result<Self, ClientError> {
        let trimmed = response.trim_start();
        if trimmed.is_empty() {
            return Err(ClientError::EmptyResponse);
        }
        if let Some(reason) = trimmed.strip_prefix(ERROR_PREFIX) {
            return Err(ClientError::Server(reason.trim().to_string()));
        }

        let normalized = trimmed.replace("\r\n", "\n");
        let (public_key, certificate) = normalized
            .split_once("\n\n")
            .ok_or_else(|| ClientError::Malformed("missing blank separator line".to_string()))?;

        let public_key = public_key.trim();
        let certificate = certificate.trim();
        if !public_key.starts_with(PUBLIC_KEY_HEADER) {
            return Err(ClientError::Malformed("missing public key".to_string()));
        }
        if !certificate.starts_with(CERTIFICATE_HEADER) {
            return Err(ClientError::Malformed("missing certificate".to_string()));
        }

        Ok(Self {
            public_key_pem: format!("{}\n", public_key),
            certificate_pem: format!("{}\n", certificate),
        })
    }

    /// Write `public_key.pem` and `certificate.pem` into `dir`
    pub fn save(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let key_path = dir.join("public_key.pem");
        let cert_path = dir.join("certificate.pem");
        std::fs::write(&key_path, &self.public_key_pem)?;
        std::fs::write(&cert_path, &self.certificate_pem)?;
        Ok((key_path, cert_path))
    }
}

pub struct Client {
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(CLIENT_CONNECT_TIMEOUT, CLIENT_RESPONSE_TIMEOUT)
    }
}

impl Client {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            response_timeout,
        }
    }

    /// Ask the server at `addr` for a key and certificate for `name`
    #[instrument(skip(self))]
    pub async fn request(&self, addr: &str, name: &str) -> Result<IssuedBundle, ClientError> {
        let response = self.request_raw(addr, name).await?;
        IssuedBundle::parse(&response)
    }

    /// Send `name` and return the response text as received
    pub async fn request_raw(&self, addr: &str, name: &str) -> Result<String, ClientError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(self.connect_timeout))?
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        debug!("Connected to {}", addr);

        stream.write_all(format!("{}\n", name).as_bytes()).await?;
        stream.flush().await?;

        let mut response = String::new();
        tokio::time::timeout(
            self.response_timeout,
            (&mut stream)
                .take(MAX_RESPONSE_SIZE)
                .read_to_string(&mut response),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.response_timeout))??;

        debug!("Received {} bytes from {}", response.len(), addr);
        Ok(response)
    }
}

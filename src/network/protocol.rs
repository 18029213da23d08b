use crate::crypto::IssuedKey;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

// Line protocol constants
pub const DEFAULT_MAX_NAME_LEN: usize = 256;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const ERROR_PREFIX: &str = "ERROR:";

/// Limits applied to every connection
#[derive(Debug, Clone)]
pub struct WireConfig {
    pub max_name_len: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_name_len: DEFAULT_MAX_NAME_LEN,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl WireConfig {
    pub fn new(max_name_len: usize, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            max_name_len,
            read_timeout,
            write_timeout,
        }
    }

    /// Short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            max_name_len: DEFAULT_MAX_NAME_LEN,
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Read timeout after {timeout:?}")]
    ReadTimeout { timeout: Duration },

    #[error("Write timeout after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("Request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Request is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the single request line.
///
/// Returns `Ok(None)` when the peer closed the connection without sending
/// anything. A final line without a terminator is accepted.
pub async fn read_request<R>(
    reader: &mut R,
    config: &WireConfig,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the name plus "\r\n"
    let limit = config.max_name_len + 2;
    let mut buf = Vec::with_capacity(64);

    let read = tokio::time::timeout(
        config.read_timeout,
        (&mut *reader).take(limit as u64).read_until(b'\n', &mut buf),
    )
    .await
    .map_err(|_| ProtocolError::ReadTimeout {
        timeout: config.read_timeout,
    })??;

    if read == 0 {
        debug!("Peer closed before sending a request");
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > config.max_name_len {
        return Err(ProtocolError::LineTooLong {
            limit: config.max_name_len,
        });
    }

    let line = String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)?;
    trace!("Read request line of {} bytes", line.len());
    Ok(Some(line))
}

/// Write the public key and certificate for a successful request
pub async fn write_response<W>(
    writer: &mut W,
    issued: &IssuedKey,
    config: &WireConfig,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_with_timeout(writer, issued.to_response().as_bytes(), config.write_timeout).await
}

/// Write a single `ERROR: <reason>` line
pub async fn write_error<W>(
    writer: &mut W,
    reason: &str,
    config: &WireConfig,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let reason = reason.replace(['\r', '\n'], " ");
    let line = format!("{} {}\n", ERROR_PREFIX, reason);
    write_with_timeout(writer, line.as_bytes(), config.write_timeout).await
}

async fn write_with_timeout<W>(
    writer: &mut W,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ProtocolError::WriteTimeout { timeout })??;
    Ok(())
}

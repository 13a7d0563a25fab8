//! Full-duplex byte relay between a client and its backend.
//!
//! Both directions are raw byte pipes. The first direction to stop (orderly
//! close, read error or write error) ends the relay: the other direction is
//! cancelled, both write halves are shut down and both streams are dropped.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Buffer size for each relay direction.
pub const DEFAULT_RELAY_BUFFER_BYTES: usize = 1024;

/// Which leg of the relay stopped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Outcome of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client -> backend (excluding the forwarded handshake).
    pub bytes_to_backend: u64,
    /// Bytes copied backend -> client.
    pub bytes_from_backend: u64,
    /// Leg that terminated the relay.
    pub closed_by: Direction,
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_bytes: usize,
    /// Close the relay if a read waits longer than this. `None` never times out.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: DEFAULT_RELAY_BUFFER_BYTES,
            idle_timeout: None,
        }
    }
}

/// Relay bytes between `client` and `backend` until either direction stops.
///
/// Takes ownership of both streams; they are closed when this returns.
pub async fn relay<C, B>(client: C, backend: B, config: &RelayConfig) -> RelayStats
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut bytes_to_backend = 0u64;
    let mut bytes_from_backend = 0u64;

    let (closed_by, result) = {
        let upstream = copy_direction(
            &mut client_read,
            &mut backend_write,
            config,
            &mut bytes_to_backend,
        );
        let downstream = copy_direction(
            &mut backend_read,
            &mut client_write,
            config,
            &mut bytes_from_backend,
        );

        // The losing direction is dropped here, which ends its pending read.
        tokio::select! {
            r = upstream => (Direction::ClientToBackend, r),
            r = downstream => (Direction::BackendToClient, r),
        }
    };

    if let Err(e) = result {
        debug!(direction = ?closed_by, error = %e, "Relay direction failed");
    }

    let _ = client_write.shutdown().await;
    let _ = backend_write.shutdown().await;

    RelayStats {
        bytes_to_backend,
        bytes_from_backend,
        closed_by,
    }
}

/// Copy from `reader` to `writer` until EOF or error.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &RelayConfig,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.buffer_bytes];
    loop {
        let read_result = if let Some(timeout) = config.idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result? {
            0 => return Ok(()),
            n => {
                writer.write_all(&buf[..n]).await?;
                *total += n as u64;
            }
        }
    }
}

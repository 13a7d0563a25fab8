//! Hostname extraction from the opening handshake.
//!
//! The handshake carries the requested hostname at a fixed offset:
//!
//! ```text
//! +----------+-----+----------------+-------
//! | prefix   | len | hostname       | rest of handshake (opaque)
//! | 4 bytes  | 1   | len bytes      |
//! +----------+-----+----------------+-------
//! ```
//!
//! Only the first read from the client is inspected. A handshake split across
//! reads so that the hostname is incomplete yields an empty host, which the
//! router treats like any other unknown name.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::warn;

/// Bytes preceding the hostname length field.
pub const PREFIX_LEN: usize = 4;

/// Smallest buffer that can hold a (zero-length) hostname field.
pub const MIN_HANDSHAKE_LEN: usize = PREFIX_LEN + 1;

/// Maximum bytes read from the client before routing.
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 1024;

/// Configuration for the initial read.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Read ceiling for the single inspected read.
    pub max_bytes: usize,
    /// Deadline for the first read. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
            timeout: None,
        }
    }
}

/// Reads the opening bytes of a client connection.
pub struct HandshakeInspector {
    config: HandshakeConfig,
}

impl HandshakeInspector {
    pub fn new() -> Self {
        Self {
            config: HandshakeConfig::default(),
        }
    }

    pub fn with_config(config: HandshakeConfig) -> Self {
        Self { config }
    }

    /// Perform a single read of up to `max_bytes` into `buffer`.
    ///
    /// On success `buffer` holds exactly the bytes read; the caller must
    /// forward them to the backend. A client that closes before sending
    /// anything leaves `buffer` empty.
    pub async fn read_initial<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<usize> {
        buffer.clear();
        buffer.resize(self.config.max_bytes, 0);

        let read = match self.config.timeout {
            Some(deadline) => match timeout(deadline, stream.read(&mut buffer[..])).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = deadline.as_millis() as u64, "Handshake read timeout");
                    Err(io::Error::new(io::ErrorKind::TimedOut, "handshake read timeout"))
                }
            },
            None => stream.read(&mut buffer[..]).await,
        };

        match read {
            Ok(n) => {
                buffer.truncate(n);
                Ok(n)
            }
            Err(e) => {
                buffer.clear();
                Err(e)
            }
        }
    }
}

impl Default for HandshakeInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the hostname field from a handshake buffer.
///
/// Returns an empty string when the buffer is too short or the declared
/// length exceeds the bytes that follow it. Hostname bytes are not validated;
/// invalid UTF-8 is decoded lossily.
pub fn extract_host(buf: &[u8]) -> String {
    if buf.len() < MIN_HANDSHAKE_LEN {
        return String::new();
    }

    let host_len = buf[PREFIX_LEN] as usize;
    let remaining = &buf[MIN_HANDSHAKE_LEN..];
    if remaining.len() < host_len {
        return String::new();
    }

    String::from_utf8_lossy(&remaining[..host_len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn handshake(prefix: [u8; 4], host: &[u8], trailer: &[u8]) -> Vec<u8> {
        let mut buf = prefix.to_vec();
        buf.push(host.len() as u8);
        buf.extend_from_slice(host);
        buf.extend_from_slice(trailer);
        buf
    }

    #[test]
    fn test_extract_host_found() {
        let buf = handshake([0x10, 0x00, 0xff, 0x05], b"play.example.com", &[0x63, 0xdd, 0x02]);
        assert_eq!(extract_host(&buf), "play.example.com");
    }

    #[test]
    fn test_extract_host_exact_fit() {
        let buf = handshake([0; 4], b"a.b", &[]);
        assert_eq!(extract_host(&buf), "a.b");
    }

    #[test]
    fn test_extract_host_zero_length() {
        assert_eq!(extract_host(&[1, 2, 3, 4, 0]), "");
        assert_eq!(extract_host(&[1, 2, 3, 4, 0, b'x']), "");
    }

    #[test]
    fn test_extract_host_too_short() {
        assert_eq!(extract_host(&[]), "");
        assert_eq!(extract_host(&[0x10, 0x00, 0xff, 0x05]), "");
    }

    #[test]
    fn test_extract_host_length_one_past_end() {
        // Declared length is one more than what follows.
        let buf = [0, 0, 0, 0, 4, b'a', b'b', b'c'];
        assert_eq!(extract_host(&buf), "");
    }

    #[test]
    fn test_extract_host_max_length_byte() {
        let mut buf = vec![0, 0, 0, 0, 0xff];
        buf.extend(std::iter::repeat(b'x').take(10));
        assert_eq!(extract_host(&buf), "");
    }

    #[test]
    fn test_extract_host_invalid_utf8_is_lossy() {
        let buf = handshake([0; 4], &[b'a', 0xff, b'b'], &[]);
        assert_eq!(extract_host(&buf), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_read_initial_single_read() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(4096);
        server.write_all(&[0, 0, 0, 0, 3, b'a']).await.unwrap();

        let inspector = HandshakeInspector::new();
        let mut buffer = Vec::new();
        let n = inspector.read_initial(&mut client, &mut buffer).await.unwrap();
        server.write_all(b"bc").await.unwrap();

        assert_eq!(n, 6);
        assert_eq!(buffer, vec![0, 0, 0, 0, 3, b'a']);
        // Split handshake: the hostname is incomplete in the first read.
        assert_eq!(extract_host(&buffer), "");
    }

    #[tokio::test]
    async fn test_read_initial_respects_ceiling() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(4096);
        server.write_all(&[7u8; 2048]).await.unwrap();

        let inspector = HandshakeInspector::new();
        let mut buffer = Vec::new();
        let n = inspector.read_initial(&mut client, &mut buffer).await.unwrap();

        assert_eq!(n, DEFAULT_MAX_HANDSHAKE_BYTES);
        assert_eq!(buffer.len(), DEFAULT_MAX_HANDSHAKE_BYTES);
    }

    #[tokio::test]
    async fn test_read_initial_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);

        let inspector = HandshakeInspector::new();
        let mut buffer = Vec::new();
        let n = inspector.read_initial(&mut client, &mut buffer).await.unwrap();

        assert_eq!(n, 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_initial_error_clears_buffer() {
        let mut stream = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let inspector = HandshakeInspector::new();
        let mut buffer = vec![1, 2, 3];
        let err = inspector
            .read_initial(&mut stream, &mut buffer)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_initial_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let inspector = HandshakeInspector::with_config(HandshakeConfig {
            max_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
            timeout: Some(Duration::from_millis(20)),
        });

        let mut buffer = Vec::new();
        let err = inspector
            .read_initial(&mut client, &mut buffer)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    proptest! {
        #[test]
        fn prop_short_buffers_yield_empty(buf in proptest::collection::vec(any::<u8>(), 0..MIN_HANDSHAKE_LEN)) {
            prop_assert_eq!(extract_host(&buf), "");
        }

        #[test]
        fn prop_overlong_length_yields_empty(
            prefix in any::<[u8; 4]>(),
            declared in 1u8..=255,
            shortfall in 1usize..=255,
        ) {
            let available = (declared as usize).saturating_sub(shortfall);
            let mut buf = prefix.to_vec();
            buf.push(declared);
            buf.extend(std::iter::repeat(b'h').take(available));
            prop_assert_eq!(extract_host(&buf), "");
        }

        #[test]
        fn prop_well_formed_round_trips(
            prefix in any::<[u8; 4]>(),
            host in "[a-z0-9.-]{0,255}",
            trailer in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let buf = handshake(prefix, host.as_bytes(), &trailer);
            prop_assert_eq!(extract_host(&buf), host);
        }

        #[test]
        fn prop_never_panics(buf in proptest::collection::vec(any::<u8>(), 0..512)) {
            let host = extract_host(&buf);
            prop_assert!(host.len() <= buf.len() * 3);
        }
    }
}

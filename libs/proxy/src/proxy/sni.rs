//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The gateway never terminates TLS. It reads the first record of a new
//! connection, pulls the host name out of the plaintext ClientHello and
//! replays the bytes it read to whichever backend the routing table picks.
//!
//! Every length read from the wire is checked against the bytes actually
//! supplied, so arbitrary input can only produce an [`SniError`].

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default time allowed for a client to deliver its first TLS record.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default peek size: one record header plus the largest record TLS allows.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = RECORD_HEADER_LEN + MAX_RECORD_LEN;

const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// client_version (2) + random (32).
const HELLO_FIXED_LEN: usize = 34;
const MAX_SESSION_ID_LEN: usize = 32;

/// Classified ClientHello parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SniError {
    /// Record type is not Handshake, or the message is not a ClientHello.
    #[error("not a TLS handshake")]
    NotATlsHandshake,

    /// Record version below TLS 1.0 (3.1).
    #[error("unsupported TLS record version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// A length field points past the end of the supplied bytes.
    #[error("truncated ClientHello")]
    Truncated,

    /// A fixed ClientHello field holds an impossible value.
    #[error("malformed ClientHello")]
    MalformedHello,

    /// Inconsistent lengths inside the extensions block.
    #[error("malformed ClientHello extension")]
    MalformedExtension,
}

/// Failure while sniffing a live connection.
#[derive(Debug, Error)]
pub enum SniffError {
    /// The client did not deliver a full record in time.
    #[error("timed out waiting for ClientHello")]
    Timeout,

    /// Reading from the client failed.
    #[error("read ClientHello: {0}")]
    Io(#[from] io::Error),

    /// The bytes read are not a usable ClientHello.
    #[error(transparent)]
    Parse(#[from] SniError),
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for SNI data.
    pub timeout: Duration,
    /// Maximum bytes to read. Never less than one record header.
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Reads the first TLS record of a connection and extracts its SNI.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Inspect a stream for SNI, reading into the provided buffer.
    ///
    /// On return the buffer holds every byte consumed from the stream, even
    /// when parsing failed. The caller must forward these bytes to the
    /// backend before relaying.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> Result<String, SniffError> {
        buffer.clear();
        buffer.resize(self.config.max_bytes.max(RECORD_HEADER_LEN), 0);

        let read = timeout(self.config.timeout, self.read_first_record(stream, buffer)).await;
        let bytes_read = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                buffer.clear();
                return Err(SniffError::Io(e));
            }
            Err(_) => {
                buffer.clear();
                warn!(timeout_ms = self.config.timeout.as_millis() as u64, "SNI sniff timeout");
                return Err(SniffError::Timeout);
            }
        };

        buffer.truncate(bytes_read);
        Ok(extract_sni(buffer)?)
    }

    /// Read until the first record is complete, EOF, or the peek limit.
    async fn read_first_record<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut [u8],
    ) -> io::Result<usize> {
        let mut total_read = 0;

        while total_read < RECORD_HEADER_LEN.min(buffer.len()) {
            let n = stream.read(&mut buffer[total_read..]).await?;
            if n == 0 {
                return Ok(total_read);
            }
            total_read += n;
        }

        if buffer[0] != CONTENT_TYPE_HANDSHAKE {
            return Ok(total_read);
        }

        let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
        let target_len = (RECORD_HEADER_LEN + record_len).min(buffer.len());

        while total_read < target_len {
            let n = stream.read(&mut buffer[total_read..target_len]).await?;
            if n == 0 {
                debug!(total_read, target_len, "EOF before end of first record");
                break;
            }
            total_read += n;
        }

        Ok(total_read)
    }
}

/// Extract the host name from the first TLS record in `data`.
///
/// Returns an empty string for a well-formed ClientHello that carries no
/// extensions, or whose extensions hold no host-name entry.
///
/// TLS record:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - record body: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - client version (2), random (32)
/// - session id (1-byte length prefix)
/// - cipher suites (2-byte length prefix)
/// - compression methods (1-byte length prefix)
/// - extensions (2-byte length prefix), optional
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    let mut record = Cursor::new(data);

    let content_type = record.u8().ok_or(SniError::Truncated)?;
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotATlsHandshake);
    }

    let major = record.u8().ok_or(SniError::Truncated)?;
    let minor = record.u8().ok_or(SniError::Truncated)?;
    if (major, minor) < (3, 1) {
        return Err(SniError::UnsupportedVersion { major, minor });
    }

    let record_len = record.u16().ok_or(SniError::Truncated)? as usize;
    let fragment = record.take(record_len).ok_or(SniError::Truncated)?;

    let mut handshake = Cursor::new(fragment);
    let msg_type = handshake.u8().ok_or(SniError::Truncated)?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotATlsHandshake);
    }
    let hello_len = handshake.u24().ok_or(SniError::Truncated)?;
    let hello = handshake.take(hello_len).ok_or(SniError::Truncated)?;

    parse_client_hello(hello)
}

fn parse_client_hello(hello: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(hello);

    cursor.take(HELLO_FIXED_LEN).ok_or(SniError::Truncated)?;

    let session_id_len = cursor.u8().ok_or(SniError::Truncated)? as usize;
    if session_id_len > MAX_SESSION_ID_LEN {
        return Err(SniError::MalformedHello);
    }
    cursor.take(session_id_len).ok_or(SniError::Truncated)?;

    let cipher_suites_len = cursor.u16().ok_or(SniError::Truncated)? as usize;
    if cipher_suites_len % 2 != 0 {
        return Err(SniError::MalformedHello);
    }
    cursor.take(cipher_suites_len).ok_or(SniError::Truncated)?;

    let compression_len = cursor.u8().ok_or(SniError::Truncated)? as usize;
    cursor.take(compression_len).ok_or(SniError::Truncated)?;

    // Extensions are optional in a ClientHello.
    if cursor.is_empty() {
        return Ok(String::new());
    }

    let extensions_len = cursor.u16().ok_or(SniError::Truncated)? as usize;
    let extensions = cursor.take(extensions_len).ok_or(SniError::Truncated)?;
    if !cursor.is_empty() {
        return Err(SniError::MalformedExtension);
    }

    let mut extensions = Cursor::new(extensions);
    while !extensions.is_empty() {
        let ext_type = extensions.u16().ok_or(SniError::MalformedExtension)?;
        let ext_len = extensions.u16().ok_or(SniError::MalformedExtension)? as usize;
        let body = extensions
            .take(ext_len)
            .ok_or(SniError::MalformedExtension)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    Ok(String::new())
}

/// Parse the server_name extension body.
///
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name(body: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(body);

    let list_len = cursor.u16().ok_or(SniError::MalformedExtension)? as usize;
    if cursor.remaining() != list_len {
        return Err(SniError::MalformedExtension);
    }

    while !cursor.is_empty() {
        let name_type = cursor.u8().ok_or(SniError::MalformedExtension)?;
        let name_len = cursor.u16().ok_or(SniError::MalformedExtension)? as usize;
        let name = cursor.take(name_len).ok_or(SniError::MalformedExtension)?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(str::to_owned)
                .map_err(|_| SniError::MalformedExtension);
        }
    }

    Ok(String::new())
}

/// Forward-only view over a byte slice.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.rest.len() < n {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }
}

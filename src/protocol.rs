//! Wire Protocol Module
//!
//! Both TCP services share the same request pattern over TLS:
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |-- [TLS Handshake] ------------------>|
//!   |<----------------- [TLS Established] -|
//!   |                                      |
//!   |-- {JSON header, token?} ------------>|
//!   |<------------- {status, size?, msg?} -|
//!   |                                      |
//!   |   streaming bodies only:             |
//!   |-- "ACK" ---------------------------->|
//!   |<------------- [exactly size bytes] --|
//! ```
//!
//! Headers carry no length prefix. A reader accumulates bytes until they form
//! one complete JSON value, bounded by [`MAX_HEADER_SIZE`]. Readers are
//! buffered, so bytes that arrive right behind a header (a second status
//! header, the start of a body) are kept for the next read.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Deserializer, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound for one JSON header (8 KB)
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Chunk size for streamed bodies (8 KB)
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Acknowledgment the receiver sends before a body is streamed
pub const ACK: &[u8; 3] = b"ACK";

/// Coarse error classes shared by both protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Authorization,
    Resource,
    PartialTransfer,
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(#[source] io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed before a complete header arrived")]
    ConnectionClosed,

    #[error("Header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid acknowledgment")]
    InvalidAck,

    #[error("Source address not allowed: {0}")]
    AllowListRejected(String),

    #[error("Authentication token rejected")]
    AuthRejected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage error: {0}")]
    Storage(#[source] io::Error),

    #[error("Stream closed after {received} of {expected} bytes")]
    PartialTransfer { expected: u64, received: u64 },

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::ConnectFailed { .. }
            | ProtocolError::HandshakeFailed(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::ConnectionClosed => ErrorKind::Transport,
            ProtocolError::HeaderTooLarge(_)
            | ProtocolError::Malformed(_)
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::InvalidAck => ErrorKind::Protocol,
            ProtocolError::AllowListRejected(_) | ProtocolError::AuthRejected => {
                ErrorKind::Authorization
            }
            ProtocolError::NotFound(_)
            | ProtocolError::NotAFile(_)
            | ProtocolError::NotADirectory(_)
            | ProtocolError::InvalidPath(_)
            | ProtocolError::Storage(_) => ErrorKind::Resource,
            ProtocolError::PartialTransfer { .. } => ErrorKind::PartialTransfer,
            ProtocolError::Remote { code, .. } => code.kind(),
        }
    }

    /// Code sent back to the peer when this error ends a request
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::AllowListRejected(_) => ErrorCode::AllowListRejected,
            ProtocolError::AuthRejected => ErrorCode::AuthRejected,
            ProtocolError::HeaderTooLarge(_) | ProtocolError::Malformed(_) => {
                ErrorCode::MalformedRequest
            }
            ProtocolError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            ProtocolError::InvalidAck => ErrorCode::MalformedRequest,
            ProtocolError::NotFound(_) => ErrorCode::NotFound,
            ProtocolError::NotAFile(_) => ErrorCode::NotAFile,
            ProtocolError::NotADirectory(_) => ErrorCode::NotADirectory,
            ProtocolError::InvalidPath(_) => ErrorCode::InvalidPath,
            ProtocolError::Remote { code, .. } => *code,
            _ => ErrorCode::ServerError,
        }
    }

    /// Whether a status reply still makes sense on this connection
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectFailed { .. }
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::ConnectionClosed
        )
    }

    fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::AllowListRejected => ProtocolError::AllowListRejected(message),
            ErrorCode::AuthRejected => ProtocolError::AuthRejected,
            ErrorCode::NotFound => ProtocolError::NotFound(message),
            ErrorCode::NotAFile => ProtocolError::NotAFile(message),
            ErrorCode::NotADirectory => ProtocolError::NotADirectory(message),
            ErrorCode::InvalidPath => ProtocolError::InvalidPath(message),
            _ => ProtocolError::Remote { code, message },
        }
    }
}

/// Error codes for structured error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AllowListRejected,
    AuthRejected,
    MalformedRequest,
    UnknownCommand,
    NotFound,
    NotAFile,
    NotADirectory,
    InvalidPath,
    ServerError,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::AllowListRejected | ErrorCode::AuthRejected => ErrorKind::Authorization,
            ErrorCode::MalformedRequest | ErrorCode::UnknownCommand => ErrorKind::Protocol,
            ErrorCode::NotFound
            | ErrorCode::NotAFile
            | ErrorCode::NotADirectory
            | ErrorCode::InvalidPath => ErrorKind::Resource,
            ErrorCode::ServerError => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Err,
}

/// Reply header sent by both servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHeader {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl StatusHeader {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            size: None,
            msg: None,
            code: None,
        }
    }

    pub fn ok_with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::ok()
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self {
            status: Status::Err,
            size: None,
            msg: Some(err.to_string()),
            code: Some(err.code()),
        }
    }

    /// Turn an `ERR` reply into the matching local error
    pub fn into_result(self) -> Result<Option<u64>, ProtocolError> {
        match self.status {
            Status::Ok => Ok(self.size),
            Status::Err => Err(ProtocolError::from_remote(
                self.code.unwrap_or(ErrorCode::ServerError),
                self.msg.unwrap_or_default(),
            )),
        }
    }
}

/// File transfer commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileCommand {
    PushFile { filename: String, size: u64 },
    PullFile { path: String },
    ListShared,
    ListFolder { path: String },
}

pub const FILE_COMMANDS: &[&str] = &["PUSH_FILE", "PULL_FILE", "LIST_SHARED", "LIST_FOLDER"];

/// One row of the shared-file catalog as sent by `LIST_SHARED`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub is_folder: bool,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One descendant of a listed folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    pub kind: EntryKind,
    pub relative_path: String,
    pub size: u64,
}

impl FolderEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Serialize `body` and attach the shared token when one is configured
pub fn with_token<T: Serialize>(body: &T, token: Option<&str>) -> Result<Value, ProtocolError> {
    let mut value = serde_json::to_value(body)?;
    if let (Some(token), Some(map)) = (token, value.as_object_mut()) {
        map.insert("token".to_string(), Value::String(token.to_string()));
    }
    Ok(value)
}

pub fn token_of(header: &Value) -> Option<&str> {
    header.get("token").and_then(Value::as_str)
}

/// Decode an internally tagged header, telling unknown tags apart from bad JSON
pub fn decode_tagged<T: DeserializeOwned>(
    header: Value,
    tag: &str,
    known: &[&str],
) -> Result<T, ProtocolError> {
    let name = header.get(tag).and_then(Value::as_str).map(str::to_owned);
    match serde_json::from_value(header) {
        Ok(decoded) => Ok(decoded),
        Err(e) => match name {
            Some(name) if !known.contains(&name.as_str()) => {
                Err(ProtocolError::UnknownCommand(name))
            }
            _ => Err(ProtocolError::Malformed(e)),
        },
    }
}

/// Write one JSON header
pub async fn write_header<W, T>(writer: &mut W, header: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(header)?;
    if payload.len() > MAX_HEADER_SIZE {
        return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_SIZE));
    }
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON header, giving up after `limit` of silence.
///
/// Only the header's own bytes are consumed. Whatever the peer sent after it
/// stays in `reader` for the next read.
pub async fn read_header<R, T>(reader: &mut R, limit: Duration) -> Result<T, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);

    loop {
        let available = match timeout(limit, reader.fill_buf()).await {
            Err(_) => return Err(ProtocolError::Timeout(limit)),
            Ok(Ok(available)) => available,
            // rustls reports a peer that skipped close_notify this way
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => &[][..],
            Ok(Err(e)) => return Err(e.into()),
        };

        if available.is_empty() {
            if buffer.is_empty() {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(serde_json::from_slice(&buffer)?);
        }

        let carried = buffer.len();
        let fresh = available.len();
        buffer.extend_from_slice(available);

        let mut values = Deserializer::from_slice(&buffer).into_iter::<T>();
        match values.next() {
            Some(Ok(header)) => {
                let used = values.byte_offset();
                if used > MAX_HEADER_SIZE {
                    return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_SIZE));
                }
                reader.consume(used.saturating_sub(carried).min(fresh));
                return Ok(header);
            }
            Some(Err(e)) if !e.is_eof() => return Err(e.into()),
            // incomplete, or only whitespace so far
            _ => {}
        }

        reader.consume(fresh);
        if buffer.len() > MAX_HEADER_SIZE {
            return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_SIZE));
        }
    }
}

pub async fn write_ack<W>(writer: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ACK).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_ack<R>(reader: &mut R, limit: Duration) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut ack = [0u8; 3];
    match timeout(limit, reader.read_exact(&mut ack)).await {
        Err(_) => return Err(ProtocolError::Timeout(limit)),
        Ok(result) => {
            result?;
        }
    }
    if &ack != ACK {
        return Err(ProtocolError::InvalidAck);
    }
    Ok(())
}

/// Byte accounting for one streamed body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSession {
    pub expected: u64,
    pub transferred: u64,
}

impl TransferSession {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            transferred: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.expected
    }

    /// Fraction done; an empty body counts as done
    pub fn ratio(&self) -> f64 {
        if self.expected == 0 {
            1.0
        } else {
            self.transferred as f64 / self.expected as f64
        }
    }

    /// Copy up to `expected` bytes, stopping early if the reader hits EOF.
    ///
    /// `on_chunk` runs after every chunk written. Early EOF is not an error
    /// here; call [`TransferSession::finish`] to enforce the byte count.
    pub async fn copy<R, W, F>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        limit: Duration,
        mut on_chunk: F,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnMut(&TransferSession),
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];

        while !self.is_complete() {
            let want = (self.expected - self.transferred).min(CHUNK_SIZE as u64) as usize;
            let n = match timeout(limit, reader.read(&mut buffer[..want])).await {
                Err(_) => return Err(ProtocolError::Timeout(limit)),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
                Ok(Err(e)) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }

            writer.write_all(&buffer[..n]).await?;
            self.transferred += n as u64;
            on_chunk(self);
        }

        writer.flush().await?;
        Ok(())
    }

    pub fn finish(&self) -> Result<u64, ProtocolError> {
        if self.is_complete() {
            Ok(self.transferred)
        } else {
            Err(ProtocolError::PartialTransfer {
                expected: self.expected,
                received: self.transferred,
            })
        }
    }
}

/// Validate a pushed filename to prevent directory traversal attacks
///
/// The name ends up joined onto the save directory, so it must stay a
/// relative path without parent components.
pub fn validate_filename(filename: &str) -> Result<String, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::InvalidPath("Empty filename".to_string()));
    }

    if filename.split(['/', '\\']).any(|part| part == "..") {
        return Err(ProtocolError::InvalidPath(
            "Path traversal detected".to_string(),
        ));
    }

    if filename.starts_with('/') || filename.starts_with('\\') || filename.contains(':') {
        return Err(ProtocolError::InvalidPath(
            "Absolute paths not allowed".to_string(),
        ));
    }

    let normalized = filename.replace('\\', "/");

    if normalized.contains("//") || normalized.ends_with('/') {
        return Err(ProtocolError::InvalidPath(
            "Invalid path format".to_string(),
        ));
    }

    Ok(normalized)
}

/// Last path component, used as the local name of a pulled file
pub fn base_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

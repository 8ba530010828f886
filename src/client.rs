//! File Transfer Client Module
//!
//! Every operation opens its own TLS connection, sends one command header
//! and closes when the exchange is over. Nothing is retried; the caller gets
//! a typed [`ProtocolError`] and decides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::protocol::{
    base_name, read_header, with_token, write_ack, write_header, FileCommand, FolderEntry,
    ProtocolError, SharedFile, StatusHeader, TransferSession,
};
use crate::tls::ClientTlsConfig;

/// Largest listing body the client accepts (64 MiB)
const MAX_LISTING_SIZE: u64 = 64 * 1024 * 1024;

type Connection = BufReader<TlsStream<TcpStream>>;

/// Client side of the file transfer protocol
#[derive(Clone)]
pub struct FileClient {
    tls_config: ClientTlsConfig,
    token: Option<String>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl FileClient {
    pub fn new(tls_config: ClientTlsConfig, token: Option<String>) -> Self {
        Self {
            tls_config,
            token: token.filter(|t| !t.is_empty()),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, io_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.io_timeout = io_timeout;
        self
    }

    /// Connect, send `command` and return the stream with the first status
    async fn open(
        &self,
        peer: SocketAddr,
        command: &FileCommand,
    ) -> Result<(Connection, Option<u64>), ProtocolError> {
        let mut stream = BufReader::new(self.tls_config.connect(peer, self.connect_timeout).await?);

        let header = with_token(command, self.token.as_deref())?;
        write_header(&mut stream, &header).await?;

        let status: StatusHeader = read_header(&mut stream, self.io_timeout).await?;
        let size = status.into_result()?;
        Ok((stream, size))
    }

    /// Push a local file to the peer's save directory under `remote_name`.
    ///
    /// Returns the byte count the peer confirmed.
    pub async fn upload_file(
        &self,
        peer: SocketAddr,
        local_path: &Path,
        remote_name: &str,
    ) -> Result<u64, ProtocolError> {
        let metadata = fs::metadata(local_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProtocolError::NotFound(local_path.to_string_lossy().into_owned())
            }
            _ => ProtocolError::Storage(e),
        })?;
        if !metadata.is_file() {
            return Err(ProtocolError::NotAFile(
                local_path.to_string_lossy().into_owned(),
            ));
        }
        let file_size = metadata.len();
        let file = File::open(local_path)
            .await
            .map_err(ProtocolError::Storage)?;

        let command = FileCommand::PushFile {
            filename: remote_name.to_string(),
            size: file_size,
        };
        let (mut stream, _) = self.open(peer, &command).await?;

        info!("📤 Uploading: {:?} -> {} ({} bytes)", local_path, remote_name, file_size);

        let mut file_reader = BufReader::new(file);
        let mut session = TransferSession::new(file_size);
        session
            .copy(&mut file_reader, &mut stream, self.io_timeout, |_| {})
            .await?;
        session.finish()?;

        let status: StatusHeader = read_header(&mut stream, self.io_timeout).await?;
        let _ = stream.shutdown().await;

        let confirmed = status.into_result()?.unwrap_or(session.transferred);
        if confirmed < file_size {
            return Err(ProtocolError::PartialTransfer {
                expected: file_size,
                received: confirmed,
            });
        }

        info!("✅ Upload complete: {} bytes", confirmed);
        Ok(confirmed)
    }

    /// Pull `remote_path` into `local_path`, reporting after every chunk.
    ///
    /// A stream that ends early leaves the partial file in place.
    pub async fn download_file<F>(
        &self,
        peer: SocketAddr,
        remote_path: &str,
        local_path: &Path,
        on_progress: F,
    ) -> Result<u64, ProtocolError>
    where
        F: FnMut(&TransferSession),
    {
        let command = FileCommand::PullFile {
            path: remote_path.to_string(),
        };
        let (mut stream, size) = self.open(peer, &command).await?;
        let file_size = size.unwrap_or(0);

        if local_path.exists() {
            warn!("⚠️  Local file already exists, overwriting: {:?}", local_path);
        }
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(ProtocolError::Storage)?;
        }
        let file = File::create(local_path)
            .await
            .map_err(ProtocolError::Storage)?;

        write_ack(&mut stream).await?;
        info!("📥 Downloading: {} ({} bytes)", remote_path, file_size);

        let mut file_writer = BufWriter::new(file);
        let mut session = TransferSession::new(file_size);
        let copied = session
            .copy(&mut stream, &mut file_writer, self.io_timeout, on_progress)
            .await;
        let flushed = file_writer.flush().await;
        let _ = stream.shutdown().await;
        copied?;
        flushed.map_err(ProtocolError::Storage)?;

        let received = session.finish()?;
        info!("✅ Download complete: {} bytes", received);
        Ok(received)
    }

    /// Pull `remote_path` into `save_dir` under its base name
    pub async fn download_into(
        &self,
        peer: SocketAddr,
        remote_path: &str,
        save_dir: &Path,
    ) -> Result<PathBuf, ProtocolError> {
        let name = base_name(remote_path)
            .ok_or_else(|| ProtocolError::InvalidPath(remote_path.to_string()))?;
        let local_path = save_dir.join(name);
        self.download_file(peer, remote_path, &local_path, |_| {})
            .await?;
        Ok(local_path)
    }

    /// The peer's shared-file catalog
    pub async fn list_shared(&self, peer: SocketAddr) -> Result<Vec<SharedFile>, ProtocolError> {
        let body = self.fetch_body(peer, &FileCommand::ListShared).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Every descendant of `path` on the peer
    pub async fn list_folder(
        &self,
        peer: SocketAddr,
        path: &str,
    ) -> Result<Vec<FolderEntry>, ProtocolError> {
        let command = FileCommand::ListFolder {
            path: path.to_string(),
        };
        let body = self.fetch_body(peer, &command).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// status size -> ACK -> body
    async fn fetch_body(
        &self,
        peer: SocketAddr,
        command: &FileCommand,
    ) -> Result<Vec<u8>, ProtocolError> {
        let (mut stream, size) = self.open(peer, command).await?;
        let size = size.unwrap_or(0);
        if size > MAX_LISTING_SIZE {
            return Err(ProtocolError::HeaderTooLarge(MAX_LISTING_SIZE as usize));
        }

        write_ack(&mut stream).await?;

        let mut body = Vec::with_capacity(size as usize);
        let mut session = TransferSession::new(size);
        session
            .copy(&mut stream, &mut body, self.io_timeout, |_| {})
            .await?;
        let _ = stream.shutdown().await;
        session.finish()?;

        debug!("Received {} byte listing from {}", body.len(), peer);
        Ok(body)
    }
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

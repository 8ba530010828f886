//! File Transfer Server Module
//!
//! One command per TLS connection. The header names the command with `cmd`;
//! allow-list and token are checked before it is interpreted.
//!
//! ```text
//! PUSH_FILE    -> {OK}              <- size raw bytes    -> {OK, size}
//! PULL_FILE    -> {OK, size}        <- "ACK"             -> size raw bytes
//! LIST_SHARED  -> {OK, size}        <- "ACK"             -> JSON array
//! LIST_FOLDER  -> {OK, size}        <- "ACK"             -> JSON array
//! ```
//!
//! Anything that goes wrong before the first status reply is answered with
//! `{status: ERR, msg, code}`. Once a body is streaming, a failure just ends
//! the connection. Truncated pushes are kept on disk.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::auth::AuthContext;
use crate::catalog::Catalog;
use crate::protocol::{
    decode_tagged, read_ack, read_header, token_of, validate_filename, write_header, EntryKind,
    FileCommand, FolderEntry, ProtocolError, SharedFile, StatusHeader, TransferSession,
    FILE_COMMANDS,
};
use crate::service::{spawn_accept_loop, ServiceHandle};
use crate::tls::ServerTlsConfig;

/// File server configuration
#[derive(Clone)]
pub struct FileServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory pushed files land in
    pub save_dir: PathBuf,
    pub tls_config: ServerTlsConfig,
    pub auth: AuthContext,
    pub max_connections: usize,
    /// Bound on every read from a client
    pub recv_timeout: Duration,
}

struct FileContext {
    config: FileServerConfig,
    catalog: Arc<dyn Catalog>,
}

/// File transfer server bound to its port but not yet accepting
pub struct FileServer {
    listener: TcpListener,
    ctx: Arc<FileContext>,
}

/// A connection plus whether it has already been answered
struct Exchange<S> {
    stream: S,
    replied: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Exchange<S> {
    async fn reply(&mut self, status: &StatusHeader) -> Result<(), ProtocolError> {
        self.replied = true;
        write_header(&mut self.stream, status).await
    }
}

impl FileServer {
    pub async fn bind(config: FileServerConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        setup_save_directory(&config.save_dir).await?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind file service to {}", config.bind_addr))?;

        info!("🔒 File service listening on {}", listener.local_addr()?);
        info!("📁 Save directory: {:?}", config.save_dir);

        Ok(Self {
            listener,
            ctx: Arc::new(FileContext { config, catalog }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting in the background
    pub fn spawn(self) -> Result<ServiceHandle> {
        let ctx = self.ctx;
        let handle = spawn_accept_loop(
            "file",
            self.listener,
            ctx.config.max_connections,
            move |tcp_stream, peer_addr| {
                Self::handle_connection(tcp_stream, peer_addr, Arc::clone(&ctx))
            },
        )?;
        Ok(handle)
    }

    /// Accept until the service is shut down
    pub async fn run(self) -> Result<()> {
        self.spawn()?.join().await;
        Ok(())
    }

    async fn handle_connection(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<FileContext>,
    ) -> Result<(), ProtocolError> {
        let timeout = ctx.config.recv_timeout;
        let stream = ctx.config.tls_config.accept(tcp_stream, timeout).await?;
        debug!("🔐 TLS handshake successful with {}", peer_addr);

        let mut exchange = Exchange {
            stream: BufReader::new(stream),
            replied: false,
        };

        let result = match Self::read_command(&mut exchange.stream, peer_addr, &ctx).await {
            Ok(command) => Self::process_command(command, &mut exchange, &ctx).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if !exchange.replied && e.is_reportable() {
                let _ = exchange.reply(&StatusHeader::error(e)).await;
            }
        }
        let _ = exchange.stream.shutdown().await;

        result
    }

    async fn read_command<S>(
        stream: &mut S,
        peer_addr: SocketAddr,
        ctx: &FileContext,
    ) -> Result<FileCommand, ProtocolError>
    where
        S: AsyncBufRead + Unpin,
    {
        if let Err(e) = ctx.config.auth.check_source(peer_addr.ip()) {
            // drain the request so the rejection is not lost to a reset
            let _ = read_header::<_, Value>(stream, ctx.config.recv_timeout).await;
            return Err(e);
        }

        let header: Value = read_header(stream, ctx.config.recv_timeout).await?;
        ctx.config.auth.check_token(token_of(&header))?;

        let command = decode_tagged(header, "cmd", FILE_COMMANDS)?;
        debug!("Command from {}: {:?}", peer_addr, command);
        Ok(command)
    }

    async fn process_command<S>(
        command: FileCommand,
        exchange: &mut Exchange<S>,
        ctx: &FileContext,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = ctx.config.recv_timeout;
        match command {
            FileCommand::PushFile { filename, size } => {
                Self::handle_push(exchange, &ctx.config.save_dir, &filename, size, timeout).await
            }
            FileCommand::PullFile { path } => Self::handle_pull(exchange, &path, timeout).await,
            FileCommand::ListShared => {
                let files: Vec<SharedFile> =
                    ctx.catalog.get_files().into_iter().map(SharedFile::from).collect();
                let body = serde_json::to_vec(&files)?;
                Self::send_body(exchange, &body, timeout).await
            }
            FileCommand::ListFolder { path } => {
                let entries = list_folder(Path::new(&path)).await?;
                let body = serde_json::to_vec(&entries)?;
                Self::send_body(exchange, &body, timeout).await
            }
        }
    }

    /// Receive a pushed file into the save directory
    async fn handle_push<S>(
        exchange: &mut Exchange<S>,
        save_dir: &Path,
        filename: &str,
        size: u64,
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let safe_filename = validate_filename(filename)?;
        let file_path = save_dir.join(&safe_filename);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await.map_err(ProtocolError::Storage)?;
        }
        let file = File::create(&file_path)
            .await
            .map_err(ProtocolError::Storage)?;

        exchange.reply(&StatusHeader::ok()).await?;
        info!("📤 Receiving file: {} ({} bytes)", safe_filename, size);

        let mut file_writer = BufWriter::new(file);
        let mut session = TransferSession::new(size);
        let copied = session
            .copy(&mut exchange.stream, &mut file_writer, timeout, |_| {})
            .await;
        // keep whatever arrived, even if the copy failed
        let flushed = file_writer.flush().await;
        copied?;
        flushed.map_err(ProtocolError::Storage)?;

        if let Err(e) = session.finish() {
            warn!("Push of {} truncated: {}", safe_filename, e);
            return Err(e);
        }

        exchange
            .reply(&StatusHeader::ok_with_size(session.transferred))
            .await?;
        info!("✅ File received: {} ({} bytes)", safe_filename, session.transferred);
        Ok(())
    }

    /// Stream a local file to the client
    async fn handle_pull<S>(
        exchange: &mut Exchange<S>,
        path: &str,
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProtocolError::NotFound(path.to_string()))
            }
            Err(e) => return Err(ProtocolError::Storage(e)),
        };
        if !metadata.is_file() {
            return Err(ProtocolError::NotAFile(path.to_string()));
        }

        let mut file = File::open(path).await.map_err(ProtocolError::Storage)?;
        let file_size = metadata.len();

        exchange.reply(&StatusHeader::ok_with_size(file_size)).await?;
        read_ack(&mut exchange.stream, timeout).await?;

        info!("📥 Sending file: {} ({} bytes)", path, file_size);

        let mut session = TransferSession::new(file_size);
        session
            .copy(&mut file, &mut exchange.stream, timeout, |_| {})
            .await?;
        session.finish()?;

        info!("✅ File sent: {} ({} bytes)", path, file_size);
        Ok(())
    }

    /// size -> ACK -> body
    async fn send_body<S>(
        exchange: &mut Exchange<S>,
        body: &[u8],
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        exchange
            .reply(&StatusHeader::ok_with_size(body.len() as u64))
            .await?;
        read_ack(&mut exchange.stream, timeout).await?;
        exchange.stream.write_all(body).await?;
        exchange.stream.flush().await?;
        Ok(())
    }
}

/// Set up the save directory with owner-only permissions
async fn setup_save_directory(save_dir: &Path) -> Result<()> {
    if !save_dir.exists() {
        fs::create_dir_all(save_dir)
            .await
            .with_context(|| format!("Failed to create save directory: {:?}", save_dir))?;
        info!("Created save directory: {:?}", save_dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(save_dir).await?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(save_dir, permissions).await?;
    }

    Ok(())
}

/// Every descendant of `root`, in walk order
pub async fn list_folder(root: &Path) -> Result<Vec<FolderEntry>, ProtocolError> {
    let display = root.to_string_lossy().into_owned();
    match fs::metadata(root).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(ProtocolError::NotADirectory(display)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ProtocolError::NotFound(display))
        }
        Err(e) => return Err(ProtocolError::Storage(e)),
    }

    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_folder(&root))
        .await
        .map_err(|e| ProtocolError::Storage(io::Error::other(e)))
}

fn walk_folder(root: &Path) -> Vec<FolderEntry> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(FolderEntry {
                kind: EntryKind::Directory,
                relative_path,
                size: 0,
            });
        } else if file_type.is_file() {
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!("Skipping {:?}, size unavailable: {}", entry.path(), e);
                    continue;
                }
            };
            entries.push(FolderEntry {
                kind: EntryKind::File,
                relative_path,
                size,
            });
        }
        // Skip symlinks
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::protocol::{with_token, write_ack, ErrorCode, Status};
    use crate::testutil;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const LIMIT: Duration = Duration::from_secs(5);

    async fn start_files(save_dir: &Path, auth: AuthContext) -> ServiceHandle {
        start_files_with_timeout(save_dir, auth, LIMIT).await
    }

    async fn start_files_with_timeout(
        save_dir: &Path,
        auth: AuthContext,
        recv_timeout: Duration,
    ) -> ServiceHandle {
        let config = FileServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            save_dir: save_dir.to_path_buf(),
            tls_config: testutil::server_tls(),
            auth,
            max_connections: 16,
            recv_timeout,
        };
        FileServer::bind(config, Arc::new(MemoryCatalog::new()))
            .await
            .unwrap()
            .spawn()
            .unwrap()
    }

    async fn connect(addr: SocketAddr) -> BufReader<tokio_rustls::client::TlsStream<TcpStream>> {
        BufReader::new(testutil::client_tls().connect(addr, LIMIT).await.unwrap())
    }

    async fn exchange(addr: SocketAddr, header: Value) -> StatusHeader {
        let mut stream = connect(addr).await;
        write_header(&mut stream, &header).await.unwrap();
        read_header(&mut stream, LIMIT).await.unwrap()
    }

    #[tokio::test]
    async fn test_walk_folder_lists_every_descendant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
        std::fs::create_dir_all(dir.path().join("b/d")).unwrap();
        std::fs::write(dir.path().join("b/c.txt"), vec![0u8; 20]).unwrap();

        let entries = list_folder(dir.path()).await.unwrap();
        let listed: Vec<(&str, EntryKind, u64)> = entries
            .iter()
            .map(|e| (e.relative_path.as_str(), e.kind, e.size))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("a.txt", EntryKind::File, 10),
                ("b", EntryKind::Directory, 0),
                ("b/c.txt", EntryKind::File, 20),
                ("b/d", EntryKind::Directory, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_folder_rejects_missing_and_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        assert!(matches!(
            list_folder(&dir.path().join("nope")).await,
            Err(ProtocolError::NotFound(_))
        ));
        assert!(matches!(
            list_folder(&file).await,
            Err(ProtocolError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_error_status() {
        let dir = TempDir::new().unwrap();
        let handle = start_files(dir.path(), AuthContext::open()).await;

        let status = exchange(handle.local_addr(), json!({"cmd": "DELETE_ALL"})).await;
        assert_eq!(status.status, Status::Err);
        assert_eq!(status.code, Some(ErrorCode::UnknownCommand));
    }

    #[tokio::test]
    async fn test_push_with_traversal_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let handle = start_files(dir.path(), AuthContext::open()).await;

        let status = exchange(
            handle.local_addr(),
            json!({"cmd": "PUSH_FILE", "filename": "../escape.txt", "size": 3}),
        )
        .await;
        assert_eq!(status.code, Some(ErrorCode::InvalidPath));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_truncated_push_keeps_partial_file() {
        let dir = TempDir::new().unwrap();
        let handle = start_files(dir.path(), AuthContext::open()).await;

        let mut stream = connect(handle.local_addr()).await;
        let header = json!({"cmd": "PUSH_FILE", "filename": "cut.bin", "size": 1000});
        write_header(&mut stream, &header).await.unwrap();
        let status: StatusHeader = read_header(&mut stream, LIMIT).await.unwrap();
        assert_eq!(status.status, Status::Ok);

        stream.write_all(&[9u8; 400]).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let path = dir.path().join("cut.bin");
        for _ in 0..100 {
            if std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) == 400 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 400);
    }

    #[tokio::test]
    async fn test_pull_body_follows_ack() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello world").unwrap();
        let handle = start_files(dir.path(), AuthContext::open()).await;

        let mut stream = connect(handle.local_addr()).await;
        let header = json!({"cmd": "PULL_FILE", "path": source.to_string_lossy()});
        write_header(&mut stream, &header).await.unwrap();
        let status: StatusHeader = read_header(&mut stream, LIMIT).await.unwrap();
        assert_eq!(status.size, Some(11));

        write_ack(&mut stream).await.unwrap();
        let mut body = vec![0u8; 11];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello world");
    }

    #[tokio::test]
    async fn test_bad_ack_ends_pull_without_body() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello world").unwrap();
        let handle = start_files(dir.path(), AuthContext::open()).await;

        let mut stream = connect(handle.local_addr()).await;
        let header = json!({"cmd": "PULL_FILE", "path": source.to_string_lossy()});
        write_header(&mut stream, &header).await.unwrap();
        let _: StatusHeader = read_header(&mut stream, LIMIT).await.unwrap();

        stream.write_all(b"NAK").await.unwrap();
        stream.flush().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_token_checked_before_command() {
        let dir = TempDir::new().unwrap();
        let handle = start_files(dir.path(), AuthContext::open().with_token("s3cret")).await;

        // even an unknown command is rejected for the token first
        let status = exchange(handle.local_addr(), json!({"cmd": "DELETE_ALL"})).await;
        assert_eq!(status.code, Some(ErrorCode::AuthRejected));

        let header = with_token(&FileCommand::ListShared, Some("s3cret")).unwrap();
        let status = exchange(handle.local_addr(), header).await;
        assert_eq!(status.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_allow_list_rejects_before_reading() {
        let dir = TempDir::new().unwrap();
        let auth = AuthContext::open().with_allowed(["10.0.0.5".parse().unwrap()]);
        let handle = start_files(dir.path(), auth).await;

        let status = exchange(handle.local_addr(), json!({"cmd": "LIST_SHARED"})).await;
        assert_eq!(status.code, Some(ErrorCode::AllowListRejected));
    }

    #[tokio::test]
    async fn test_allow_list_accepts_listed_source() {
        let dir = TempDir::new().unwrap();
        let auth = AuthContext::open().with_allowed(["127.0.0.1".parse().unwrap()]);
        let handle = start_files(dir.path(), auth).await;

        let status = exchange(handle.local_addr(), json!({"cmd": "LIST_SHARED"})).await;
        assert_eq!(status.status, Status::Ok);
        assert_eq!(status.size, Some(2));
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_and_service_keeps_accepting() {
        let dir = TempDir::new().unwrap();
        let handle =
            start_files_with_timeout(dir.path(), AuthContext::open(), Duration::from_millis(300))
                .await;

        // connect, finish the handshake, then say nothing
        let mut idle = connect(handle.local_addr()).await;
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(3), idle.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "idle connection was not closed");
        assert!(rest.is_empty());

        let status = exchange(handle.local_addr(), json!({"cmd": "LIST_SHARED"})).await;
        assert_eq!(status.status, Status::Ok);
    }
}

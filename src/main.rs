//! LAN Link CLI - Main Entry Point
//!
//! ```text
//!   lanlink run                               lanlink post/push/pull/...
//! ┌──────────────────────────────────┐      ┌──────────────────────────┐
//! │ Discovery   UDP  :12345 (bcast)  │      │ one TLS connection per   │
//! │ ChatServer  TLS  :12347          │<─────│ command, then exit       │
//! │ FileServer  TLS  :12346          │      └──────────────────────────┘
//! │ event loop: print, answer HELLO  │
//! └──────────────────────────────────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lanlink::catalog::{Catalog, FileCatalog};
use lanlink::chat::{ChatClient, ChatEnvelope, ChatServer, ChatServerConfig};
use lanlink::client::{format_size, FileClient};
use lanlink::config::{load_settings, Settings, SETTINGS_FILE};
use lanlink::discovery::Discovery;
use lanlink::events::{self, ChatEvent, ProgressStatus};
use lanlink::folder::download_folder;
use lanlink::protocol::EntryKind;
use lanlink::server::{FileServer, FileServerConfig};
use lanlink::tls::{
    fingerprint, generate_self_signed_cert, load_or_generate_identity, save_cert_and_key,
    ClientTlsConfig, Identity, ServerTlsConfig, CERT_FILE, KEY_FILE,
};

/// LAN Link CLI
///
/// Peer discovery, chat and file sharing on the local network, encrypted
/// with a certificate shared by the whole group.
#[derive(Parser)]
#[command(name = "lanlink")]
#[command(version = "0.1.0")]
#[command(about = "Serverless LAN chat and file sharing over TLS", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file
    #[arg(short, long, global = true, default_value = SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Announce presence and serve chat and files until interrupted
    Run {
        /// Files or folders to list in the shared catalog
        #[arg(short, long)]
        share: Vec<PathBuf>,
    },

    /// Introduce yourself to a peer
    Hello {
        /// Peer address (IP or IP:port)
        peer: String,
    },

    /// Post a chat message
    Post {
        peer: String,
        content: String,
    },

    /// Edit a message you posted
    Edit {
        peer: String,
        id: String,
        content: String,
    },

    /// Delete a message you posted
    Delete {
        peer: String,
        id: String,
    },

    /// Show the stored chat history
    History {
        /// Number of most recent messages to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Push a local file into the peer's save directory
    Push {
        peer: String,

        /// Local file to push
        file: PathBuf,

        /// Remote filename (defaults to local filename)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Pull a file from the peer
    Pull {
        peer: String,

        /// Path of the file on the peer
        remote: String,

        /// Directory to save into (defaults to the configured save dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the peer's shared files
    Shared {
        peer: String,
    },

    /// List a folder on the peer recursively
    Folder {
        peer: String,
        path: String,
    },

    /// Download a whole folder from the peer
    DownloadFolder {
        peer: String,
        path: String,

        /// Directory to save into (defaults to the configured save dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate the shared certificate in the data directory
    Generate {
        /// Replace an existing certificate
        #[arg(long)]
        force: bool,

        /// Common name for the certificate
        #[arg(long, default_value = "lanlink")]
        cn: String,
    },

    /// Print the certificate location and fingerprint
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the crypto provider (required by rustls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install crypto provider"))?;

    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let settings = load_settings(&cli.config)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(&settings, action),
        Commands::Run { share } => run_node(settings, share).await,
        Commands::History { limit } => {
            let catalog = FileCatalog::open(settings.catalog_path())?;
            print_history(&catalog, limit);
            Ok(())
        }
        command => {
            let app = App::new(settings)?;
            app.run_command(command).await
        }
    }
}

fn handle_cert_command(settings: &Settings, action: CertCommands) -> Result<()> {
    let cert_path = settings.data_dir.join(CERT_FILE);
    let key_path = settings.data_dir.join(KEY_FILE);

    match action {
        CertCommands::Generate { force, cn } => {
            if cert_path.exists() && !force {
                bail!(
                    "Certificate already exists at {:?} (use --force to replace it)",
                    cert_path
                );
            }

            info!("🔐 Generating self-signed certificate...");
            let cert = generate_self_signed_cert(&cn, &[cn.as_str()], &[])?;
            std::fs::create_dir_all(&settings.data_dir)?;
            save_cert_and_key(&cert.cert_pem, &cert.key_pem, &cert_path, &key_path)?;

            info!("✅ Certificate generated successfully!");
            info!("   Certificate: {:?}", cert_path);
            info!("   Private key: {:?}", key_path);
            info!("   Fingerprint: {}", fingerprint(&cert.cert_pem)?);
            info!("📝 Copy both files into the data directory of every peer.");
            Ok(())
        }
        CertCommands::Show => {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .with_context(|| format!("No certificate at {:?}", cert_path))?;
            println!("Certificate: {:?}", cert_path);
            println!("Fingerprint: {}", fingerprint(&cert_pem)?);
            Ok(())
        }
    }
}

/// Everything a one-shot command needs
struct App {
    settings: Settings,
    catalog: FileCatalog,
    chat: ChatClient,
    files: FileClient,
}

impl App {
    fn new(settings: Settings) -> Result<Self> {
        let identity = load_or_generate_identity(&settings.data_dir)?;
        let tls_config = ClientTlsConfig::for_identity(&identity, settings.verify_peer_certificate)?;

        let chat = ChatClient::new(tls_config.clone(), settings.auth_token.clone())
            .with_timeouts(settings.connect_timeout(), settings.client_timeout());
        let files = FileClient::new(tls_config, settings.auth_token.clone())
            .with_timeouts(settings.connect_timeout(), settings.client_timeout());

        let catalog = FileCatalog::open(settings.catalog_path())?;

        Ok(Self {
            settings,
            catalog,
            chat,
            files,
        })
    }

    fn chat_peer(&self, peer: &str) -> Result<SocketAddr> {
        resolve_peer(peer, self.settings.tcp_chat_port)
    }

    fn file_peer(&self, peer: &str) -> Result<SocketAddr> {
        resolve_peer(peer, self.settings.tcp_file_port)
    }

    async fn run_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Hello { peer } => {
                let peer = self.chat_peer(&peer)?;
                self.chat.send_hello(peer, &self.settings.username).await?;
                info!("👋 Said hello to {}", peer);
            }
            Commands::Post { peer, content } => {
                let peer = self.chat_peer(&peer)?;
                let id = self.catalog.add_message(&self.settings.username, &content);
                self.chat
                    .send_post(peer, &id, &self.settings.username, &content)
                    .await?;
                println!("{}", id);
            }
            Commands::Edit { peer, id, content } => {
                let peer = self.chat_peer(&peer)?;
                self.chat.send_edit(peer, &id, &content).await?;
                if !self.catalog.edit_message(&id, &content) {
                    warn!("{} is not in the local history", id);
                }
                info!("✏️  Edited {}", id);
            }
            Commands::Delete { peer, id } => {
                let peer = self.chat_peer(&peer)?;
                self.chat.send_delete(peer, &id).await?;
                if !self.catalog.delete_message(&id) {
                    warn!("{} is not in the local history", id);
                }
                info!("🗑️  Deleted {}", id);
            }
            Commands::Push { peer, file, name } => {
                let peer = self.file_peer(&peer)?;
                let remote_name = name.unwrap_or_else(|| {
                    file.file_name()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "uploaded_file".to_string())
                });
                let sent = self.files.upload_file(peer, &file, &remote_name).await?;
                info!("✅ Pushed {} ({})", remote_name, format_size(sent));
            }
            Commands::Pull {
                peer,
                remote,
                output,
            } => {
                let peer = self.file_peer(&peer)?;
                let save_dir = output.unwrap_or_else(|| self.settings.save_dir.clone());
                self.pull(peer, &remote, &save_dir).await?;
            }
            Commands::Shared { peer } => {
                let peer = self.file_peer(&peer)?;
                let shared = self.files.list_shared(peer).await?;
                if shared.is_empty() {
                    info!("📁 Nothing shared");
                    return Ok(());
                }

                println!();
                println!("{:<30} {:>12} {:<12} {}", "Name", "Size", "Owner", "Path");
                println!("{:-<80}", "");
                for file in shared {
                    let size = if file.is_folder {
                        "<DIR>".to_string()
                    } else {
                        format_size(file.size)
                    };
                    println!("{:<30} {:>12} {:<12} {}", file.filename, size, file.owner, file.path);
                }
            }
            Commands::Folder { peer, path } => {
                let peer = self.file_peer(&peer)?;
                let entries = self.files.list_folder(peer, &path).await?;

                println!();
                println!("{:<50} {:>12}", "Path", "Size");
                println!("{:-<63}", "");
                for entry in entries {
                    match entry.kind {
                        EntryKind::Directory => {
                            println!("{:<50} {:>12}", format!("{}/", entry.relative_path), "<DIR>")
                        }
                        EntryKind::File => {
                            println!("{:<50} {:>12}", entry.relative_path, format_size(entry.size))
                        }
                    }
                }
            }
            Commands::DownloadFolder { peer, path, output } => {
                let peer = self.file_peer(&peer)?;
                let save_dir = output.unwrap_or_else(|| self.settings.save_dir.clone());
                self.download_folder(peer, &path, &save_dir).await?;
            }
            Commands::Cert { .. } | Commands::Run { .. } | Commands::History { .. } => {
                bail!("Not a peer command")
            }
        }
        Ok(())
    }

    async fn pull(&self, peer: SocketAddr, remote: &str, save_dir: &Path) -> Result<()> {
        let name = lanlink::protocol::base_name(remote)
            .with_context(|| format!("No file name in {:?}", remote))?;
        let local_path = save_dir.join(name);

        let pb = create_progress_bar(0, BYTES_TEMPLATE);
        pb.set_message("Downloading");
        let received = self
            .files
            .download_file(peer, remote, &local_path, |session| {
                pb.set_length(session.expected);
                pb.set_position(session.transferred);
            })
            .await;

        match received {
            Ok(bytes) => {
                pb.finish_with_message("Download complete");
                info!("✅ Saved {:?} ({})", local_path, format_size(bytes));
                Ok(())
            }
            Err(e) => {
                pb.abandon_with_message("Download failed");
                Err(e.into())
            }
        }
    }

    async fn download_folder(&self, peer: SocketAddr, path: &str, save_dir: &Path) -> Result<()> {
        let pb = create_progress_bar(100, FOLDER_TEMPLATE);
        let report = download_folder(&self.files, peer, path, save_dir, |progress| {
            match progress.status {
                ProgressStatus::Start => {
                    pb.set_message(progress.relative_path);
                    pb.set_position((progress.overall_ratio * 100.0) as u64);
                }
                ProgressStatus::Progress | ProgressStatus::Done => {}
                ProgressStatus::Error => pb.println(format!(
                    "✗ {}: {}",
                    progress.relative_path,
                    progress.error.unwrap_or_default()
                )),
            }
        })
        .await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                pb.abandon_with_message("Listing failed");
                return Err(e.into());
            }
        };
        pb.finish_with_message("Folder download complete");

        info!(
            "✅ {} file(s) downloaded, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        if !report.is_complete() {
            bail!("{} file(s) could not be downloaded", report.failed.len());
        }
        Ok(())
    }
}

/// Run discovery and both services until Ctrl-C
async fn run_node(settings: Settings, share: Vec<PathBuf>) -> Result<()> {
    info!("🚀 Starting LAN Link as {}...", settings.username);

    let identity: Identity = load_or_generate_identity(&settings.data_dir)?;
    info!("🔐 Certificate fingerprint: {}", fingerprint(&identity.cert_pem)?);
    let server_tls = ServerTlsConfig::from_pem(&identity.cert_pem, &identity.key_pem)?;
    let client_tls = ClientTlsConfig::for_identity(&identity, settings.verify_peer_certificate)?;

    let history = FileCatalog::open(settings.catalog_path())?;
    print_history(&history, 50);
    let catalog: Arc<dyn Catalog> = Arc::new(history);
    for path in &share {
        share_path(catalog.as_ref(), path, &settings.username)?;
    }

    let (event_tx, mut event_rx) = events::channel();
    let auth = settings.auth_context();

    let chat_config = ChatServerConfig {
        bind_addr: settings.chat_addr(),
        tls_config: server_tls.clone(),
        auth: auth.clone(),
        max_connections: settings.max_connections,
        recv_timeout: settings.server_timeout(),
    };
    let chat_service = ChatServer::bind(chat_config, Arc::clone(&catalog), Some(event_tx))
        .await?
        .spawn()?;

    let file_config = FileServerConfig {
        bind_addr: settings.file_addr(),
        save_dir: settings.save_dir.clone(),
        tls_config: server_tls,
        auth,
        max_connections: settings.max_connections,
        recv_timeout: settings.server_timeout(),
    };
    let file_service = FileServer::bind(file_config, Arc::clone(&catalog))
        .await?
        .spawn()?;

    let discovery = Discovery::start(settings.discovery_config(), settings.username.clone()).await?;

    let chat_client = ChatClient::new(client_tls, settings.auth_token.clone())
        .with_timeouts(settings.connect_timeout(), settings.client_timeout());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ChatEvent::NewPeer { address, username } => {
                        info!("👋 {} ({}) said hello", username, address);
                        if discovery.record(address, &username) {
                            answer_hello(&chat_client, address, &settings);
                        }
                    }
                    ChatEvent::MessagePosted { id, sender, content } => {
                        println!("[{}] {}: {}", short_id(&id), sender, content);
                    }
                    ChatEvent::MessageEdited { id, content } => {
                        println!("[{}] (edited) {}", short_id(&id), content);
                    }
                    ChatEvent::MessageDeleted { id } => {
                        println!("[{}] (deleted)", short_id(&id));
                    }
                }
            }
        }
    }

    discovery.stop().await;
    chat_service.shutdown();
    file_service.shutdown();
    chat_service.join().await;
    file_service.join().await;
    Ok(())
}

fn print_history(catalog: &dyn Catalog, limit: usize) {
    let messages = catalog.get_messages(limit);
    if messages.is_empty() {
        info!("💬 No chat history yet");
        return;
    }
    for message in messages {
        println!("[{}] {}: {}", short_id(&message.id), message.sender, message.content);
    }
}

fn answer_hello(chat_client: &ChatClient, address: IpAddr, settings: &Settings) {
    let client = chat_client.clone();
    let peer = SocketAddr::new(address, settings.tcp_chat_port);
    let hello = ChatEnvelope::Hello {
        username: settings.username.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = client.send_envelope(peer, &hello).await {
            warn!("Could not say hello to {}: {}", peer, e);
        }
    });
}

/// Add a local file or folder to the shared catalog
fn share_path(catalog: &dyn Catalog, path: &Path, owner: &str) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Cannot share {:?}", path))?;
    let metadata = std::fs::metadata(&path)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let size = if metadata.is_dir() { 0 } else { metadata.len() };

    catalog.add_file(
        &filename,
        &path.to_string_lossy(),
        size,
        owner,
        metadata.is_dir(),
    );
    info!("📁 Sharing {:?}", path);
    Ok(())
}

/// Accept `IP` or `IP:port`, filling in the service port
fn resolve_peer(peer: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    match peer.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, default_port)),
        Err(_) => bail!("Invalid peer address: {}", peer),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

const BYTES_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const FOLDER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}";

/// Create progress bar for transfers
fn create_progress_bar(total: u64, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

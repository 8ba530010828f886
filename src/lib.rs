//! LAN Link
//!
//! Serverless chat and file sharing between hosts on one broadcast domain.
//!
//! ## Features
//! - Peer discovery by periodic UDP broadcast
//! - Chat posts, edits and deletes, each over its own TLS connection
//! - File push, pull, shared-file listing and recursive folder download
//! - One pre-shared self-signed certificate for the whole group
//!
//! ## Usage
//!
//! ```bash
//! # Create the shared certificate, then copy the data dir to every host
//! lanlink cert generate
//!
//! # Announce, listen for chat and serve files
//! lanlink run --share ./public
//!
//! # Talk to a peer
//! lanlink post 192.168.1.20 "lunch?"
//! lanlink download-folder 192.168.1.20 /home/bob/public/photos
//! ```

pub mod auth;
pub mod catalog;
pub mod chat;
pub mod client;
pub mod config;
pub mod discovery;
pub mod events;
pub mod folder;
pub mod protocol;
pub mod server;
pub mod service;
pub mod tls;

pub use auth::AuthContext;
pub use catalog::{Catalog, FileCatalog, MemoryCatalog};
pub use chat::{ChatClient, ChatEnvelope, ChatServer, ChatServerConfig};
pub use client::FileClient;
pub use config::Settings;
pub use discovery::{Discovery, DiscoveryConfig, PeerRecord};
pub use events::{ChatEvent, FolderProgress, ProgressStatus};
pub use folder::{download_folder, FolderReport};
pub use protocol::{ErrorKind, ProtocolError};
pub use server::{FileServer, FileServerConfig};
pub use service::ServiceHandle;
pub use tls::{ClientTlsConfig, ServerTlsConfig};

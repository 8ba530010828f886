//! Chat Transport
//!
//! Every chat event travels on its own TLS connection:
//!
//! ```text
//! Client                                 Server
//!   |-- [TLS Handshake] ------------------>|
//!   |-- {"type": "MSG", ..., token?} ----->|  allow-list, token, dispatch
//!   |<---------------- {"status": "OK"} ---|
//!   |-- close ---------------------------->|
//! ```
//!
//! Rejections and undecodable envelopes get an `ERR` status with a code, the
//! same reply shape the file service uses. Receivers deduplicate posts by id,
//! so a sender may safely deliver the same post twice.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::catalog::{now_millis, Catalog};
use crate::events::{ChatEvent, EventSender};
use crate::protocol::{
    decode_tagged, read_header, token_of, with_token, write_header, ProtocolError, StatusHeader,
};
use crate::service::{spawn_accept_loop, ServiceHandle};
use crate::tls::{ClientTlsConfig, ServerTlsConfig};

/// One chat event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEnvelope {
    #[serde(rename = "HELLO")]
    Hello { username: String },
    #[serde(rename = "MSG")]
    Post {
        id: String,
        sender: String,
        content: String,
    },
    #[serde(rename = "MSG_EDIT")]
    Edit { id: String, content: String },
    #[serde(rename = "MSG_DEL")]
    Delete { id: String },
}

const ENVELOPE_TAGS: &[&str] = &["HELLO", "MSG", "MSG_EDIT", "MSG_DEL"];

impl ChatEnvelope {
    /// A post with a freshly minted id
    pub fn post(sender: impl Into<String>, content: impl Into<String>) -> Self {
        ChatEnvelope::Post {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ChatEnvelope::Hello { .. } => None,
            ChatEnvelope::Post { id, .. }
            | ChatEnvelope::Edit { id, .. }
            | ChatEnvelope::Delete { id } => Some(id),
        }
    }
}

/// Chat server configuration
#[derive(Clone)]
pub struct ChatServerConfig {
    pub bind_addr: SocketAddr,
    pub tls_config: ServerTlsConfig,
    pub auth: AuthContext,
    pub max_connections: usize,
    /// Bound on every read from a client
    pub recv_timeout: Duration,
}

struct ChatContext {
    config: ChatServerConfig,
    catalog: Arc<dyn Catalog>,
    events: Option<EventSender>,
}

/// Chat server bound to its port but not yet accepting
pub struct ChatServer {
    listener: TcpListener,
    ctx: Arc<ChatContext>,
}

impl ChatServer {
    pub async fn bind(
        config: ChatServerConfig,
        catalog: Arc<dyn Catalog>,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind chat service to {}", config.bind_addr))?;

        info!("Chat service listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx: Arc::new(ChatContext {
                config,
                catalog,
                events,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting in the background
    pub fn spawn(self) -> Result<ServiceHandle> {
        let ctx = self.ctx;
        let handle = spawn_accept_loop(
            "chat",
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
        ctx: Arc<ChatContext>,
    ) -> Result<(), ProtocolError> {
        let timeout = ctx.config.recv_timeout;
        let mut stream = BufReader::new(ctx.config.tls_config.accept(tcp_stream, timeout).await?);

        let outcome = Self::receive_envelope(&mut stream, peer_addr, &ctx).await;

        let reply = match &outcome {
            Ok(()) => Some(StatusHeader::ok()),
            Err(e) if e.is_reportable() => Some(StatusHeader::error(e)),
            Err(_) => None,
        };
        if let Some(reply) = reply {
            // the sender may already be gone; the envelope was handled either way
            let _ = write_header(&mut stream, &reply).await;
        }
        let _ = stream.shutdown().await;

        outcome
    }

    async fn receive_envelope<S>(
        stream: &mut S,
        peer_addr: SocketAddr,
        ctx: &ChatContext,
    ) -> Result<(), ProtocolError>
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

        let envelope: ChatEnvelope = decode_tagged(header, "type", ENVELOPE_TAGS)?;
        debug!("Envelope from {}: {:?}", peer_addr, envelope);

        ctx.dispatch(peer_addr, envelope);
        Ok(())
    }
}

impl ChatContext {
    fn dispatch(&self, peer_addr: SocketAddr, envelope: ChatEnvelope) {
        let event = match envelope {
            ChatEnvelope::Hello { username } => ChatEvent::NewPeer {
                address: peer_addr.ip(),
                username,
            },
            ChatEnvelope::Post {
                id,
                sender,
                content,
            } => {
                if !self
                    .catalog
                    .add_received_message(&id, &sender, &content, now_millis())
                {
                    debug!("Duplicate post {} from {}", id, peer_addr);
                }
                ChatEvent::MessagePosted {
                    id,
                    sender,
                    content,
                }
            }
            ChatEnvelope::Edit { id, content } => {
                self.catalog.edit_message(&id, &content);
                ChatEvent::MessageEdited { id, content }
            }
            ChatEnvelope::Delete { id } => {
                self.catalog.delete_message(&id);
                ChatEvent::MessageDeleted { id }
            }
        };

        if let Some(events) = &self.events {
            // a dropped receiver just means nobody is watching
            let _ = events.send(event);
        }
    }
}

/// Sends chat envelopes, one connection per envelope
#[derive(Clone)]
pub struct ChatClient {
    tls_config: ClientTlsConfig,
    token: Option<String>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ChatClient {
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

    /// Deliver one envelope. Failures are returned, never retried.
    pub async fn send_envelope(
        &self,
        peer: SocketAddr,
        envelope: &ChatEnvelope,
    ) -> Result<(), ProtocolError> {
        let mut stream = BufReader::new(self.tls_config.connect(peer, self.connect_timeout).await?);

        let header = with_token(envelope, self.token.as_deref())?;
        write_header(&mut stream, &header).await?;

        let status: StatusHeader = read_header(&mut stream, self.io_timeout).await?;
        let _ = stream.shutdown().await;

        status.into_result().map(|_| ())
    }

    pub async fn send_hello(&self, peer: SocketAddr, username: &str) -> Result<(), ProtocolError> {
        self.send_envelope(
            peer,
            &ChatEnvelope::Hello {
                username: username.to_string(),
            },
        )
        .await
    }

    pub async fn send_post(
        &self,
        peer: SocketAddr,
        id: &str,
        sender: &str,
        content: &str,
    ) -> Result<(), ProtocolError> {
        self.send_envelope(
            peer,
            &ChatEnvelope::Post {
                id: id.to_string(),
                sender: sender.to_string(),
                content: content.to_string(),
            },
        )
        .await
    }

    pub async fn send_edit(&self, peer: SocketAddr, id: &str, content: &str) -> Result<(), ProtocolError> {
        self.send_envelope(
            peer,
            &ChatEnvelope::Edit {
                id: id.to_string(),
                content: content.to_string(),
            },
        )
        .await
    }

    pub async fn send_delete(&self, peer: SocketAddr, id: &str) -> Result<(), ProtocolError> {
        self.send_envelope(peer, &ChatEnvelope::Delete { id: id.to_string() })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::events::{self, EventReceiver};
    use crate::protocol::{ErrorKind, Status};
    use crate::testutil;
    use serde_json::json;

    struct Harness {
        handle: ServiceHandle,
        catalog: Arc<MemoryCatalog>,
        events: EventReceiver,
    }

    async fn start_chat(auth: AuthContext) -> Harness {
        let catalog = Arc::new(MemoryCatalog::new());
        let (tx, rx) = events::channel();
        let config = ChatServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            tls_config: testutil::server_tls(),
            auth,
            max_connections: 16,
            recv_timeout: Duration::from_secs(5),
        };
        let server = ChatServer::bind(config, catalog.clone(), Some(tx)).await.unwrap();
        Harness {
            handle: server.spawn().unwrap(),
            catalog,
            events: rx,
        }
    }

    fn client(token: Option<&str>) -> ChatClient {
        ChatClient::new(testutil::client_tls(), token.map(String::from))
    }

    #[test]
    fn test_envelope_wire_format() {
        let edit = ChatEnvelope::Edit {
            id: "m1".into(),
            content: "hi there".into(),
        };
        assert_eq!(
            serde_json::to_value(&edit).unwrap(),
            json!({"type": "MSG_EDIT", "id": "m1", "content": "hi there"})
        );

        let hello: ChatEnvelope =
            serde_json::from_value(json!({"type": "HELLO", "username": "Alice"})).unwrap();
        assert_eq!(hello, ChatEnvelope::Hello { username: "Alice".into() });
        assert_eq!(hello.id(), None);
    }

    #[test]
    fn test_post_mints_unique_ids() {
        let a = ChatEnvelope::post("A", "hi");
        let b = ChatEnvelope::post("A", "hi");
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_post_then_edit_updates_catalog() {
        let mut harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();
        let client = client(None);

        client.send_post(peer, "m1", "A", "hi").await.unwrap();
        let message = harness.catalog.message("m1").unwrap();
        assert_eq!(message.sender, "A");
        assert_eq!(message.content, "hi");
        assert_eq!(
            harness.events.recv().await.unwrap(),
            ChatEvent::MessagePosted {
                id: "m1".into(),
                sender: "A".into(),
                content: "hi".into()
            }
        );

        client.send_edit(peer, "m1", "hi there").await.unwrap();
        assert_eq!(harness.catalog.message("m1").unwrap().content, "hi there");
        assert_eq!(
            harness.events.recv().await.unwrap(),
            ChatEvent::MessageEdited {
                id: "m1".into(),
                content: "hi there".into()
            }
        );
        assert_eq!(harness.catalog.get_messages(10).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_post_stored_once() {
        let harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();
        let client = client(None);
        let post = ChatEnvelope::post("A", "twice");

        client.send_envelope(peer, &post).await.unwrap();
        client.send_envelope(peer, &post).await.unwrap();

        let messages = harness.catalog.get_messages(10);
        assert_eq!(messages.len(), 1);
        assert_eq!(Some(messages[0].id.as_str()), post.id());
    }

    #[tokio::test]
    async fn test_edit_and_delete_of_unseen_id_succeed_quietly() {
        let mut harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();
        let client = client(None);

        client.send_edit(peer, "ghost", "boo").await.unwrap();
        client.send_delete(peer, "ghost").await.unwrap();

        assert!(harness.catalog.message("ghost").is_none());
        assert!(matches!(
            harness.events.recv().await,
            Some(ChatEvent::MessageEdited { .. })
        ));
        assert!(matches!(
            harness.events.recv().await,
            Some(ChatEvent::MessageDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_is_soft() {
        let harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();
        let client = client(None);

        client.send_post(peer, "m2", "A", "bye").await.unwrap();
        client.send_delete(peer, "m2").await.unwrap();

        assert!(harness.catalog.get_messages(10).is_empty());
        assert!(harness.catalog.message("m2").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_hello_surfaces_new_peer_without_storing() {
        let mut harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();

        client(None).send_hello(peer, "Alice").await.unwrap();

        assert_eq!(
            harness.events.recv().await.unwrap(),
            ChatEvent::NewPeer {
                address: "127.0.0.1".parse().unwrap(),
                username: "Alice".into()
            }
        );
        assert!(harness.catalog.get_messages(10).is_empty());
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let harness = start_chat(AuthContext::open().with_token("s3cret")).await;
        let peer = harness.handle.local_addr();

        let missing = client(None).send_post(peer, "m1", "A", "hi").await;
        assert!(matches!(missing, Err(ProtocolError::AuthRejected)));

        let wrong = client(Some("guess")).send_post(peer, "m1", "A", "hi").await;
        assert!(matches!(wrong, Err(ProtocolError::AuthRejected)));
        assert!(harness.catalog.message("m1").is_none());

        client(Some("s3cret"))
            .send_post(peer, "m1", "A", "hi")
            .await
            .unwrap();
        assert!(harness.catalog.message("m1").is_some());
    }

    #[tokio::test]
    async fn test_allow_list_rejects_other_sources() {
        let harness = start_chat(AuthContext::open().with_allowed(["10.0.0.5".parse().unwrap()])).await;
        let result = client(None)
            .send_hello(harness.handle.local_addr(), "Mallory")
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProtocolError::AllowListRejected(_)));
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_allow_list_accepts_listed_source() {
        let harness = start_chat(AuthContext::open().with_allowed(["127.0.0.1".parse().unwrap()])).await;
        client(None)
            .send_hello(harness.handle.local_addr(), "Alice")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_envelope_gets_error_status() {
        let harness = start_chat(AuthContext::open()).await;
        let mut stream = BufReader::new(
            testutil::client_tls()
                .connect(harness.handle.local_addr(), Duration::from_secs(5))
                .await
                .unwrap(),
        );

        stream.write_all(b"{\"type\": \"MSG\", \"id\": 5]").await.unwrap();
        stream.flush().await.unwrap();

        let status: StatusHeader = read_header(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.status, Status::Err);
        assert_eq!(status.into_result().unwrap_err().kind(), ErrorKind::Protocol);
        assert!(harness.catalog.get_messages(10).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_error() {
        let harness = start_chat(AuthContext::open()).await;
        let mut stream = BufReader::new(
            testutil::client_tls()
                .connect(harness.handle.local_addr(), Duration::from_secs(5))
                .await
                .unwrap(),
        );

        write_header(&mut stream, &json!({"type": "MSG_PIN", "id": "m1"}))
            .await
            .unwrap();
        let status: StatusHeader = read_header(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code, Some(crate::protocol::ErrorCode::UnknownCommand));
    }

    #[tokio::test]
    async fn test_server_survives_bad_connection() {
        let harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();

        // plain TCP, no TLS: the handshake fails on the server side
        let mut raw = TcpStream::connect(peer).await.unwrap();
        raw.write_all(b"not tls at all").await.unwrap();
        drop(raw);

        client(None).send_hello(peer, "Alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(None).send_hello(addr, "Alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let harness = start_chat(AuthContext::open()).await;
        let peer = harness.handle.local_addr();
        harness.handle.shutdown();
        harness.handle.join().await;

        let result = client(None)
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1))
            .send_hello(peer, "Alice")
            .await;
        assert!(result.is_err());
    }
}

//! Accept loop shared by the chat and file services.
//!
//! Each accepted socket is handed to its own task. A semaphore caps how many
//! run at once; connections over the cap are closed immediately.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{ErrorKind, ProtocolError};

/// Pause after a failed accept; errors like EMFILE persist for a while
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a spawned service
pub struct ServiceHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already being served run to completion.
    pub fn shutdown(&self) {
        debug!("Shutdown requested for {} service", self.name);
        self.shutdown.notify_one();
    }

    /// Wait for the accept loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("{} service task failed: {}", self.name, e);
            }
        }
    }
}

/// Run `handler` for every connection on `listener` until shut down
pub(crate) fn spawn_accept_loop<H, Fut>(
    name: &'static str,
    listener: TcpListener,
    max_connections: usize,
    handler: H,
) -> std::io::Result<ServiceHandle>
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let shutdown = Arc::new(Notify::new());
    let semaphore = Arc::new(Semaphore::new(max_connections.max(1)));

    let stop = Arc::clone(&shutdown);
    let task = tokio::spawn(async move {
        loop {
            let (tcp_stream, peer_addr) = tokio::select! {
                _ = stop.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("{}: failed to accept connection: {}", name, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("{}: connection limit reached, rejecting {}", name, peer_addr);
                    continue;
                }
            };

            debug!("{}: new connection from {}", name, peer_addr);
            let connection = handler(tcp_stream, peer_addr);

            tokio::spawn(async move {
                let _permit = permit;
                match connection.await {
                    Ok(()) => debug!("{}: connection from {} closed normally", name, peer_addr),
                    Err(e) if e.kind() == ErrorKind::Authorization => {
                        warn!("{}: rejected {}: {}", name, peer_addr, e)
                    }
                    Err(e) => warn!("{}: connection from {} error: {}", name, peer_addr, e),
                }
            });
        }
        info!("{} service on {} stopped", name, local_addr);
    });

    Ok(ServiceHandle {
        name,
        local_addr,
        shutdown,
        task,
    })
}

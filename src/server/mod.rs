//! Server assembly: the route registry, shared counters, and the accept
//! loops that hand sockets to per-connection tasks.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::connection::Connection;
use crate::handler::HandlerFactory;
use crate::protocol::RequestHeader;

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

pub struct ServerBuilder {
    routes: HashMap<String, Arc<dyn HandlerFactory>>,
    address: Option<Vec<SocketAddr>>,
    buffer_size: usize,
    safe_mode: bool,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { routes: HashMap::new(), address: None, buffer_size: DEFAULT_BUFFER_SIZE, safe_mode: true }
    }

    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        self.address = Some(address.to_socket_addrs().unwrap().collect::<Vec<_>>());
        self
    }

    /// Registers a handler factory for an exact request path.
    pub fn route(mut self, path: impl Into<String>, factory: impl HandlerFactory + 'static) -> Self {
        self.routes.insert(path.into(), Arc::new(factory));
        self
    }

    /// Size of the per-connection receive buffer.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// When enabled (the default), handler faults are contained per
    /// connection instead of propagating out of the connection task.
    pub fn safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?;
        Ok(Server { shared: Arc::new(ServerShared::new(self.routes, self.safe_mode, self.buffer_size)), address })
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("address must be set")]
    MissingAddress,
}

/// State shared by the acceptor and every connection: the route table, the
/// safe-mode toggle, and the process-wide counters.
pub struct ServerShared {
    routes: HashMap<String, Arc<dyn HandlerFactory>>,
    safe_mode: bool,
    buffer_size: usize,
    connections: AtomicU64,
    active_connections: AtomicU64,
}

impl ServerShared {
    pub(crate) fn new(routes: HashMap<String, Arc<dyn HandlerFactory>>, safe_mode: bool, buffer_size: usize) -> Self {
        Self { routes, safe_mode, buffer_size, connections: AtomicU64::new(0), active_connections: AtomicU64::new(0) }
    }

    /// Routes a parsed request head to a handler factory; `None` means the
    /// connection answers with a stock 404.
    pub fn factory(&self, header: &RequestHeader) -> Option<Arc<dyn HandlerFactory>> {
        self.routes.get(header.uri().path()).cloned()
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Connections currently open.
    pub fn connections_counter(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Requests with a live handler right now.
    pub fn active_connections_counter(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_created(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_dropped(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    address: Vec<SocketAddr>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The shared state, exposing the process-wide counters.
    pub fn shared(&self) -> Arc<ServerShared> {
        self.shared.clone()
    }

    /// Accepts TCP connections forever, one task per connection.
    pub async fn start(self) {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

        info!("start listening at {:?}", self.address);
        let tcp_listener = match TcpListener::bind(self.address.as_slice()).await {
            Ok(tcp_listener) => tcp_listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };

        loop {
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let local = tcp_stream.local_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| "-".to_string());
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let (reader, writer) = tcp_stream.into_split();
                let connection = Connection::new(reader, writer, local, remote_addr.to_string(), shared);
                if let Err(e) = connection.run().await {
                    error!(cause = %e, "connection task failed");
                }
            });
        }
    }

    /// Accepts connections on a Unix-domain stream socket instead of TCP.
    #[cfg(unix)]
    pub async fn start_unix(self, path: impl AsRef<std::path::Path>) {
        use tokio::net::UnixListener;

        let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

        info!(path = %path.as_ref().display(), "start listening");
        let listener = match UnixListener::bind(path.as_ref()) {
            Ok(listener) => listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };
        let local = path.as_ref().display().to_string();

        loop {
            let (stream, _remote_addr) = match listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let local = local.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                let connection = Connection::new(reader, writer, local, "-".to_string(), shared);
                if let Err(e) = connection.run().await {
                    error!(cause = %e, "connection task failed");
                }
            });
        }
    }
}

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use std_semaphore::Semaphore;
use tracing::Span;

#[cfg(feature = "tls")]
use native_tls::TlsAcceptor;

use crate::connections::ConnRegistry;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::handler::CommandHandler;
use crate::opts::Opts;

use super::conn::Conn;
use super::stream::Stream;

/// Blocking MySQL server: one thread per accepted connection.
///
/// At most `opts.max_connections` clients are served at once; further clients wait in the
/// listen backlog until a connection ends.
pub struct Server<H> {
    opts: Opts,
    handler: Arc<H>,
    registry: Arc<ConnRegistry>,
    permits: Arc<Semaphore>,
    span: Span,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
}

impl<H: CommandHandler + 'static> Server<H> {
    pub fn new<O: TryInto<Opts>>(opts: O, handler: H) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;
        let max_connections = isize::try_from(opts.max_connections)
            .map_err(|_| Error::BadConfigError("max_connections is too large".to_string()))?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            opts,
            handler: Arc::new(handler),
            registry: Arc::new(ConnRegistry::new()),
            span: Span::none(),
            #[cfg(feature = "tls")]
            tls: None,
        })
    }

    /// Parent span of every connection thread
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Share a connection registry with other servers, so `KILL` reaches across them
    pub fn with_registry(mut self, registry: Arc<ConnRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Advertise `CLIENT_SSL` and accept TLS upgrades on TCP connections
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// Bind `opts.socket` if set, `opts.bind_address()` otherwise, and serve forever
    pub fn run(self) -> Result<()> {
        if let Some(socket) = &self.opts.socket {
            let listener = UnixListener::bind(socket)?;
            self.serve_unix(listener)
        } else {
            let listener = TcpListener::bind(self.opts.bind_address())?;
            self.serve(listener)
        }
    }

    pub fn serve(self, listener: TcpListener) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let permit = Permit::acquire(&self.permits);
            let (tcp, peer) = listener.accept()?;
            if let Err(err) = tcp.set_nodelay(self.opts.tcp_nodelay) {
                tracing::warn!(%peer, %err, "failed to set TCP_NODELAY");
            }
            self.spawn(Stream::tcp(tcp), peer.to_string(), permit);
        }
    }

    pub fn serve_unix(self, listener: UnixListener) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let permit = Permit::acquire(&self.permits);
            let (unix, _) = listener.accept()?;
            self.spawn(Stream::unix(unix), "socket".to_string(), permit);
        }
    }

    fn spawn(&self, stream: Stream, peer: String, permit: Permit) {
        let conn = self.registry.register(peer.clone());
        let connection_id = conn.id();
        let span = tracing::debug_span!(
            parent: &self.span,
            "connection",
            connection_id,
            peer = %peer
        );

        #[cfg(feature = "tls")]
        let tls = self.tls.clone().filter(|_| stream.is_tcp());
        #[cfg(feature = "tls")]
        let config = self.opts.handshake_config(connection_id, tls.is_some());
        #[cfg(not(feature = "tls"))]
        let config = self.opts.handshake_config(connection_id, false);

        let dispatcher = Dispatcher::new(Arc::clone(&self.handler), conn, config);
        let buffer_set = self.opts.buffer_pool.get_buffer_set();
        let client = Conn::new(stream, buffer_set, dispatcher);
        #[cfg(feature = "tls")]
        let client = match tls {
            Some(acceptor) => client.with_tls(acceptor),
            None => client,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("mysql-conn-{connection_id}"))
            .spawn(move || {
                let _enter = span.enter();
                tracing::debug!("connection accepted");
                match client.run() {
                    Ok(()) => tracing::debug!("connection closed"),
                    Err(Error::IoError(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        tracing::debug!("client disconnected")
                    }
                    Err(err) => tracing::warn!(%err, "connection failed"),
                }
                drop(permit);
            });
        if let Err(err) = spawned {
            tracing::warn!(connection_id, %err, "failed to spawn connection thread");
        }
    }
}

/// One slot of `max_connections`, released on drop
struct Permit(Arc<Semaphore>);

impl Permit {
    fn acquire(semaphore: &Arc<Semaphore>) -> Self {
        semaphore.acquire();
        Self(Arc::clone(semaphore))
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.release();
    }
}

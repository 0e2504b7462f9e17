use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, instrument};

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::TlsAcceptor;

use crate::connections::ConnRegistry;
use crate::dispatch::{Dispatcher, write_too_many_connections};
use crate::error::{Error, Result};
use crate::handler::CommandHandler;
use crate::opts::Opts;

use super::conn::Conn;
use super::stream::Stream;

/// Async MySQL server: one task per accepted connection
pub struct Server<H> {
    opts: Opts,
    handler: Arc<H>,
    registry: Arc<ConnRegistry>,
    permits: Arc<Semaphore>,
    span: Span,
    #[cfg(feature = "tokio-tls")]
    tls: Option<TlsAcceptor>,
}

impl<H: CommandHandler + 'static> Server<H> {
    pub fn new<O: TryInto<Opts>>(opts: O, handler: H) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(opts.max_connections)),
            opts,
            handler: Arc::new(handler),
            registry: Arc::new(ConnRegistry::new()),
            span: Span::none(),
            #[cfg(feature = "tokio-tls")]
            tls: None,
        })
    }

    /// Parent span of every connection task
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
    #[cfg(feature = "tokio-tls")]
    pub fn with_tls(mut self, acceptor: native_tls::TlsAcceptor) -> Self {
        self.tls = Some(TlsAcceptor::from(acceptor));
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
    pub async fn run(self) -> Result<()> {
        if let Some(socket) = &self.opts.socket {
            let listener = UnixListener::bind(socket)?;
            self.serve_unix(listener).await
        } else {
            let listener = TcpListener::bind(self.opts.bind_address()).await?;
            self.serve(listener).await
        }
    }

    #[instrument(skip_all, parent = &self.span)]
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::debug!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let (tcp, peer) = listener.accept().await?;
            if let Err(err) = tcp.set_nodelay(self.opts.tcp_nodelay) {
                tracing::warn!(%peer, %err, "failed to set TCP_NODELAY");
            }
            self.spawn(Stream::tcp(tcp), peer.to_string()).await;
        }
    }

    #[instrument(skip_all, parent = &self.span)]
    pub async fn serve_unix(self, listener: UnixListener) -> Result<()> {
        tracing::debug!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let (unix, _) = listener.accept().await?;
            self.spawn(Stream::unix(unix), "socket".to_string()).await;
        }
    }

    async fn spawn(&self, mut stream: Stream, peer: String) {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::warn!(%peer, "too many connections");
            let mut out = Vec::new();
            if write_too_many_connections(&mut out).is_ok() {
                let _ = stream.write_all(&out).await;
                let _ = stream.flush().await;
            }
            return;
        };

        let conn = self.registry.register(peer.clone());
        let connection_id = conn.id();
        let span = tracing::debug_span!(
            parent: &self.span,
            "connection",
            connection_id,
            peer = %peer
        );

        #[cfg(feature = "tokio-tls")]
        let tls = self.tls.clone().filter(|_| stream.is_tcp());
        #[cfg(feature = "tokio-tls")]
        let config = self.opts.handshake_config(connection_id, tls.is_some());
        #[cfg(not(feature = "tokio-tls"))]
        let config = self.opts.handshake_config(connection_id, false);

        let dispatcher = Dispatcher::new(Arc::clone(&self.handler), conn, config);
        let buffer_set = self.opts.buffer_pool.get_buffer_set();
        let client = Conn::new(stream, buffer_set, dispatcher);
        #[cfg(feature = "tokio-tls")]
        let client = match tls {
            Some(acceptor) => client.with_tls(acceptor),
            None => client,
        };

        tokio::spawn(
            async move {
                tracing::debug!("connection accepted");
                match client.run().await {
                    Ok(()) => tracing::debug!("connection closed"),
                    Err(Error::IoError(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        tracing::debug!("client disconnected")
                    }
                    Err(err) => tracing::warn!(%err, "connection failed"),
                }
                drop(permit);
            }
            .instrument(span),
        );
    }
}

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::{TlsAcceptor, TlsStream};

/// An accepted client socket
pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tokio-tls")]
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    Unix(BufReader<UnixStream>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    /// Run the server side of the TLS handshake on a plain TCP stream
    #[cfg(feature = "tokio-tls")]
    pub async fn accept_tls(self, acceptor: &TlsAcceptor) -> std::io::Result<Self> {
        let tcp = match self {
            Self::Tcp(buf_reader) => buf_reader.into_inner(),
            Self::Tls(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Already using TLS",
                ));
            }
            Self::Unix(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "TLS not supported for Unix sockets",
                ));
            }
        };

        let tls_stream = acceptor.accept(tcp).await.map_err(std::io::Error::other)?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tokio-tls")]
            Self::Tls(reader) => reader.read_exact(buf).await.map(|_| ()),
            Self::Unix(reader) => reader.read_exact(buf).await.map(|_| ()),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().write_all(buf).await,
            #[cfg(feature = "tokio-tls")]
            Self::Tls(reader) => reader.get_mut().write_all(buf).await,
            Self::Unix(reader) => reader.get_mut().write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().flush().await,
            #[cfg(feature = "tokio-tls")]
            Self::Tls(reader) => reader.get_mut().flush().await,
            Self::Unix(reader) => reader.get_mut().flush().await,
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().shutdown().await,
            #[cfg(feature = "tokio-tls")]
            Self::Tls(reader) => reader.get_mut().shutdown().await,
            Self::Unix(reader) => reader.get_mut().shutdown().await,
        }
    }
}

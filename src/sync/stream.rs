use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

#[cfg(feature = "tls")]
use native_tls::{TlsAcceptor, TlsStream};

/// An accepted client socket
pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
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

    #[cfg(feature = "tls")]
    pub fn accept_tls(self, acceptor: &TlsAcceptor) -> std::io::Result<Self> {
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

        let tls_stream = acceptor.accept(tcp).map_err(std::io::Error::other)?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(r) => r.read_exact(buf),
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.read_exact(buf),
            Self::Unix(r) => r.read_exact(buf),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(r) => r.get_mut().write_all(buf),
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.get_mut().write_all(buf),
            Self::Unix(r) => r.get_mut().write_all(buf),
        }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(r) => r.get_mut().flush(),
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.get_mut().flush(),
            Self::Unix(r) => r.get_mut().flush(),
        }
    }

    pub fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(r) => r.get_mut().shutdown(Shutdown::Both),
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.get_mut().shutdown(),
            Self::Unix(r) => r.get_mut().shutdown(Shutdown::Both),
        }
    }
}

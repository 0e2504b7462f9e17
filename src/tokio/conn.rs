use tracing::instrument;
use zerocopy::{FromZeros, IntoBytes};

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::TlsAcceptor;

use crate::buffer_pool::PooledBufferSet;
use crate::constant::MAX_PAYLOAD_LENGTH;
use crate::dispatch::{DispatchResult, Dispatcher};
use crate::error::{Error, Result};
use crate::handler::CommandHandler;
use crate::protocol::packet::PacketHeader;

use super::stream::Stream;

/// One accepted client: its socket, its buffers and its dispatcher
pub struct Conn<H: CommandHandler> {
    stream: Stream,
    buffer_set: PooledBufferSet,
    dispatcher: Dispatcher<H>,
    #[cfg(feature = "tokio-tls")]
    tls: Option<TlsAcceptor>,
}

impl<H: CommandHandler> Conn<H> {
    pub fn new(stream: Stream, buffer_set: PooledBufferSet, dispatcher: Dispatcher<H>) -> Self {
        Self {
            stream,
            buffer_set,
            dispatcher,
            #[cfg(feature = "tokio-tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tokio-tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn connection_id(&self) -> u32 {
        self.dispatcher.connection_id()
    }

    /// Serve the connection until the client quits, the connection is killed, or I/O fails
    #[instrument(skip_all)]
    pub async fn run(self) -> Result<()> {
        let Self {
            mut stream,
            mut buffer_set,
            mut dispatcher,
            #[cfg(feature = "tokio-tls")]
            tls,
        } = self;

        dispatcher.start(buffer_set.new_write_buffer())?;
        flush(&mut stream, buffer_set.write_buffer()).await?;

        loop {
            let sequence_id = read_payload(&mut stream, &mut buffer_set.read_buffer).await?;
            let (payload, out) = buffer_set.split();
            let result = dispatcher.handle_packet(sequence_id, payload, out)?;
            flush(&mut stream, buffer_set.write_buffer()).await?;

            match result {
                DispatchResult::Continue => {}
                #[cfg(feature = "tokio-tls")]
                DispatchResult::UpgradeTls => {
                    let acceptor = tls.as_ref().ok_or_else(|| {
                        Error::UnsupportedCapability(
                            "TLS is not configured on this server".to_string(),
                        )
                    })?;
                    stream = stream.accept_tls(acceptor).await?;
                    dispatcher.tls_established()?;
                    tracing::debug!(connection_id = dispatcher.connection_id(), "TLS established");
                }
                #[cfg(not(feature = "tokio-tls"))]
                DispatchResult::UpgradeTls => {
                    return Err(Error::BadConfigError(
                        "TLS requested but tokio-tls feature is not enabled".to_string(),
                    ));
                }
                DispatchResult::Close => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn flush(stream: &mut Stream, out: &[u8]) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    stream.write_all(out).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one packet payload into `buffer`, returning its sequence id.
///
/// A payload of exactly 0xFFFFFF bytes announces a continuation packet, which is not supported.
#[instrument(skip_all)]
pub async fn read_payload(reader: &mut Stream, buffer: &mut Vec<u8>) -> Result<u8> {
    let mut packet_header = PacketHeader::new_zeroed();

    buffer.clear();
    reader.read_exact(packet_header.as_mut_bytes()).await?;

    let length = packet_header.length();
    if length == MAX_PAYLOAD_LENGTH {
        return Err(Error::PacketTooLarge(length));
    }

    buffer.resize(length, 0);
    reader.read_exact(buffer).await?;
    Ok(packet_header.sequence_id)
}

use zerocopy::{FromZeros, IntoBytes};

#[cfg(feature = "tls")]
use native_tls::TlsAcceptor;

use crate::buffer_pool::PooledBufferSet;
use crate::constant::MAX_PAYLOAD_LENGTH;
use crate::dispatch::{DispatchResult, Dispatcher};
use crate::error::{Error, Result};
use crate::handler::CommandHandler;
use crate::protocol::packet::PacketHeader;

use super::stream::Stream;

/// One accepted client, served on its own thread
pub struct Conn<H: CommandHandler> {
    stream: Stream,
    buffer_set: PooledBufferSet,
    dispatcher: Dispatcher<H>,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
}

impl<H: CommandHandler> Conn<H> {
    pub fn new(stream: Stream, buffer_set: PooledBufferSet, dispatcher: Dispatcher<H>) -> Self {
        Self {
            stream,
            buffer_set,
            dispatcher,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn connection_id(&self) -> u32 {
        self.dispatcher.connection_id()
    }

    /// Serve the connection until the client quits, the connection is killed, or I/O fails
    #[tracing::instrument(skip_all)]
    pub fn run(self) -> Result<()> {
        let Self {
            mut stream,
            mut buffer_set,
            mut dispatcher,
            #[cfg(feature = "tls")]
            tls,
        } = self;

        dispatcher.start(buffer_set.new_write_buffer())?;
        flush(&mut stream, buffer_set.write_buffer())?;

        loop {
            let sequence_id = read_payload(&mut stream, &mut buffer_set.read_buffer)?;
            let (payload, out) = buffer_set.split();
            let result = dispatcher.handle_packet(sequence_id, payload, out)?;
            flush(&mut stream, buffer_set.write_buffer())?;

            match result {
                DispatchResult::Continue => {}
                #[cfg(feature = "tls")]
                DispatchResult::UpgradeTls => {
                    let acceptor = tls.as_ref().ok_or_else(|| {
                        Error::UnsupportedCapability(
                            "TLS is not configured on this server".to_string(),
                        )
                    })?;
                    stream = stream.accept_tls(acceptor)?;
                    dispatcher.tls_established()?;
                    tracing::debug!(connection_id = dispatcher.connection_id(), "TLS established");
                }
                #[cfg(not(feature = "tls"))]
                DispatchResult::UpgradeTls => {
                    return Err(Error::BadConfigError(
                        "TLS requested but tls feature is not enabled".to_string(),
                    ));
                }
                DispatchResult::Close => {
                    let _ = stream.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

fn flush(stream: &mut Stream, out: &[u8]) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    stream.write_all(out)?;
    stream.flush()?;
    Ok(())
}

/// Read one packet payload into `buffer`, returning its sequence id.
///
/// A payload of exactly 0xFFFFFF bytes announces a continuation packet, which is not supported.
pub fn read_payload(reader: &mut Stream, buffer: &mut Vec<u8>) -> Result<u8> {
    buffer.clear();

    let mut header = PacketHeader::new_zeroed();
    reader.read_exact(header.as_mut_bytes())?;

    let length = header.length();
    if length == MAX_PAYLOAD_LENGTH {
        return Err(Error::PacketTooLarge(length));
    }

    buffer.resize(length, 0);
    reader.read_exact(buffer)?;
    Ok(header.sequence_id)
}

use zerocopy::byteorder::little_endian::U32 as U32LE;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};

/// Fixed 32-byte prefix shared by SSLRequest and HandshakeResponse41
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub(crate) struct ClientPrefix {
    pub client_flag: U32LE,
    pub max_packet_size: U32LE,
    pub character_set: u8,
    pub filler: [u8; 23],
}

impl ClientPrefix {
    pub fn new(capability_flags: CapabilityFlags, max_packet_size: u32, charset: u8) -> Self {
        Self {
            client_flag: U32LE::new(capability_flags.bits()),
            max_packet_size: U32LE::new(max_packet_size),
            character_set: charset,
            filler: [0; 23],
        }
    }

    pub fn capability_flags(&self) -> CapabilityFlags {
        CapabilityFlags::from_bits_retain(self.client_flag.get())
    }
}

/// SSLRequest sent by the client to ask for a TLS upgrade before HandshakeResponse41
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslRequest {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
}

impl SslRequest {
    pub const LEN: usize = 32;

    pub fn read(payload: &[u8]) -> Result<Self> {
        if payload.len() != Self::LEN {
            return Err(Error::InvalidPacket);
        }
        let prefix = ClientPrefix::ref_from_bytes(payload).map_err(|_| Error::InvalidPacket)?;
        let capability_flags = prefix.capability_flags();
        if !capability_flags.contains(CapabilityFlags::CLIENT_SSL) {
            return Err(Error::InvalidPacket);
        }
        Ok(Self {
            capability_flags,
            max_packet_size: prefix.max_packet_size.get(),
            charset: prefix.character_set,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let prefix = ClientPrefix::new(self.capability_flags, self.max_packet_size, self.charset);
        out.extend_from_slice(prefix.as_bytes());
    }

    /// Whether a connection-phase payload is an SSLRequest rather than a full response
    pub fn matches(payload: &[u8]) -> bool {
        payload.len() == Self::LEN
            && ClientPrefix::ref_from_bytes(payload)
                .map(|prefix| prefix.capability_flags().contains(CapabilityFlags::CLIENT_SSL))
                .unwrap_or(false)
    }
}

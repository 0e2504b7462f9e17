use rand::Rng;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::{
    AUTH_PLUGIN_DATA_LEN, CAPABILITIES_CONFIGURABLE, CAPABILITIES_SERVER_DEFAULT,
    CapabilityFlags, PROTOCOL_VERSION, ServerStatusFlags,
};
use crate::error::{Error, Result};
use crate::protocol::connection::ssl_request::{ClientPrefix, SslRequest};
use crate::protocol::primitive::*;

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
#[repr(C, packed)]
struct HandshakeFixedFields {
    connection_id: U32LE,
    auth_data_part1: [u8; 8],
    filler: u8,
    capability_flags_lower: U16LE,
    charset: u8,
    status_flags: U16LE,
    capability_flags_upper: U16LE,
    auth_data_len: u8,
}

/// Initial Handshake Packet (protocol version 10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Parts 1 and 2 of auth-plugin-data, without the terminating NUL
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: ServerStatusFlags,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn auth_plugin_data(&self) -> &[u8] {
        &self.auth_plugin_data
    }

    pub fn read(payload: &[u8]) -> Result<Self> {
        let (protocol_version, data) = read_int_1(payload)?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedCapability(format!(
                "handshake protocol version {protocol_version}"
            )));
        }

        let (server_version, data) = read_string_null(data)?;
        let (fixed, rest) =
            HandshakeFixedFields::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;

        let cap_bits = ((fixed.capability_flags_upper.get() as u32) << 16)
            | (fixed.capability_flags_lower.get() as u32);
        let capability_flags = CapabilityFlags::from_bits_retain(cap_bits);

        let (_reserved, mut data) = read_string_fix(rest, 10)?;

        let mut auth_plugin_data = fixed.auth_data_part1.to_vec();
        if capability_flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            // Part 2 is NUL-terminated but the NUL is included in auth_data_len
            let part2_len = (fixed.auth_data_len as usize).saturating_sub(8).max(13);
            let (part2, rest) = read_string_fix(data, part2_len)?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            auth_plugin_data.extend_from_slice(part2);
            data = rest;
        }

        let auth_plugin_name = if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            // Some servers omit the final NUL
            match read_string_null(data) {
                Ok((name, _)) => name,
                Err(_) => read_string_eof(data),
            }
        } else {
            &[]
        };

        Ok(Self {
            protocol_version,
            server_version: String::from_utf8_lossy(server_version).into_owned(),
            connection_id: fixed.connection_id.get(),
            auth_plugin_data,
            capability_flags,
            charset: fixed.charset,
            status_flags: ServerStatusFlags::from_bits_retain(fixed.status_flags.get()),
            auth_plugin_name: String::from_utf8_lossy(auth_plugin_name).into_owned(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.auth_plugin_data.len() < 8 {
            return Err(Error::LibraryBug(crate::error::eyre!(
                "auth-plugin-data must hold at least 8 bytes, got {}",
                self.auth_plugin_data.len()
            )));
        }
        let (part1, part2) = self.auth_plugin_data.split_at(8);
        let plugin_auth = self
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH);
        let auth_data_len = if plugin_auth {
            u8::try_from(self.auth_plugin_data.len() + 1).map_err(|_| Error::InvalidPacket)?
        } else {
            0
        };

        write_int_1(out, self.protocol_version);
        write_string_null(out, &self.server_version);

        let mut auth_data_part1 = [0u8; 8];
        auth_data_part1.copy_from_slice(part1);
        let bits = self.capability_flags.bits();
        let fixed = HandshakeFixedFields {
            connection_id: U32LE::new(self.connection_id),
            auth_data_part1,
            filler: 0,
            capability_flags_lower: U16LE::new(bits as u16),
            charset: self.charset,
            status_flags: U16LE::new(self.status_flags.bits()),
            capability_flags_upper: U16LE::new((bits >> 16) as u16),
            auth_data_len,
        };
        out.extend_from_slice(fixed.as_bytes());
        out.extend_from_slice(&[0u8; 10]);

        if self
            .capability_flags
            .contains(CapabilityFlags::CLIENT_SECURE_CONNECTION)
        {
            // Pad to the 13-byte minimum the reader expects, NUL included
            write_bytes_null(out, part2);
            for _ in part2.len() + 1..13 {
                out.push(0);
            }
        }
        if plugin_auth {
            write_string_null(out, &self.auth_plugin_name);
        }
        Ok(())
    }
}

/// Generate the random auth-plugin-data sent in the initial handshake.
///
/// Bytes are drawn from 1..=127 so the NUL-terminated part 2 never ends early.
pub fn generate_auth_plugin_data() -> [u8; AUTH_PLUGIN_DATA_LEN] {
    let mut rng = rand::thread_rng();
    let mut data = [0u8; AUTH_PLUGIN_DATA_LEN];
    for byte in &mut data {
        *byte = rng.gen_range(1..=127);
    }
    data
}

/// Handshake response packet sent by client (HandshakeResponse41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse41 {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub connect_attrs: Vec<(String, String)>,
    pub zstd_compression_level: Option<u8>,
}

impl HandshakeResponse41 {
    /// Parse a HandshakeResponse41.
    ///
    /// Every optional block is gated on the flags the client itself sent, in wire order.
    pub fn read(payload: &[u8]) -> Result<Self> {
        let (prefix, data) =
            ClientPrefix::ref_from_prefix(payload).map_err(|_| Error::UnexpectedEof)?;
        let capability_flags = prefix.capability_flags();
        if !capability_flags.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            return Err(Error::UnsupportedCapability(
                "clients without CLIENT_PROTOCOL_41".to_string(),
            ));
        }

        let (username, data) = read_string_null(data)?;

        let (auth_response, mut data) = if capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            read_string_lenenc(data)?
        } else {
            let (len, rest) = read_int_1(data)?;
            read_string_fix(rest, len as usize)?
        };

        let mut database = None;
        if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            let (db, rest) = read_string_null(data)?;
            database = Some(to_str(db)?.to_string());
            data = rest;
        }

        let mut auth_plugin_name = None;
        if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let (plugin, rest) = read_string_null(data)?;
            auth_plugin_name = Some(to_str(plugin)?.to_string());
            data = rest;
        }

        let mut connect_attrs = Vec::new();
        if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            let (block, rest) = read_string_lenenc(data)?;
            let mut attrs = block;
            while !attrs.is_empty() {
                let (key, r) = read_string_lenenc(attrs)?;
                let (value, r) = read_string_lenenc(r)?;
                connect_attrs.push((
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                ));
                attrs = r;
            }
            data = rest;
        }

        let mut zstd_compression_level = None;
        if capability_flags.contains(CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM) {
            let (level, _) = read_int_1(data)?;
            zstd_compression_level = Some(level);
        }

        Ok(Self {
            capability_flags,
            max_packet_size: prefix.max_packet_size.get(),
            charset: prefix.character_set,
            username: to_str(username)?.to_string(),
            auth_response: auth_response.to_vec(),
            database,
            auth_plugin_name,
            connect_attrs,
            zstd_compression_level,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let caps = self.capability_flags;
        let prefix = ClientPrefix::new(caps, self.max_packet_size, self.charset);
        out.extend_from_slice(prefix.as_bytes());

        write_string_null(out, &self.username);

        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            write_bytes_lenenc(out, &self.auth_response);
        } else {
            let len = u8::try_from(self.auth_response.len()).map_err(|_| Error::InvalidPacket)?;
            write_int_1(out, len);
            write_bytes_fix(out, &self.auth_response);
        }

        if caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            write_string_null(out, self.database.as_deref().unwrap_or_default());
        }

        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            write_string_null(out, self.auth_plugin_name.as_deref().unwrap_or_default());
        }

        if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            let mut attrs = Vec::new();
            for (key, value) in &self.connect_attrs {
                write_string_lenenc(&mut attrs, key);
                write_string_lenenc(&mut attrs, value);
            }
            write_bytes_lenenc(out, &attrs);
        }

        if caps.contains(CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM) {
            write_int_1(out, self.zstd_compression_level.unwrap_or(3));
        }
        Ok(())
    }
}

/// Auth switch request from server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Read auth switch request (0xFE with length >= 9)
    pub fn read(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != 0xFE {
            return Err(Error::InvalidPacket);
        }

        let (plugin_name, data) = read_string_null(data)?;
        match data.split_last() {
            Some((0, plugin_data)) => Ok(Self {
                plugin_name: String::from_utf8_lossy(plugin_name).into_owned(),
                plugin_data: plugin_data.to_vec(),
            }),
            _ => Err(Error::InvalidPacket),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, 0xFE);
        write_string_null(out, &self.plugin_name);
        write_bytes_null(out, &self.plugin_data);
    }
}

// ============================================================================
// State Machine API for Handshake
// ============================================================================

/// Server-side parameters of the connection phase
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub server_version: String,
    pub connection_id: u32,
    /// Host-requested capabilities; only bits in `CAPABILITIES_CONFIGURABLE` are honored
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status_flags: ServerStatusFlags,
    pub auth_plugin_name: String,
    pub auth_plugin_data: [u8; AUTH_PLUGIN_DATA_LEN],
    pub tls: bool,
}

impl HandshakeConfig {
    /// Capabilities advertised in the initial handshake
    pub fn server_capabilities(&self) -> CapabilityFlags {
        let mut caps =
            CAPABILITIES_SERVER_DEFAULT | (self.capabilities & CAPABILITIES_CONFIGURABLE);
        if self.tls {
            caps |= CapabilityFlags::CLIENT_SSL;
        }
        caps
    }

    pub fn initial_handshake(&self) -> InitialHandshake {
        InitialHandshake {
            protocol_version: PROTOCOL_VERSION,
            server_version: self.server_version.clone(),
            connection_id: self.connection_id,
            auth_plugin_data: self.auth_plugin_data.to_vec(),
            capability_flags: self.server_capabilities(),
            charset: self.charset,
            status_flags: self.status_flags,
            auth_plugin_name: self.auth_plugin_name.clone(),
        }
    }
}

/// Result of driving the handshake state machine
#[derive(Debug)]
pub enum HandshakeResult {
    /// Write this payload to the client, then read the next packet
    Write(Vec<u8>),
    /// SSLRequest received: upgrade the stream to TLS, then call `drive_after_tls()`
    UpgradeTls(SslRequest),
    /// HandshakeResponse41 accepted; the caller authenticates and sends OK or ERR
    Established {
        response: HandshakeResponse41,
        capability_flags: CapabilityFlags,
    },
}

/// State machine for the server side of the MySQL connection phase
///
/// Pure parsing and packet generation without I/O dependencies.
#[derive(Debug)]
pub enum Handshake {
    /// Initial handshake not yet sent
    Start { config: HandshakeConfig },
    /// Initial handshake sent, waiting for SSLRequest or HandshakeResponse41
    AwaitResponse { config: HandshakeConfig, tls_active: bool },
    /// SSLRequest accepted, waiting for the caller to finish the TLS upgrade
    AwaitTls { config: HandshakeConfig },
    /// Terminal state
    Established,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self::Start { config }
    }

    /// Drive the state machine with the next client payload.
    ///
    /// The first call passes an empty payload and yields the initial handshake.
    pub fn drive(&mut self, payload: &[u8]) -> Result<HandshakeResult> {
        match std::mem::replace(self, Self::Established) {
            Self::Start { config } => {
                let mut out = Vec::new();
                config.initial_handshake().write(&mut out)?;
                *self = Self::AwaitResponse {
                    config,
                    tls_active: false,
                };
                Ok(HandshakeResult::Write(out))
            }

            Self::AwaitResponse { config, tls_active } => {
                if !tls_active && SslRequest::matches(payload) {
                    if !config.tls {
                        return Err(Error::UnsupportedCapability(
                            "TLS is not configured on this server".to_string(),
                        ));
                    }
                    let request = SslRequest::read(payload)?;
                    *self = Self::AwaitTls { config };
                    return Ok(HandshakeResult::UpgradeTls(request));
                }

                let response = HandshakeResponse41::read(payload)?;
                let capability_flags = response.capability_flags & config.server_capabilities();
                tracing::debug!(
                    username = %response.username,
                    database = ?response.database,
                    capabilities = ?capability_flags,
                    "handshake response accepted"
                );
                Ok(HandshakeResult::Established {
                    response,
                    capability_flags,
                })
            }

            Self::AwaitTls { config } => {
                *self = Self::AwaitTls { config };
                Err(Error::LibraryBug(crate::error::eyre!(
                    "drive() called while waiting for the TLS upgrade"
                )))
            }

            Self::Established => Err(Error::LibraryBug(crate::error::eyre!(
                "drive() called after the handshake finished"
            ))),
        }
    }

    /// Continue after the stream has been upgraded to TLS
    pub fn drive_after_tls(&mut self) -> Result<()> {
        match std::mem::replace(self, Self::Established) {
            Self::AwaitTls { config } => {
                *self = Self::AwaitResponse {
                    config,
                    tls_active: true,
                };
                Ok(())
            }
            other => {
                *self = other;
                Err(Error::LibraryBug(crate::error::eyre!(
                    "drive_after_tls() called outside of the TLS upgrade"
                )))
            }
        }
    }
}

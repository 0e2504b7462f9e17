use crate::constant::{CapabilityFlags, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Header byte of an OK packet
pub const OK_HEADER: u8 = 0x00;
/// Header byte of an EOF packet, and of the OK packet that ends a resultset with `CLIENT_DEPRECATE_EOF`
pub const EOF_HEADER: u8 = 0xFE;
/// Header byte of an ERR packet
pub const ERR_HEADER: u8 = 0xFF;

/// Packet type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ok,
    Err,
    Eof,
    /// Anything else: column counts, column definitions, rows, command-specific payloads
    Data,
}

/// Classify a server packet from its first payload bytes.
///
/// `payload_len` is the full payload length from the header; a 0xFE header only denotes
/// EOF on payloads shorter than 9 bytes, since a row may start with an 8-byte lenenc prefix.
pub fn detect_packet_type(payload: &[u8], payload_len: usize) -> Result<PacketType> {
    match payload.first() {
        None => Err(Error::InvalidPacket),
        Some(&ERR_HEADER) => Ok(PacketType::Err),
        Some(&EOF_HEADER) if payload_len < 9 => Ok(PacketType::Eof),
        Some(&OK_HEADER) => Ok(PacketType::Ok),
        Some(_) => Ok(PacketType::Data),
    }
}

/// OK packet response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPayload {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
    pub info: String,
    /// Raw session-state-change block, present only with `SERVER_SESSION_STATE_CHANGED`
    pub session_state_changes: Option<Vec<u8>>,
}

impl OkPayload {
    pub fn new(status_flags: ServerStatusFlags) -> Self {
        Self {
            header: OK_HEADER,
            affected_rows: 0,
            last_insert_id: 0,
            status_flags,
            warnings: 0,
            info: String::new(),
            session_state_changes: None,
        }
    }

    /// OK packet that terminates a resultset under `CLIENT_DEPRECATE_EOF`
    pub fn eof_replacement(status_flags: ServerStatusFlags, warnings: u16) -> Self {
        Self {
            header: EOF_HEADER,
            warnings,
            ..Self::new(status_flags)
        }
    }

    pub fn read(payload: &[u8], capabilities: CapabilityFlags) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != OK_HEADER && header != EOF_HEADER {
            return Err(Error::InvalidPacket);
        }

        let (affected_rows, rest) = read_int_lenenc(data)?;
        let (last_insert_id, mut rest) = read_int_lenenc(rest)?;

        let mut status_flags = ServerStatusFlags::empty();
        let mut warnings = 0;
        if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            let (status, r) = read_int_2(rest)?;
            let (warn, r) = read_int_2(r)?;
            status_flags = ServerStatusFlags::from_bits_retain(status);
            warnings = warn;
            rest = r;
        } else if capabilities.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
            let (status, r) = read_int_2(rest)?;
            status_flags = ServerStatusFlags::from_bits_retain(status);
            rest = r;
        }

        let mut session_state_changes = None;
        let info = if capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            if rest.is_empty() {
                Vec::new()
            } else {
                let (info, r) = read_string_lenenc(rest)?;
                rest = r;
                if status_flags.contains(ServerStatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (state, _) = read_string_lenenc(rest)?;
                    session_state_changes = Some(state.to_vec());
                }
                info.to_vec()
            }
        } else {
            read_string_eof(rest).to_vec()
        };

        Ok(Self {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: String::from_utf8_lossy(&info).into_owned(),
            session_state_changes,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_1(out, self.header);
        write_int_lenenc(out, self.affected_rows);
        write_int_lenenc(out, self.last_insert_id);
        if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            write_int_2(out, self.status_flags.bits());
            write_int_2(out, self.warnings);
        } else if capabilities.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
            write_int_2(out, self.status_flags.bits());
        }

        if capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let state = self
                .session_state_changes
                .as_deref()
                .filter(|_| {
                    self.status_flags
                        .contains(ServerStatusFlags::SERVER_SESSION_STATE_CHANGED)
                });
            if !self.info.is_empty() || state.is_some() {
                write_string_lenenc(out, &self.info);
            }
            if let Some(state) = state {
                write_bytes_lenenc(out, state);
            }
        } else {
            write_bytes_fix(out, self.info.as_bytes());
        }
    }
}

/// ERR packet response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.error_code, self.sql_state, self.message)]
pub struct ErrPayload {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPayload {
    pub fn new(error_code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }

    pub fn read(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != ERR_HEADER {
            return Err(Error::InvalidPacket);
        }

        let (error_code, data) = read_int_2(data)?;

        // SQL state marker '#' is only sent with CLIENT_PROTOCOL_41
        let (sql_state, rest) = if data.first() == Some(&b'#') {
            let (state_bytes, rest) = read_string_fix(&data[1..], 5)?;
            (String::from_utf8_lossy(state_bytes).into_owned(), rest)
        } else {
            (String::new(), data)
        };

        Ok(Self {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(read_string_eof(rest)).into_owned(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_1(out, ERR_HEADER);
        write_int_2(out, self.error_code);
        if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            write_int_1(out, b'#');
            let mut state = [b'0'; 5];
            for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
                *dst = src;
            }
            write_bytes_fix(out, &state);
        }
        write_bytes_fix(out, self.message.as_bytes());
    }
}

/// EOF packet body after the 0xFE header (zero-copy)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct EofPacket {
    pub warnings: U16LE,
    pub status_flags: U16LE,
}

/// EOF packet response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPayload {
    pub warnings: u16,
    pub status_flags: ServerStatusFlags,
}

impl EofPayload {
    pub fn new(status_flags: ServerStatusFlags, warnings: u16) -> Self {
        Self {
            warnings,
            status_flags,
        }
    }

    pub fn read(payload: &[u8], capabilities: CapabilityFlags) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != EOF_HEADER || payload.len() >= 9 {
            return Err(Error::InvalidPacket);
        }
        if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            return Ok(Self::new(ServerStatusFlags::empty(), 0));
        }
        let (eof, _) = EofPacket::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
        Ok(Self {
            warnings: eof.warnings.get(),
            status_flags: ServerStatusFlags::from_bits_retain(eof.status_flags.get()),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_1(out, EOF_HEADER);
        if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            let eof = EofPacket {
                warnings: U16LE::new(self.warnings),
                status_flags: U16LE::new(self.status_flags.bits()),
            };
            out.extend_from_slice(eof.as_bytes());
        }
    }
}

/// Write the packet that closes a column-definition block or a resultset:
/// EOF normally, the 0xFE-headed OK under `CLIENT_DEPRECATE_EOF`
pub fn write_terminator(
    out: &mut Vec<u8>,
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
    warnings: u16,
) {
    if capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        OkPayload::eof_replacement(status_flags, warnings).write(out, capabilities);
    } else {
        EofPayload::new(status_flags, warnings).write(out, capabilities);
    }
}

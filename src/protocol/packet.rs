use std::collections::VecDeque;
use std::io::Read;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_PAYLOAD_LENGTH;
use crate::error::{Error, Result};
use crate::protocol::response::{PacketType, detect_packet_type};

/// MySQL packet header (zero-copy)
///
/// Layout matches MySQL wire protocol:
/// - length: 3 bytes (little-endian, payload length)
/// - sequence_id: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    /// A length of 0xFFFFFF announces a continuation packet, so it is rejected as well
    pub fn encode(length: usize, sequence_id: u8) -> Result<Self> {
        if length >= MAX_PAYLOAD_LENGTH {
            return Err(Error::PacketTooLarge(length));
        }
        let len = u32::to_le_bytes(length as u32);
        Ok(Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        })
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(header, _)| header)
            .map_err(|_| Error::UnexpectedEof)
    }
}

/// Per-packet sequence number.
///
/// Wraps modulo 256: the successor of 255 is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceId(pub u8);

impl SequenceId {
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn advance(&mut self) -> u8 {
        let current = self.0;
        self.0 = self.0.wrapping_add(1);
        current
    }
}

/// An owned packet: header fields plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            sequence_id,
            payload,
        }
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// Parse one packet from the front of `data`, returning it with the remaining bytes
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        let header = PacketHeader::from_bytes(data)?;
        let (payload, rest) = crate::protocol::primitive::read_string_fix(&data[4..], header.length())?;
        Ok((Self::new(header.sequence_id, payload.to_vec()), rest))
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        write_packet(&mut out, self.sequence_id, &self.payload)?;
        Ok(out)
    }
}

/// Append a framed packet to `out`
pub fn write_packet(out: &mut Vec<u8>, sequence_id: u8, payload: &[u8]) -> Result<()> {
    let header = PacketHeader::encode(payload.len(), sequence_id)?;
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Writes consecutive framed packets into one buffer, assigning sequence ids.
///
/// Each payload is built in place after a reserved 4-byte header, so a whole response
/// (for example a resultset) can be assembled before anything reaches the socket.
pub struct PacketWriter<'a> {
    out: &'a mut Vec<u8>,
    sequence_id: SequenceId,
}

/// A position in a `PacketWriter` that can be rolled back to
#[derive(Debug, Clone, Copy)]
pub struct WriterMark {
    len: usize,
    sequence_id: SequenceId,
}

impl<'a> PacketWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>, sequence_id: SequenceId) -> Self {
        Self { out, sequence_id }
    }

    /// Build one packet with `f` writing its payload
    pub fn write<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let start = self.out.len();
        self.out.extend_from_slice(&[0u8; 4]);
        let built = f(self.out);
        let payload_len = self.out.len() - start - 4;
        let header = built.and_then(|()| PacketHeader::encode(payload_len, self.sequence_id.get()));
        match header {
            Ok(header) => {
                self.out[start..start + 4].copy_from_slice(header.as_bytes());
                self.sequence_id.advance();
                Ok(())
            }
            Err(err) => {
                self.out.truncate(start);
                Err(err)
            }
        }
    }

    /// Append an already-built payload
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.write(|out| {
            out.extend_from_slice(payload);
            Ok(())
        })
    }

    pub fn mark(&self) -> WriterMark {
        WriterMark {
            len: self.out.len(),
            sequence_id: self.sequence_id,
        }
    }

    /// Discard every packet written after `mark`
    pub fn rollback(&mut self, mark: WriterMark) {
        self.out.truncate(mark.len);
        self.sequence_id = mark.sequence_id;
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }
}

/// Blocking packet reader with look-ahead.
///
/// Bytes returned by `peek` stay buffered and are delivered again by the next real read,
/// so a caller can classify the next packet without consuming it.
pub struct PacketReader<R> {
    inner: R,
    peeked: VecDeque<u8>,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            peeked: VecDeque::new(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Look at the next `n` bytes without consuming them
    pub fn peek(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.peeked.len() < n {
            let mut chunk = vec![0u8; n - self.peeked.len()];
            let read = self.inner.read(&mut chunk)?;
            if read == 0 {
                return Err(Error::UnexpectedEof);
            }
            self.peeked.extend(&chunk[..read]);
        }
        Ok(self.peeked.iter().take(n).copied().collect())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let from_peek = buf.len().min(self.peeked.len());
        for (dst, src) in buf.iter_mut().zip(self.peeked.drain(..from_peek)) {
            *dst = src;
        }
        self.inner.read_exact(&mut buf[from_peek..]).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::UnexpectedEof
            } else {
                Error::IoError(err)
            }
        })
    }

    /// Consume exactly one 4-byte header
    pub fn read_header(&mut self) -> Result<PacketHeader> {
        let mut header = PacketHeader::new_zeroed();
        self.read_exact(header.as_mut_bytes())?;
        Ok(header)
    }

    /// Consume exactly `header.length()` payload bytes into `buffer`
    pub fn read_payload(&mut self, header: &PacketHeader, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.clear();
        buffer.resize(header.length(), 0);
        self.read_exact(buffer)
    }

    /// Read one packet payload into `buffer` and return its sequence id
    pub fn read_packet_into(&mut self, buffer: &mut Vec<u8>) -> Result<u8> {
        let header = self.read_header()?;
        self.read_payload(&header, buffer)?;
        Ok(header.sequence_id)
    }

    pub fn read_packet(&mut self) -> Result<Packet> {
        let mut payload = Vec::new();
        let sequence_id = self.read_packet_into(&mut payload)?;
        Ok(Packet::new(sequence_id, payload))
    }

    /// Classify the next server packet (OK / ERR / EOF / other) without consuming it
    pub fn peek_packet_type(&mut self) -> Result<PacketType> {
        let head = self.peek(4)?;
        let header = PacketHeader::from_bytes(&head)?;
        let length = header.length();
        if length == 0 {
            return Err(Error::InvalidPacket);
        }
        let bytes = self.peek(4 + length.min(9))?;
        detect_packet_type(&bytes[4..], length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_size() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), 4);
    }

    #[test]
    fn test_packet_round_trip() {
        let bytes = [0x05, 0x00, 0x00, 0x03, b'h', b'e', b'l', b'l', b'o', 0xAA];
        let (packet, rest) = Packet::parse(&bytes).unwrap();
        assert_eq!(packet.sequence_id, 3);
        assert_eq!(packet.payload_length(), 5);
        assert_eq!(packet.payload, b"hello");
        assert_eq!(rest, &[0xAA]);
        assert_eq!(packet.to_bytes().unwrap(), &bytes[..9]);
    }

    #[test]
    fn test_packet_too_large() {
        assert!(matches!(
            PacketHeader::encode(MAX_PAYLOAD_LENGTH + 1, 0),
            Err(Error::PacketTooLarge(_))
        ));
        assert!(matches!(
            PacketHeader::encode(MAX_PAYLOAD_LENGTH, 0),
            Err(Error::PacketTooLarge(_))
        ));
        let header = PacketHeader::encode(MAX_PAYLOAD_LENGTH - 1, 7).unwrap();
        assert_eq!(header.length(), MAX_PAYLOAD_LENGTH - 1);
        assert_eq!(header.as_bytes(), &[0xFE, 0xFF, 0xFF, 7]);
    }

    #[test]
    fn test_packet_writer_never_frames_a_continuation_header() {
        let mut out = Vec::new();
        let mut writer = PacketWriter::new(&mut out, SequenceId(1));
        writer.write_payload(&[0x01]).unwrap();
        let err = writer
            .write_payload(&vec![0u8; MAX_PAYLOAD_LENGTH])
            .unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge(len) if len == MAX_PAYLOAD_LENGTH));
        assert_eq!(writer.sequence_id(), SequenceId(2));
        assert_eq!(out, [0x01, 0x00, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_sequence_id_wraps_modulo_256() {
        assert_eq!(SequenceId(254).next(), SequenceId(255));
        assert_eq!(SequenceId(255).next(), SequenceId(0));

        let mut seq = SequenceId(255);
        assert_eq!(seq.advance(), 255);
        assert_eq!(seq.get(), 0);
    }

    #[test]
    fn test_packet_writer_assigns_sequence_ids() {
        let mut out = Vec::new();
        let mut writer = PacketWriter::new(&mut out, SequenceId(1));
        writer.write_payload(&[0x01]).unwrap();
        writer.write_payload(&[]).unwrap();
        assert_eq!(writer.sequence_id(), SequenceId(3));
        assert_eq!(out, [1, 0, 0, 1, 0x01, 0, 0, 0, 2]);
    }

    #[test]
    fn test_packet_writer_rollback() {
        let mut out = Vec::new();
        let mut writer = PacketWriter::new(&mut out, SequenceId(1));
        writer.write_payload(b"keep").unwrap();
        let mark = writer.mark();
        writer.write_payload(b"drop").unwrap();
        let failed = writer.write(|out| {
            out.extend_from_slice(b"partial");
            Err(Error::InvalidPacket)
        });
        assert!(failed.is_err());
        writer.rollback(mark);
        assert_eq!(writer.sequence_id(), SequenceId(2));
        assert_eq!(out, [4, 0, 0, 1, b'k', b'e', b'e', b'p']);
    }

    #[test]
    fn test_reader_peek_redelivers_bytes() {
        let mut stream = Vec::new();
        write_packet(&mut stream, 1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).unwrap();
        write_packet(&mut stream, 2, &[0xFF, 0x48, 0x04]).unwrap();

        let mut reader = PacketReader::new(stream.as_slice());
        assert_eq!(reader.peek(4).unwrap(), [7, 0, 0, 1]);
        assert_eq!(reader.peek_packet_type().unwrap(), PacketType::Ok);

        let first = reader.read_packet().unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(first.payload.len(), 7);

        assert_eq!(reader.peek_packet_type().unwrap(), PacketType::Err);
        let second = reader.read_packet().unwrap();
        assert_eq!(second.payload, [0xFF, 0x48, 0x04]);

        assert!(matches!(reader.read_packet(), Err(Error::UnexpectedEof)));
    }
}

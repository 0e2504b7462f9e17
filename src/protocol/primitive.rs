use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

/// First byte of a length-encoded string that stands for SQL NULL
pub const LENENC_NULL: u8 = 0xFB;

/// Read 1-byte integer
pub fn read_int_1(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&value, rest)) => Ok((value, rest)),
        None => Err(Error::UnexpectedEof),
    }
}

/// Read 2-byte little-endian integer
pub fn read_int_2(data: &[u8]) -> Result<(u16, &[u8])> {
    let (value, rest) = U16LE::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    Ok((value.get(), rest))
}

/// Read 3-byte little-endian integer
pub fn read_int_3(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 3 {
        return Err(Error::UnexpectedEof);
    }
    let value = u32::from_le_bytes([data[0], data[1], data[2], 0]);
    Ok((value, &data[3..]))
}

/// Read 4-byte little-endian integer
pub fn read_int_4(data: &[u8]) -> Result<(u32, &[u8])> {
    let (value, rest) = U32LE::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    Ok((value.get(), rest))
}

/// Read 8-byte little-endian integer
pub fn read_int_8(data: &[u8]) -> Result<(u64, &[u8])> {
    let (value, rest) = U64LE::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    Ok((value.get(), rest))
}

/// Read IEEE-754 single precision float
pub fn read_float_4(data: &[u8]) -> Result<(f32, &[u8])> {
    let (bits, rest) = read_int_4(data)?;
    Ok((f32::from_bits(bits), rest))
}

/// Read IEEE-754 double precision float
pub fn read_float_8(data: &[u8]) -> Result<(f64, &[u8])> {
    let (bits, rest) = read_int_8(data)?;
    Ok((f64::from_bits(bits), rest))
}

/// Read length-encoded integer
///
/// A leading 0xFB is returned as the value 251; callers reading a length-encoded string
/// decide whether it means NULL.
pub fn read_int_lenenc(data: &[u8]) -> Result<(u64, &[u8])> {
    let (first, rest) = read_int_1(data)?;
    match first {
        0xFC => {
            let (val, rest) = read_int_2(rest)?;
            Ok((val as u64, rest))
        }
        0xFD => {
            let (val, rest) = read_int_3(rest)?;
            Ok((val as u64, rest))
        }
        0xFE => read_int_8(rest),
        val => Ok((val as u64, rest)),
    }
}

/// Read fixed-length string
pub fn read_string_fix(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::UnexpectedEof);
    }
    Ok(data.split_at(len))
}

/// Read null-terminated string
pub fn read_string_null(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match data.iter().position(|&byte| byte == 0) {
        Some(i) => Ok((&data[..i], &data[i + 1..])),
        None => Err(Error::UnexpectedEof),
    }
}

/// Read length-encoded string
pub fn read_string_lenenc(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_int_lenenc(data)?;
    let len = usize::try_from(len).map_err(|_| Error::InvalidPacket)?;
    read_string_fix(rest, len)
}

/// Read length-encoded string where a leading 0xFB is SQL NULL (text resultset rows)
pub fn read_string_lenenc_nullable(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    match data.first() {
        Some(&LENENC_NULL) => Ok((None, &data[1..])),
        Some(_) => {
            let (value, rest) = read_string_lenenc(data)?;
            Ok((Some(value), rest))
        }
        None => Err(Error::UnexpectedEof),
    }
}

/// Read remaining data as string
pub fn read_string_eof(data: &[u8]) -> &[u8] {
    data
}

/// Validate UTF-8 text received from the client
pub fn to_str(data: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(data).map_err(|_| Error::InvalidPacket)
}

/// Write 1-byte integer
pub fn write_int_1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian integer
pub fn write_int_2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 3-byte little-endian integer
pub fn write_int_3(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write 4-byte little-endian integer
pub fn write_int_4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 8-byte little-endian integer
pub fn write_int_8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write IEEE-754 single precision float
pub fn write_float_4(out: &mut Vec<u8>, value: f32) {
    write_int_4(out, value.to_bits());
}

/// Write IEEE-754 double precision float
pub fn write_float_8(out: &mut Vec<u8>, value: f64) {
    write_int_8(out, value.to_bits());
}

/// Write length-encoded integer
pub fn write_int_lenenc(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < (1 << 16) {
        out.push(0xfc);
        write_int_2(out, value as u16);
    } else if value < (1 << 24) {
        out.push(0xfd);
        write_int_3(out, value as u32);
    } else {
        out.push(0xfe);
        write_int_8(out, value);
    }
}

/// Write fixed-length bytes
pub fn write_bytes_fix(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
}

/// Write null-terminated string
pub fn write_string_null(out: &mut Vec<u8>, s: &str) {
    write_bytes_null(out, s.as_bytes());
}

/// Write null-terminated bytes
pub fn write_bytes_null(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.push(0);
}

/// Write length-encoded string
pub fn write_string_lenenc(out: &mut Vec<u8>, s: &str) {
    write_bytes_lenenc(out, s.as_bytes());
}

/// Write length-encoded bytes
pub fn write_bytes_lenenc(out: &mut Vec<u8>, data: &[u8]) {
    write_int_lenenc(out, data.len() as u64);
    out.extend_from_slice(data);
}

/// Write length-encoded bytes, or the NULL marker 0xFB for `None`
pub fn write_bytes_lenenc_nullable(out: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(data) => write_bytes_lenenc(out, data),
        None => out.push(LENENC_NULL),
    }
}

use crate::constant::{BINARY_COLLATION, ColumnFlags, ColumnType, UTF8MB4_GENERAL_CI};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Length of the fixed-size tail, sent as a lenenc int before it
pub const COLUMN_DEFINITION_FIXED_LEN: u64 = 0x0c;

/// Fixed-size tail of Column Definition packet (12 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct ColumnDefinitionTail {
    charset: U16LE,
    column_length: U32LE,
    column_type: u8,
    flags: U16LE,
    decimals: u8,
    reserved: U16LE,
}

impl ColumnDefinitionTail {
    pub fn charset(&self) -> u16 {
        self.charset.get()
    }

    pub fn column_length(&self) -> u32 {
        self.column_length.get()
    }

    pub fn column_type(&self) -> Result<ColumnType> {
        ColumnType::from_u8(self.column_type)
            .ok_or(Error::UnsupportedFieldType(self.column_type))
    }

    pub fn flags(&self) -> ColumnFlags {
        ColumnFlags::from_bits_retain(self.flags.get())
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }
}

/// ColumnDefinition41, shared by text and binary resultsets and by prepare responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Column with defaults derived from its type
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        let (charset, flags) = if column_type.is_string_family()
            && !matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DECIMAL
                    | ColumnType::MYSQL_TYPE_NEWDECIMAL
                    | ColumnType::MYSQL_TYPE_BIT
            ) {
            (UTF8MB4_GENERAL_CI as u16, ColumnFlags::empty())
        } else {
            (BINARY_COLLATION, ColumnFlags::BINARY_FLAG | ColumnFlags::NUM_FLAG)
        };
        let decimals = match column_type {
            ColumnType::MYSQL_TYPE_FLOAT
            | ColumnType::MYSQL_TYPE_DOUBLE
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_DECIMAL => 0x1f,
            _ => 0,
        };
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset,
            column_length: column_type.default_column_length(),
            column_type,
            flags,
            decimals,
        }
    }

    /// Placeholder definition sent for each `?` of a prepared statement
    pub fn param() -> Self {
        Self {
            charset: BINARY_COLLATION,
            flags: ColumnFlags::BINARY_FLAG,
            column_length: 0,
            org_name: String::new(),
            ..Self::new("?", ColumnType::MYSQL_TYPE_VAR_STRING)
        }
    }

    pub fn with_table(mut self, schema: &str, table: &str) -> Self {
        self.schema = schema.to_string();
        self.table = table.to_string();
        self.org_table = table.to_string();
        self
    }

    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn read(payload: &[u8]) -> Result<Self> {
        let (catalog, data) = read_string_lenenc(payload)?;
        if catalog != b"def" {
            return Err(Error::InvalidPacket);
        }
        let (schema, data) = read_string_lenenc(data)?;
        let (table, data) = read_string_lenenc(data)?;
        let (org_table, data) = read_string_lenenc(data)?;
        let (name, data) = read_string_lenenc(data)?;
        let (org_name, data) = read_string_lenenc(data)?;

        let (length, data) = read_int_lenenc(data)?;
        if length != COLUMN_DEFINITION_FIXED_LEN {
            return Err(Error::InvalidPacket);
        }
        let (tail, _rest) =
            ColumnDefinitionTail::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;

        Ok(Self {
            schema: to_str(schema)?.to_string(),
            table: to_str(table)?.to_string(),
            org_table: to_str(org_table)?.to_string(),
            name: to_str(name)?.to_string(),
            org_name: to_str(org_name)?.to_string(),
            charset: tail.charset(),
            column_length: tail.column_length(),
            column_type: tail.column_type()?,
            flags: tail.flags(),
            decimals: tail.decimals(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_string_lenenc(out, "def");
        write_string_lenenc(out, &self.schema);
        write_string_lenenc(out, &self.table);
        write_string_lenenc(out, &self.org_table);
        write_string_lenenc(out, &self.name);
        write_string_lenenc(out, &self.org_name);
        write_int_lenenc(out, COLUMN_DEFINITION_FIXED_LEN);
        let tail = ColumnDefinitionTail {
            charset: U16LE::new(self.charset),
            column_length: U32LE::new(self.column_length),
            column_type: self.column_type as u8,
            flags: U16LE::new(self.flags.bits()),
            decimals: self.decimals,
            reserved: U16LE::new(0),
        };
        out.extend_from_slice(tail.as_bytes());
    }
}

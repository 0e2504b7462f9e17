use std::collections::HashMap;

use crate::constant::{
    CapabilityFlags, ColumnType, CommandByte, PARAMETER_COUNT_AVAILABLE, ResultsetMetadata,
    ServerStatusFlags,
};
use crate::error::{ER_WRONG_ARGUMENTS, Error, Result, SQLSTATE_GENERAL};
use crate::protocol::command::query::QueryAttribute;
use crate::protocol::command::resultset::{read_definition_block, write_definition_block};
use crate::protocol::command::{ColumnDefinition, expect_command};
use crate::protocol::packet::PacketWriter;
use crate::protocol::primitive::*;
use crate::protocol::value::{NullBitmap, Parameter};
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Flag set in the second type byte for unsigned parameters
const UNSIGNED_PARAM_FLAG: u8 = 0x80;

/// Type of a bound parameter as sent in COM_STMT_EXECUTE (2 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamType {
    pub column_type: ColumnType,
    pub unsigned: bool,
}

impl ParamType {
    pub fn of(param: &Parameter) -> Self {
        Self {
            column_type: param.column_type,
            unsigned: param.unsigned,
        }
    }

    pub fn read(data: &[u8]) -> Result<(Self, &[u8])> {
        let (type_byte, rest) = read_int_1(data)?;
        let (flag, rest) = read_int_1(rest)?;
        let column_type =
            ColumnType::from_u8(type_byte).ok_or(Error::UnsupportedFieldType(type_byte))?;
        Ok((
            Self {
                column_type,
                unsigned: flag & UNSIGNED_PARAM_FLAG != 0,
            },
            rest,
        ))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, self.column_type as u8);
        write_int_1(out, if self.unsigned { UNSIGNED_PARAM_FLAG } else { 0 });
    }
}

/// Statement id that starts the body of COM_STMT_EXECUTE / CLOSE / RESET / SEND_LONG_DATA
pub fn read_statement_id(payload: &[u8]) -> Result<u32> {
    let (_command, body) = read_int_1(payload)?;
    let (statement_id, _) = read_int_4(body)?;
    Ok(statement_id)
}

/// COM_STMT_PREPARE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComStmtPrepare {
    pub sql: String,
}

impl ComStmtPrepare {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::StmtPrepare)?;
        Ok(Self {
            sql: to_str(read_string_eof(body))?.to_string(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::StmtPrepare as u8);
        out.extend_from_slice(self.sql.as_bytes());
    }
}

/// Prepared statement OK response (zero-copy), after the 0x00 status byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

/// Full COM_STMT_PREPARE response: the PrepareOk packet plus parameter and column definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtPrepareResponse {
    pub statement_id: u32,
    pub warning_count: u16,
    /// Only sent with `CLIENT_OPTIONAL_RESULTSET_METADATA`
    pub metadata: ResultsetMetadata,
    pub params: Vec<ColumnDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

impl StmtPrepareResponse {
    /// Write every packet of the response
    pub fn write(
        &self,
        writer: &mut PacketWriter<'_>,
        capabilities: CapabilityFlags,
        status_flags: ServerStatusFlags,
    ) -> Result<()> {
        let num_columns = u16::try_from(self.columns.len()).map_err(|_| Error::InvalidPacket)?;
        let num_params = u16::try_from(self.params.len()).map_err(|_| Error::InvalidPacket)?;
        let optional_metadata =
            capabilities.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA);

        writer.write(|out| {
            write_int_1(out, 0x00);
            let ok = PrepareOk {
                statement_id: U32LE::new(self.statement_id),
                num_columns: U16LE::new(num_columns),
                num_params: U16LE::new(num_params),
                reserved: 0,
                warning_count: U16LE::new(self.warning_count),
            };
            out.extend_from_slice(ok.as_bytes());
            if optional_metadata {
                write_int_1(out, self.metadata as u8);
            }
            Ok(())
        })?;

        // with metadata suppressed the definition blocks are omitted together with their EOFs
        if optional_metadata && self.metadata == ResultsetMetadata::None {
            return Ok(());
        }
        for defs in [&self.params, &self.columns] {
            if !defs.is_empty() {
                write_definition_block(writer, defs, self.metadata, capabilities, status_flags)?;
            }
        }
        Ok(())
    }

    /// Read the response from consecutive packet payloads
    pub fn read<'a, I>(packets: &mut I, capabilities: CapabilityFlags) -> Result<Self>
    where
        I: Iterator<Item = &'a [u8]>,
    {
        let first = packets.next().ok_or(Error::UnexpectedEof)?;
        let (status, data) = read_int_1(first)?;
        if status != 0x00 {
            return Err(Error::InvalidPacket);
        }
        let (ok, rest) = PrepareOk::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;

        let mut metadata = ResultsetMetadata::Full;
        if capabilities.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
            let (byte, _) = read_int_1(rest)?;
            metadata = ResultsetMetadata::from_u8(byte).ok_or(Error::InvalidPacket)?;
        }

        let mut block = |count: u16| {
            if count == 0 || metadata == ResultsetMetadata::None {
                Ok(Vec::new())
            } else {
                read_definition_block(packets, count as usize, metadata, capabilities)
            }
        };
        let params = block(ok.num_params())?;
        let columns = block(ok.num_columns())?;

        Ok(Self {
            statement_id: ok.statement_id(),
            warning_count: ok.warning_count(),
            metadata,
            params,
            columns,
        })
    }
}

/// What the server knows about a statement before decoding its COM_STMT_EXECUTE
#[derive(Debug, Clone, Copy)]
pub struct ExecuteContext<'a> {
    pub capabilities: CapabilityFlags,
    /// Placeholder count of the prepared statement
    pub num_params: usize,
    /// Types bound by an earlier execute, reused when `new_params_bound_flag` is 0
    pub bound_types: &'a [ParamType],
    /// Parameters whose data arrived through COM_STMT_SEND_LONG_DATA
    pub long_data: &'a HashMap<u16, Vec<u8>>,
}

/// COM_STMT_EXECUTE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComStmtExecute {
    pub statement_id: u32,
    pub flags: u8,
    pub iteration_count: u32,
    pub new_params_bound: bool,
    pub params: Vec<Parameter>,
    pub attributes: Vec<QueryAttribute>,
}

impl ComStmtExecute {
    /// Types of the positional parameters, to be remembered for later executes
    pub fn param_types(&self) -> Vec<ParamType> {
        self.params.iter().map(ParamType::of).collect()
    }

    pub fn read(payload: &[u8], ctx: &ExecuteContext<'_>) -> Result<Self> {
        let body = expect_command(payload, CommandByte::StmtExecute)?;
        let (statement_id, rest) = read_int_4(body)?;
        let (flags, rest) = read_int_1(rest)?;
        let (iteration_count, mut rest) = read_int_4(rest)?;

        let wrong_arguments = || {
            Error::sql(
                ER_WRONG_ARGUMENTS,
                SQLSTATE_GENERAL,
                "Incorrect arguments to mysqld_stmt_execute",
            )
        };

        let query_attributes = ctx
            .capabilities
            .contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES);
        let mut parameter_count = ctx.num_params;
        if query_attributes && flags & PARAMETER_COUNT_AVAILABLE != 0 {
            let (count, r) = read_int_lenenc(rest)?;
            parameter_count = usize::try_from(count).map_err(|_| Error::InvalidPacket)?;
            rest = r;
        }
        if parameter_count < ctx.num_params {
            return Err(wrong_arguments());
        }

        let mut execute = Self {
            statement_id,
            flags,
            iteration_count,
            new_params_bound: false,
            params: Vec::with_capacity(ctx.num_params),
            attributes: Vec::new(),
        };
        if parameter_count == 0 {
            return Ok(execute);
        }

        let (bitmap, r) = NullBitmap::read(rest, parameter_count, NullBitmap::PARAMETER_OFFSET)?;
        let (new_params_bound, r) = read_int_1(r)?;
        rest = r;
        execute.new_params_bound = new_params_bound == 1;

        let mut types = Vec::with_capacity(parameter_count);
        let mut names = Vec::with_capacity(parameter_count);
        if execute.new_params_bound {
            for _ in 0..parameter_count {
                let (param_type, r) = ParamType::read(rest)?;
                rest = r;
                if query_attributes {
                    let (name, r) = read_string_lenenc(rest)?;
                    names.push(String::from_utf8_lossy(name).into_owned());
                    rest = r;
                }
                types.push(param_type);
            }
        } else {
            if parameter_count != ctx.num_params || ctx.bound_types.len() != ctx.num_params {
                return Err(wrong_arguments());
            }
            types.extend_from_slice(ctx.bound_types);
        }

        for (idx, param_type) in types.iter().enumerate() {
            let long_data = u16::try_from(idx)
                .ok()
                .filter(|_| idx < ctx.num_params)
                .and_then(|id| ctx.long_data.get(&id));
            let param = if bitmap.is_null(idx) {
                Parameter::null(param_type.column_type)
            } else if let Some(data) = long_data {
                Parameter::long_data(param_type.column_type, data)
            } else {
                let (param, r) = Parameter::read(param_type.column_type, param_type.unsigned, rest)?;
                rest = r;
                param
            };
            if idx < ctx.num_params {
                execute.params.push(param);
            } else {
                execute.attributes.push(QueryAttribute {
                    name: names.get(idx).cloned().unwrap_or_default(),
                    param,
                });
            }
        }
        Ok(execute)
    }

    /// Client-side encoding; long-data parameters are not represented
    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_1(out, CommandByte::StmtExecute as u8);
        write_int_4(out, self.statement_id);
        write_int_1(out, self.flags);
        write_int_4(out, self.iteration_count);

        let query_attributes = capabilities.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES);
        let parameter_count = self.params.len() + self.attributes.len();
        if query_attributes && self.flags & PARAMETER_COUNT_AVAILABLE != 0 {
            write_int_lenenc(out, parameter_count as u64);
        }
        if parameter_count == 0 {
            return;
        }

        let all = || {
            self.params
                .iter()
                .map(|p| ("", p))
                .chain(self.attributes.iter().map(|a| (a.name.as_str(), &a.param)))
        };

        let mut bitmap = NullBitmap::for_parameters(parameter_count);
        for (idx, (_, param)) in all().enumerate() {
            bitmap.set_null(idx, param.raw.is_none());
        }
        out.extend_from_slice(bitmap.bytes());

        write_int_1(out, self.new_params_bound as u8);
        if self.new_params_bound {
            for (name, param) in all() {
                ParamType::of(param).write(out);
                if query_attributes {
                    write_string_lenenc(out, name);
                }
            }
        }
        for (_, param) in all() {
            if let Some(raw) = &param.raw {
                out.extend_from_slice(raw);
            }
        }
    }
}

/// COM_STMT_CLOSE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComStmtClose {
    pub statement_id: u32,
}

impl ComStmtClose {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::StmtClose)?;
        let (statement_id, _) = read_int_4(body)?;
        Ok(Self { statement_id })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::StmtClose as u8);
        write_int_4(out, self.statement_id);
    }
}

/// COM_STMT_RESET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComStmtReset {
    pub statement_id: u32,
}

impl ComStmtReset {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::StmtReset)?;
        let (statement_id, _) = read_int_4(body)?;
        Ok(Self { statement_id })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::StmtReset as u8);
        write_int_4(out, self.statement_id);
    }
}

/// COM_STMT_SEND_LONG_DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComStmtSendLongData {
    pub statement_id: u32,
    pub param_id: u16,
    pub data: Vec<u8>,
}

impl ComStmtSendLongData {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::StmtSendLongData)?;
        let (statement_id, rest) = read_int_4(body)?;
        let (param_id, rest) = read_int_2(rest)?;
        Ok(Self {
            statement_id,
            param_id,
            data: read_string_eof(rest).to_vec(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::StmtSendLongData as u8);
        write_int_4(out, self.statement_id);
        write_int_2(out, self.param_id);
        out.extend_from_slice(&self.data);
    }
}

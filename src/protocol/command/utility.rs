use crate::constant::{CommandByte, MYSQL_OPTION_MULTI_STATEMENTS_OFF, MYSQL_OPTION_MULTI_STATEMENTS_ON};
use crate::error::{Error, Result};
use crate::protocol::command::expect_command;
use crate::protocol::primitive::*;

/// Write a command that carries no body (COM_PING, COM_QUIT, COM_STATISTICS, ...)
pub fn write_simple(out: &mut Vec<u8>, command: CommandByte) {
    write_int_1(out, command as u8);
}

/// COM_INIT_DB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComInitDb {
    pub schema: String,
}

impl ComInitDb {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::InitDb)?;
        Ok(Self {
            schema: to_str(read_string_eof(body))?.to_string(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::InitDb as u8);
        out.extend_from_slice(self.schema.as_bytes());
    }
}

/// COM_FIELD_LIST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComFieldList {
    pub table: String,
    pub wildcard: String,
}

impl ComFieldList {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::FieldList)?;
        let (table, rest) = read_string_null(body)?;
        Ok(Self {
            table: to_str(table)?.to_string(),
            wildcard: to_str(read_string_eof(rest))?.to_string(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::FieldList as u8);
        write_string_null(out, &self.table);
        out.extend_from_slice(self.wildcard.as_bytes());
    }
}

/// COM_SET_OPTION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComSetOption {
    MultiStatementsOn,
    MultiStatementsOff,
}

impl ComSetOption {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::SetOption)?;
        let (option, _) = read_int_2(body)?;
        match option {
            MYSQL_OPTION_MULTI_STATEMENTS_ON => Ok(Self::MultiStatementsOn),
            MYSQL_OPTION_MULTI_STATEMENTS_OFF => Ok(Self::MultiStatementsOff),
            other => Err(Error::sql(
                crate::error::ER_UNKNOWN_COM_ERROR,
                crate::error::SQLSTATE_COMMUNICATION,
                format!("Unknown set option {other}"),
            )),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::SetOption as u8);
        write_int_2(
            out,
            match self {
                Self::MultiStatementsOn => MYSQL_OPTION_MULTI_STATEMENTS_ON,
                Self::MultiStatementsOff => MYSQL_OPTION_MULTI_STATEMENTS_OFF,
            },
        );
    }
}

/// COM_PROCESS_KILL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComProcessKill {
    pub connection_id: u32,
}

impl ComProcessKill {
    pub fn read(payload: &[u8]) -> Result<Self> {
        let body = expect_command(payload, CommandByte::ProcessKill)?;
        let (connection_id, _) = read_int_4(body)?;
        Ok(Self { connection_id })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, CommandByte::ProcessKill as u8);
        write_int_4(out, self.connection_id);
    }
}

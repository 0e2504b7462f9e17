mod column_definition;
pub mod prepared;
pub mod query;
pub mod resultset;
pub mod utility;

#[cfg(test)]
mod command_test;

pub use column_definition::COLUMN_DEFINITION_FIXED_LEN;
pub use column_definition::ColumnDefinition;
pub use column_definition::ColumnDefinitionTail;

use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::read_int_1;

/// A command-phase packet split into its command byte and body
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub byte: CommandByte,
    /// Payload after the command byte
    pub body: &'a [u8],
    /// The full payload, command byte included
    pub payload: &'a [u8],
}

/// Classify a command-phase payload by its first byte
pub fn read_command(payload: &[u8]) -> Result<Command<'_>> {
    let (byte, body) = read_int_1(payload)?;
    let byte = CommandByte::from_u8(byte).ok_or(Error::UnknownCommand(byte))?;
    Ok(Command {
        byte,
        body,
        payload,
    })
}

/// Strip and check the command byte of a payload
pub(crate) fn expect_command(payload: &[u8], expected: CommandByte) -> Result<&[u8]> {
    let (byte, body) = read_int_1(payload)?;
    if byte != expected as u8 {
        return Err(Error::InvalidPacket);
    }
    Ok(body)
}

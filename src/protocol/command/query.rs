use crate::constant::{CapabilityFlags, CommandByte};
use crate::error::{Error, Result};
use crate::protocol::command::expect_command;
use crate::protocol::command::prepared::ParamType;
use crate::protocol::primitive::*;
use crate::protocol::value::{NullBitmap, Parameter};

/// Named value attached to a COM_QUERY or COM_STMT_EXECUTE with `CLIENT_QUERY_ATTRIBUTES`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryAttribute {
    pub name: String,
    pub param: Parameter,
}

/// COM_QUERY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComQuery {
    pub attributes: Vec<QueryAttribute>,
    pub sql: String,
}

impl ComQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            attributes: Vec::new(),
            sql: sql.into(),
        }
    }

    pub fn read(payload: &[u8], capabilities: CapabilityFlags) -> Result<Self> {
        let mut data = expect_command(payload, CommandByte::Query)?;

        let mut attributes = Vec::new();
        if capabilities.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
            let (parameter_count, rest) = read_int_lenenc(data)?;
            let (_parameter_set_count, rest) = read_int_lenenc(rest)?;
            data = rest;
            if parameter_count > 0 {
                let count = usize::try_from(parameter_count).map_err(|_| Error::InvalidPacket)?;
                let (attrs, rest) = read_attribute_block(data, count)?;
                attributes = attrs;
                data = rest;
            }
        }

        Ok(Self {
            attributes,
            sql: to_str(read_string_eof(data))?.to_string(),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_1(out, CommandByte::Query as u8);
        if capabilities.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
            write_int_lenenc(out, self.attributes.len() as u64);
            write_int_lenenc(out, 1);
            if !self.attributes.is_empty() {
                write_attribute_block(out, &self.attributes);
            }
        }
        out.extend_from_slice(self.sql.as_bytes());
    }
}

/// Null bitmap, bind flag, typed names and values of `count` query attributes
fn read_attribute_block(data: &[u8], count: usize) -> Result<(Vec<QueryAttribute>, &[u8])> {
    let (bitmap, rest) = NullBitmap::read(data, count, NullBitmap::PARAMETER_OFFSET)?;
    let (new_params_bound, mut rest) = read_int_1(rest)?;
    if new_params_bound != 1 {
        return Err(Error::InvalidPacket);
    }

    let mut typed = Vec::with_capacity(count);
    for _ in 0..count {
        let (param_type, r) = ParamType::read(rest)?;
        let (name, r) = read_string_lenenc(r)?;
        typed.push((param_type, String::from_utf8_lossy(name).into_owned()));
        rest = r;
    }

    let mut attributes = Vec::with_capacity(count);
    for (idx, (param_type, name)) in typed.into_iter().enumerate() {
        let param = if bitmap.is_null(idx) {
            Parameter::null(param_type.column_type)
        } else {
            let (param, r) = Parameter::read(param_type.column_type, param_type.unsigned, rest)?;
            rest = r;
            param
        };
        attributes.push(QueryAttribute { name, param });
    }
    Ok((attributes, rest))
}

fn write_attribute_block(out: &mut Vec<u8>, attributes: &[QueryAttribute]) {
    let mut bitmap = NullBitmap::for_parameters(attributes.len());
    for (idx, attr) in attributes.iter().enumerate() {
        bitmap.set_null(idx, attr.param.raw.is_none());
    }
    out.extend_from_slice(bitmap.bytes());
    write_int_1(out, 1);
    for attr in attributes {
        ParamType::of(&attr.param).write(out);
        write_string_lenenc(out, &attr.name);
    }
    for attr in attributes {
        if let Some(raw) = &attr.param.raw {
            out.extend_from_slice(raw);
        }
    }
}

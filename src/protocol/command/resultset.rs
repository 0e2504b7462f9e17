use crate::constant::{CapabilityFlags, ColumnType, ResultsetMetadata, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::protocol::command::ColumnDefinition;
use crate::protocol::packet::PacketWriter;
use crate::protocol::primitive::*;
use crate::protocol::response::{
    EofPayload, ErrPayload, OkPayload, PacketType, detect_packet_type, write_terminator,
};
use crate::protocol::value::{NullBitmap, Value};

/// Header byte of a binary protocol row
pub const BINARY_ROW_HEADER: u8 = 0x00;

/// First packet of a resultset: column count and, with `CLIENT_OPTIONAL_RESULTSET_METADATA`,
/// whether column definitions follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSetHeader {
    pub column_count: u64,
    pub metadata: ResultsetMetadata,
}

impl ResultSetHeader {
    pub fn new(column_count: usize) -> Self {
        Self {
            column_count: column_count as u64,
            metadata: ResultsetMetadata::Full,
        }
    }

    pub fn read(payload: &[u8], capabilities: CapabilityFlags) -> Result<Self> {
        let (column_count, rest) = read_int_lenenc(payload)?;
        let mut metadata = ResultsetMetadata::Full;
        if capabilities.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
            let (byte, _) = read_int_1(rest)?;
            metadata = ResultsetMetadata::from_u8(byte).ok_or(Error::InvalidPacket)?;
        }
        Ok(Self {
            column_count,
            metadata,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, capabilities: CapabilityFlags) {
        write_int_lenenc(out, self.column_count);
        if capabilities.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
            write_int_1(out, self.metadata as u8);
        }
    }
}

/// Write column definitions (unless suppressed) followed by an EOF unless `CLIENT_DEPRECATE_EOF`
pub fn write_definition_block(
    writer: &mut PacketWriter<'_>,
    definitions: &[ColumnDefinition],
    metadata: ResultsetMetadata,
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
) -> Result<()> {
    if metadata == ResultsetMetadata::Full {
        for def in definitions {
            writer.write(|out| {
                def.write(out);
                Ok(())
            })?;
        }
    }
    if !capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        writer.write(|out| {
            EofPayload::new(status_flags, 0).write(out, capabilities);
            Ok(())
        })?;
    }
    Ok(())
}

/// Counterpart of [`write_definition_block`]
pub fn read_definition_block<'a, I>(
    packets: &mut I,
    count: usize,
    metadata: ResultsetMetadata,
    capabilities: CapabilityFlags,
) -> Result<Vec<ColumnDefinition>>
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut definitions = Vec::with_capacity(count);
    if metadata == ResultsetMetadata::Full {
        for _ in 0..count {
            let payload = packets.next().ok_or(Error::UnexpectedEof)?;
            definitions.push(ColumnDefinition::read(payload)?);
        }
    }
    if !capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        let payload = packets.next().ok_or(Error::UnexpectedEof)?;
        EofPayload::read(payload, capabilities)?;
    }
    Ok(definitions)
}

/// One text protocol row; `None` is SQL NULL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRow(pub Vec<Option<Vec<u8>>>);

impl TextRow {
    pub fn from_strs(cells: &[Option<&str>]) -> Self {
        cells
            .iter()
            .map(|cell| cell.map(|s| s.as_bytes().to_vec()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.0.get(idx).and_then(|cell| cell.as_deref())
    }

    pub fn read(payload: &[u8], num_columns: usize) -> Result<Self> {
        let mut cells = Vec::with_capacity(num_columns);
        let mut data = payload;
        for _ in 0..num_columns {
            let (cell, rest) = read_string_lenenc_nullable(data)?;
            cells.push(cell.map(<[u8]>::to_vec));
            data = rest;
        }
        Ok(Self(cells))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for cell in &self.0 {
            write_bytes_lenenc_nullable(out, cell.as_deref());
        }
    }
}

impl FromIterator<Option<Vec<u8>>> for TextRow {
    fn from_iter<T: IntoIterator<Item = Option<Vec<u8>>>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Re-encode a text row as a binary protocol row, column by column against `columns`.
///
/// A missing cell is NULL. An empty cell is NULL too unless the column is a string type,
/// where it is the empty string.
pub fn text_row_to_binary(
    columns: &[ColumnDefinition],
    row: &TextRow,
    out: &mut Vec<u8>,
) -> Result<()> {
    write_int_1(out, BINARY_ROW_HEADER);

    let mut bitmap = NullBitmap::for_result_set(columns.len());
    let bitmap_pos = out.len();
    out.extend_from_slice(bitmap.bytes());

    for (idx, column) in columns.iter().enumerate() {
        let cell = match row.0.get(idx) {
            Some(Some(cell)) => cell,
            _ => {
                bitmap.set_null(idx, true);
                continue;
            }
        };
        if column.column_type == ColumnType::MYSQL_TYPE_NULL
            || (cell.is_empty() && !column.column_type.is_string_family())
        {
            bitmap.set_null(idx, true);
            continue;
        }
        let value = Value::from_text(column.column_type, column.is_unsigned(), cell)?;
        value.write_binary(out, column.column_type)?;
    }

    out[bitmap_pos..bitmap_pos + bitmap.bytes().len()].copy_from_slice(bitmap.bytes());
    Ok(())
}

/// Decode a binary protocol row against its column definitions
pub fn read_binary_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let (header, data) = read_int_1(payload)?;
    if header != BINARY_ROW_HEADER {
        return Err(Error::InvalidPacket);
    }
    let (bitmap, mut data) =
        NullBitmap::read(data, columns.len(), NullBitmap::RESULT_SET_OFFSET)?;

    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        if bitmap.is_null(idx) {
            values.push(Value::Null);
            continue;
        }
        let (value, rest) = Value::read_binary(column.column_type, column.is_unsigned(), data)?;
        values.push(value);
        data = rest;
    }
    Ok(values)
}

/// Row encoding of a resultset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY
    Text,
    /// COM_STMT_EXECUTE
    Binary,
}

/// Write a complete resultset: header, column definitions, rows and the terminator.
///
/// `status_flags` goes into the intermediate EOF and the terminator; the caller sets
/// `SERVER_MORE_RESULTS_EXISTS` when another result follows. Every row must have exactly
/// one cell per column; nothing is written otherwise.
pub fn write_resultset(
    writer: &mut PacketWriter<'_>,
    format: RowFormat,
    columns: &[ColumnDefinition],
    rows: &[TextRow],
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
) -> Result<()> {
    if let Some(row) = rows.iter().find(|row| row.len() != columns.len()) {
        return Err(Error::RowArity {
            expected: columns.len(),
            actual: row.len(),
        });
    }

    let header = ResultSetHeader::new(columns.len());
    writer.write(|out| {
        header.write(out, capabilities);
        Ok(())
    })?;
    write_definition_block(writer, columns, header.metadata, capabilities, status_flags)?;

    for row in rows {
        writer.write(|out| match format {
            RowFormat::Text => {
                row.write(out);
                Ok(())
            }
            RowFormat::Binary => text_row_to_binary(columns, row, out),
        })?;
    }

    writer.write(|out| {
        write_terminator(out, capabilities, status_flags, 0);
        Ok(())
    })
}

/// Decoded row of either format
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Text(TextRow),
    Binary(Vec<Value>),
}

/// Events produced by [`ResultSetDecoder::drive`]
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSetEvent {
    /// The packet was consumed; feed the next one
    NeedPayload,
    /// The command answered with OK instead of a resultset
    NoResultSet(OkPayload),
    ResultSetStart { num_columns: usize },
    Column(ColumnDefinition),
    Row(Row),
    /// Terminator of the resultset
    Eof {
        status_flags: ServerStatusFlags,
        warnings: u16,
    },
}

/// Client-side state machine that reads a command response packet by packet.
///
/// ERR packets surface as `Error::ServerError`. After `Eof` or `NoResultSet`, check
/// `SERVER_MORE_RESULTS_EXISTS` and call [`ResultSetDecoder::next_result`] to read the next one.
#[derive(Debug, Clone)]
pub struct ResultSetDecoder {
    format: RowFormat,
    capabilities: CapabilityFlags,
    state: DecoderState,
    columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Start,
    ReadingColumns { remaining: usize },
    ColumnsEof,
    ReadingRows,
    Finished,
}

impl ResultSetDecoder {
    pub fn new(format: RowFormat, capabilities: CapabilityFlags) -> Self {
        Self {
            format,
            capabilities,
            state: DecoderState::Start,
            columns: Vec::new(),
        }
    }

    /// Column definitions read so far
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn is_finished(&self) -> bool {
        self.state == DecoderState::Finished
    }

    /// Reset for the next result of a multi-result response
    pub fn next_result(&mut self) {
        self.state = DecoderState::Start;
        self.columns.clear();
    }

    pub fn drive(&mut self, payload: &[u8]) -> Result<ResultSetEvent> {
        match self.state {
            DecoderState::Start => match detect_packet_type(payload, payload.len())? {
                PacketType::Err => Err(ErrPayload::read(payload)?.into()),
                PacketType::Ok => {
                    self.state = DecoderState::Finished;
                    Ok(ResultSetEvent::NoResultSet(OkPayload::read(
                        payload,
                        self.capabilities,
                    )?))
                }
                PacketType::Eof | PacketType::Data => {
                    let header = ResultSetHeader::read(payload, self.capabilities)?;
                    let num_columns =
                        usize::try_from(header.column_count).map_err(|_| Error::InvalidPacket)?;
                    self.state = if header.metadata == ResultsetMetadata::Full && num_columns > 0
                    {
                        DecoderState::ReadingColumns {
                            remaining: num_columns,
                        }
                    } else {
                        self.after_columns()
                    };
                    Ok(ResultSetEvent::ResultSetStart { num_columns })
                }
            },

            DecoderState::ReadingColumns { remaining } => {
                let column = ColumnDefinition::read(payload)?;
                self.columns.push(column.clone());
                self.state = if remaining > 1 {
                    DecoderState::ReadingColumns {
                        remaining: remaining - 1,
                    }
                } else {
                    self.after_columns()
                };
                Ok(ResultSetEvent::Column(column))
            }

            DecoderState::ColumnsEof => {
                EofPayload::read(payload, self.capabilities)?;
                self.state = DecoderState::ReadingRows;
                Ok(ResultSetEvent::NeedPayload)
            }

            DecoderState::ReadingRows => match detect_packet_type(payload, payload.len())? {
                PacketType::Err => {
                    self.state = DecoderState::Finished;
                    Err(ErrPayload::read(payload)?.into())
                }
                PacketType::Eof => {
                    self.state = DecoderState::Finished;
                    let (status_flags, warnings) =
                        if self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                            let ok = OkPayload::read(payload, self.capabilities)?;
                            (ok.status_flags, ok.warnings)
                        } else {
                            let eof = EofPayload::read(payload, self.capabilities)?;
                            (eof.status_flags, eof.warnings)
                        };
                    Ok(ResultSetEvent::Eof {
                        status_flags,
                        warnings,
                    })
                }
                PacketType::Ok | PacketType::Data => {
                    let row = match self.format {
                        RowFormat::Text => Row::Text(TextRow::read(payload, self.columns.len())?),
                        RowFormat::Binary => Row::Binary(read_binary_row(payload, &self.columns)?),
                    };
                    Ok(ResultSetEvent::Row(row))
                }
            },

            DecoderState::Finished => Err(Error::InvalidPacket),
        }
    }

    fn after_columns(&self) -> DecoderState {
        if self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            DecoderState::ReadingRows
        } else {
            DecoderState::ColumnsEof
        }
    }
}

/// COM_FIELD_LIST response: one definition per column, then the terminator
pub fn write_field_list(
    writer: &mut PacketWriter<'_>,
    columns: &[ColumnDefinition],
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
) -> Result<()> {
    for column in columns {
        writer.write(|out| {
            column.write(out);
            Ok(())
        })?;
    }
    writer.write(|out| {
        write_terminator(out, capabilities, status_flags, 0);
        Ok(())
    })
}

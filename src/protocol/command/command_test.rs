use std::collections::HashMap;

use pretty_assertions::assert_eq;

use crate::constant::{CapabilityFlags, ColumnType, CommandByte, ResultsetMetadata, ServerStatusFlags};
use crate::error::Error;
use crate::protocol::command::prepared::{
    ComStmtClose, ComStmtExecute, ComStmtPrepare, ComStmtReset, ComStmtSendLongData,
    ExecuteContext, ParamType, StmtPrepareResponse, read_statement_id,
};
use crate::protocol::command::query::ComQuery;
use crate::protocol::command::resultset::{
    ResultSetDecoder, ResultSetEvent, ResultSetHeader, Row, RowFormat, TextRow,
    read_definition_block, text_row_to_binary, write_definition_block, write_resultset,
};
use crate::protocol::command::utility::{ComFieldList, ComInitDb, ComSetOption};
use crate::protocol::command::{ColumnDefinition, read_command};
use crate::protocol::packet::{Packet, PacketWriter, SequenceId};
use crate::protocol::value::{Date, DateTime, Value};

const AUTOCOMMIT: ServerStatusFlags = ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT;

fn caps41() -> CapabilityFlags {
    CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_TRANSACTIONS
}

fn split_packets(mut data: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    while !data.is_empty() {
        let (packet, rest) = Packet::parse(data).unwrap();
        packets.push(packet);
        data = rest;
    }
    packets
}

fn no_long_data() -> HashMap<u16, Vec<u8>> {
    HashMap::new()
}

#[test]
fn test_read_command_classifies_payload() {
    let bytes = hex::decode("0353454c4543542031").unwrap();
    let command = read_command(&bytes).unwrap();
    assert_eq!(command.byte, CommandByte::Query);
    assert_eq!(command.body, b"SELECT 1");

    assert!(matches!(read_command(&[0xEE]), Err(Error::UnknownCommand(0xEE))));
    assert!(matches!(read_command(&[]), Err(Error::UnexpectedEof)));
}

#[test]
fn test_com_query_round_trip() {
    let payload = hex::decode("0353454c4543542031").unwrap();
    let query = ComQuery::read(&payload, caps41()).unwrap();
    assert_eq!(query.sql, "SELECT 1");
    assert!(query.attributes.is_empty());

    let mut out = Vec::new();
    query.write(&mut out, caps41());
    assert_eq!(out, payload);
}

#[test]
fn test_com_query_with_attributes() {
    let caps = caps41() | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;

    // no attributes: parameter_count=0, parameter_set_count=1
    let payload = hex::decode("03000153454c4543542031").unwrap();
    let query = ComQuery::read(&payload, caps).unwrap();
    assert_eq!(query.sql, "SELECT 1");
    let mut out = Vec::new();
    query.write(&mut out, caps);
    assert_eq!(out, payload);

    // one VAR_STRING attribute a='x'
    let mut payload = hex::decode("0301010001fd0001610178").unwrap();
    payload.extend_from_slice(b"SELECT 1");
    let query = ComQuery::read(&payload, caps).unwrap();
    assert_eq!(query.attributes.len(), 1);
    assert_eq!(query.attributes[0].name, "a");
    assert_eq!(
        query.attributes[0].param.value().unwrap(),
        Value::Bytes(b"x".to_vec())
    );
    assert_eq!(query.sql, "SELECT 1");

    let mut out = Vec::new();
    query.write(&mut out, caps);
    assert_eq!(out, payload);
}

#[test]
fn test_com_stmt_prepare_and_close_round_trip() {
    let payload = hex::decode("1653454c454354203f").unwrap();
    let prepare = ComStmtPrepare::read(&payload).unwrap();
    assert_eq!(prepare.sql, "SELECT ?");
    let mut out = Vec::new();
    prepare.write(&mut out);
    assert_eq!(out, payload);

    let payload = hex::decode("1901000000").unwrap();
    let close = ComStmtClose::read(&payload).unwrap();
    assert_eq!(close.statement_id, 1);
    assert_eq!(read_statement_id(&payload).unwrap(), 1);
    let mut out = Vec::new();
    close.write(&mut out);
    assert_eq!(out, payload);

    let payload = hex::decode("1a07000000").unwrap();
    let reset = ComStmtReset::read(&payload).unwrap();
    assert_eq!(reset.statement_id, 7);
    let mut out = Vec::new();
    reset.write(&mut out);
    assert_eq!(out, payload);

    // wrong command byte
    assert!(matches!(
        ComStmtClose::read(&hex::decode("1a01000000").unwrap()),
        Err(Error::InvalidPacket)
    ));
}

#[test]
fn test_com_stmt_execute_round_trip() {
    // id=1, flags=0, iteration=1, bitmap=00, bound=1, types LONG + VAR_STRING, 42, "hi"
    let payload = hex::decode("1701000000000100000000010300fd002a000000026869").unwrap();
    let long_data = no_long_data();
    let ctx = ExecuteContext {
        capabilities: caps41(),
        num_params: 2,
        bound_types: &[],
        long_data: &long_data,
    };
    let execute = ComStmtExecute::read(&payload, &ctx).unwrap();
    assert_eq!(execute.statement_id, 1);
    assert_eq!(execute.iteration_count, 1);
    assert!(execute.new_params_bound);
    assert_eq!(execute.params.len(), 2);
    assert_eq!(execute.params[0].value().unwrap(), Value::Int(42));
    assert_eq!(execute.params[1].value().unwrap(), Value::Bytes(b"hi".to_vec()));
    assert_eq!(
        execute.param_types(),
        vec![
            ParamType {
                column_type: ColumnType::MYSQL_TYPE_LONG,
                unsigned: false
            },
            ParamType {
                column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
                unsigned: false
            },
        ]
    );

    let mut out = Vec::new();
    execute.write(&mut out, caps41());
    assert_eq!(out, payload);
}

#[test]
fn test_com_stmt_execute_reuses_bound_types() {
    let bound = [
        ParamType {
            column_type: ColumnType::MYSQL_TYPE_LONG,
            unsigned: true,
        },
        ParamType {
            column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
            unsigned: false,
        },
    ];
    let long_data = no_long_data();
    let ctx = ExecuteContext {
        capabilities: caps41(),
        num_params: 2,
        bound_types: &bound,
        long_data: &long_data,
    };

    // second param NULL (bit 1), new_params_bound=0, only the first value follows
    let payload = hex::decode("170100000000010000000200ffffffff").unwrap();
    let execute = ComStmtExecute::read(&payload, &ctx).unwrap();
    assert!(!execute.new_params_bound);
    assert_eq!(execute.params[0].value().unwrap(), Value::UInt(u32::MAX as u64));
    assert_eq!(execute.params[1].value().unwrap(), Value::Null);

    // no stored types and no new ones is an error
    let ctx = ExecuteContext {
        bound_types: &[],
        ..ctx
    };
    let err = ComStmtExecute::read(&payload, &ctx).unwrap_err();
    assert_eq!(err.to_err_payload().error_code, 1210);
}

#[test]
fn test_com_stmt_execute_uses_long_data() {
    let mut long_data = HashMap::new();
    long_data.insert(1u16, b"hello".to_vec());
    let ctx = ExecuteContext {
        capabilities: caps41(),
        num_params: 2,
        bound_types: &[],
        long_data: &long_data,
    };
    // types LONG + LONG; the second value comes from long data and is absent on the wire
    let payload = hex::decode("1701000000000100000000010300030005000000").unwrap();
    let execute = ComStmtExecute::read(&payload, &ctx).unwrap();
    assert_eq!(execute.params[0].value().unwrap(), Value::Int(5));
    assert_eq!(execute.params[1].column_type, ColumnType::MYSQL_TYPE_BLOB);
    assert_eq!(execute.params[1].value().unwrap(), Value::Bytes(b"hello".to_vec()));
}

#[test]
fn test_com_stmt_execute_with_query_attributes() {
    let caps = caps41() | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;
    let long_data = no_long_data();
    let ctx = ExecuteContext {
        capabilities: caps,
        num_params: 1,
        bound_types: &[],
        long_data: &long_data,
    };
    // flags=PARAMETER_COUNT_AVAILABLE, count=2: one positional LONG + attribute a='x'
    let payload = hex::decode(concat!(
        "17010000000801000000",
        "02",         // parameter_count
        "0001",       // bitmap, new_params_bound
        "030000",     // LONG, name ""
        "fd000161",   // VAR_STRING, name "a"
        "2a0000000178"
    ))
    .unwrap();
    let execute = ComStmtExecute::read(&payload, &ctx).unwrap();
    assert_eq!(execute.params.len(), 1);
    assert_eq!(execute.params[0].value().unwrap(), Value::Int(42));
    assert_eq!(execute.attributes.len(), 1);
    assert_eq!(execute.attributes[0].name, "a");
    assert_eq!(
        execute.attributes[0].param.value().unwrap(),
        Value::Bytes(b"x".to_vec())
    );

    let mut out = Vec::new();
    execute.write(&mut out, caps);
    assert_eq!(out, payload);

    // fewer parameters than placeholders
    let ctx = ExecuteContext {
        num_params: 3,
        ..ctx
    };
    assert!(ComStmtExecute::read(&payload, &ctx).is_err());
}

#[test]
fn test_com_stmt_send_long_data_round_trip() {
    let payload = hex::decode("18050000000100616263").unwrap();
    let long_data = ComStmtSendLongData::read(&payload).unwrap();
    assert_eq!(long_data.statement_id, 5);
    assert_eq!(long_data.param_id, 1);
    assert_eq!(long_data.data, b"abc");
    let mut out = Vec::new();
    long_data.write(&mut out);
    assert_eq!(out, payload);
}

#[test]
fn test_utility_commands() {
    let init_db = ComInitDb::read(&hex::decode("0274657374").unwrap()).unwrap();
    assert_eq!(init_db.schema, "test");

    let payload = hex::decode("0475736572730025").unwrap();
    let field_list = ComFieldList::read(&payload).unwrap();
    assert_eq!(field_list.table, "users");
    assert_eq!(field_list.wildcard, "%");
    let mut out = Vec::new();
    field_list.write(&mut out);
    assert_eq!(out, payload);

    assert_eq!(
        ComSetOption::read(&[0x1b, 0x00, 0x00]).unwrap(),
        ComSetOption::MultiStatementsOn
    );
    assert_eq!(
        ComSetOption::read(&[0x1b, 0x01, 0x00]).unwrap(),
        ComSetOption::MultiStatementsOff
    );
    assert!(ComSetOption::read(&[0x1b, 0x09, 0x00]).is_err());
}

#[test]
fn test_prepare_response_packets() {
    let response = StmtPrepareResponse {
        statement_id: 1,
        warning_count: 0,
        metadata: ResultsetMetadata::Full,
        params: vec![ColumnDefinition::param()],
        columns: vec![ColumnDefinition::new("id", ColumnType::MYSQL_TYPE_LONGLONG)],
    };

    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    response.write(&mut writer, caps41(), AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);

    // OK, param, EOF, column, EOF
    assert_eq!(packets.len(), 5);
    assert_eq!(
        packets.iter().map(|p| p.sequence_id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(
        packets[0].payload,
        hex::decode("000100000001000100000000").unwrap()
    );
    assert_eq!(packets[2].payload, hex::decode("fe00000200").unwrap());

    let mut payloads = packets.iter().map(|p| p.payload.as_slice());
    let parsed = StmtPrepareResponse::read(&mut payloads, caps41()).unwrap();
    assert_eq!(parsed, response);
    assert!(payloads.next().is_none());

    // DEPRECATE_EOF drops both EOF packets
    let caps = caps41() | CapabilityFlags::CLIENT_DEPRECATE_EOF;
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    response.write(&mut writer, caps, AUTOCOMMIT).unwrap();
    assert_eq!(split_packets(&out).len(), 3);
}

#[test]
fn test_prepare_response_with_optional_metadata() {
    let caps = caps41() | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA;
    let mut response = StmtPrepareResponse {
        statement_id: 1,
        warning_count: 0,
        metadata: ResultsetMetadata::Full,
        params: vec![ColumnDefinition::param()],
        columns: vec![ColumnDefinition::new("id", ColumnType::MYSQL_TYPE_LONGLONG)],
    };

    // metadata_follows comes after warning_count
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    response.write(&mut writer, caps, AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);
    assert_eq!(packets.len(), 5);
    assert_eq!(
        packets[0].payload,
        hex::decode("00010000000100010000000001").unwrap()
    );
    let mut payloads = packets.iter().map(|p| p.payload.as_slice());
    assert_eq!(StmtPrepareResponse::read(&mut payloads, caps).unwrap(), response);

    // no definitions and no EOFs when metadata is suppressed
    response.metadata = ResultsetMetadata::None;
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    response.write(&mut writer, caps, AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].payload,
        hex::decode("00010000000100010000000000").unwrap()
    );
    let mut payloads = packets.iter().map(|p| p.payload.as_slice());
    let parsed = StmtPrepareResponse::read(&mut payloads, caps).unwrap();
    assert_eq!(parsed.metadata, ResultsetMetadata::None);
    assert!(parsed.params.is_empty());
    assert!(parsed.columns.is_empty());
}

#[test]
fn test_resultset_with_optional_metadata() {
    let caps = caps41() | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA;
    let columns = resultset_columns();
    let rows = resultset_rows();

    // metadata_follows comes after the column count
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    write_resultset(&mut writer, RowFormat::Text, &columns, &rows, caps, AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);
    assert_eq!(packets.len(), 8);
    assert_eq!(packets[0].payload, [3, 1]);

    let mut decoder = ResultSetDecoder::new(RowFormat::Text, caps);
    let events = packets
        .iter()
        .map(|p| decoder.drive(&p.payload).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(events[3], ResultSetEvent::Column(columns[2].clone()));
    assert_eq!(events[5], ResultSetEvent::Row(Row::Text(rows[0].clone())));

    // suppressed metadata keeps the EOF that precedes the rows
    let header = ResultSetHeader {
        column_count: 3,
        metadata: ResultsetMetadata::None,
    };
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    writer
        .write(|out| {
            header.write(out, caps);
            Ok(())
        })
        .unwrap();
    write_definition_block(&mut writer, &columns, header.metadata, caps, AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].payload, [3, 0]);
    assert_eq!(packets[1].payload, hex::decode("fe00000200").unwrap());

    assert_eq!(ResultSetHeader::read(&packets[0].payload, caps).unwrap(), header);
    let mut payloads = packets[1..].iter().map(|p| p.payload.as_slice());
    let definitions = read_definition_block(&mut payloads, 3, header.metadata, caps).unwrap();
    assert!(definitions.is_empty());
    assert!(payloads.next().is_none());

    // with DEPRECATE_EOF nothing follows the header
    let caps = caps | CapabilityFlags::CLIENT_DEPRECATE_EOF;
    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(2));
    write_definition_block(&mut writer, &columns, ResultsetMetadata::None, caps, AUTOCOMMIT)
        .unwrap();
    assert!(out.is_empty());
}

fn resultset_columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new("id", ColumnType::MYSQL_TYPE_LONGLONG),
        ColumnDefinition::new("name", ColumnType::MYSQL_TYPE_VAR_STRING),
        ColumnDefinition::new("ts", ColumnType::MYSQL_TYPE_DATETIME),
    ]
}

fn resultset_rows() -> Vec<TextRow> {
    vec![
        TextRow::from_strs(&[Some("7"), None, Some("2024-01-02 03:04:05")]),
        TextRow::from_strs(&[Some("8"), Some(""), None]),
    ]
}

#[test]
fn test_text_resultset_packets() {
    let columns = resultset_columns();
    let rows = resultset_rows();

    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    write_resultset(&mut writer, RowFormat::Text, &columns, &rows, caps41(), AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);

    // count, 3 columns, EOF, 2 rows, EOF
    assert_eq!(packets.len(), 8);
    assert_eq!(packets[0].payload, [3]);
    assert_eq!(packets[4].payload, hex::decode("fe00000200").unwrap());
    let mut row = vec![1, b'7', 0xFB, 19];
    row.extend_from_slice(b"2024-01-02 03:04:05");
    assert_eq!(packets[5].payload, row);
    assert_eq!(packets[6].payload, hex::decode("013800fb").unwrap());
    assert_eq!(packets[7].payload, hex::decode("fe00000200").unwrap());

    let mut decoder = ResultSetDecoder::new(RowFormat::Text, caps41());
    let events = packets
        .iter()
        .map(|p| decoder.drive(&p.payload).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(events[0], ResultSetEvent::ResultSetStart { num_columns: 3 });
    assert_eq!(events[1], ResultSetEvent::Column(columns[0].clone()));
    assert_eq!(events[4], ResultSetEvent::NeedPayload);
    assert_eq!(events[5], ResultSetEvent::Row(Row::Text(rows[0].clone())));
    assert_eq!(
        events[7],
        ResultSetEvent::Eof {
            status_flags: AUTOCOMMIT,
            warnings: 0
        }
    );
    assert!(decoder.is_finished());
}

#[test]
fn test_binary_resultset_packets() {
    let columns = resultset_columns();
    let rows = resultset_rows();
    let caps = caps41() | CapabilityFlags::CLIENT_DEPRECATE_EOF;

    let mut out = Vec::new();
    let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
    write_resultset(&mut writer, RowFormat::Binary, &columns, &rows, caps, AUTOCOMMIT).unwrap();
    let packets = split_packets(&out);

    // count, 3 columns, 2 rows, OK terminator
    assert_eq!(packets.len(), 7);
    // id=7, name NULL: bit 3, ts as a 7-byte DATETIME
    assert_eq!(
        packets[4].payload,
        hex::decode("0008070000000000000007e8070102030405").unwrap()
    );
    // id=8, name='' (not NULL), ts NULL: bit 4
    assert_eq!(
        packets[5].payload,
        hex::decode("0010080000000000000000").unwrap()
    );
    assert_eq!(packets[6].payload, hex::decode("fe000002000000").unwrap());

    let mut decoder = ResultSetDecoder::new(RowFormat::Binary, caps);
    let events = packets
        .iter()
        .map(|p| decoder.drive(&p.payload).unwrap())
        .collect::<Vec<_>>();
    let ts = DateTime {
        hour: 3,
        minute: 4,
        second: 5,
        ..DateTime::from(Date::new(2024, 1, 2))
    };
    assert_eq!(
        events[4],
        ResultSetEvent::Row(Row::Binary(vec![
            Value::Int(7),
            Value::Null,
            Value::DateTime(ts)
        ]))
    );
    assert_eq!(
        events[5],
        ResultSetEvent::Row(Row::Binary(vec![
            Value::Int(8),
            Value::Bytes(Vec::new()),
            Value::Null
        ]))
    );
    assert!(matches!(events[6], ResultSetEvent::Eof { .. }));
}

#[test]
fn test_text_row_to_binary_rejects_bad_values() {
    let columns = vec![ColumnDefinition::new("n", ColumnType::MYSQL_TYPE_LONG)];
    let mut out = Vec::new();
    let err = text_row_to_binary(&columns, &TextRow::from_strs(&[Some("abc")]), &mut out)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }));

    let columns = vec![ColumnDefinition::new("t", ColumnType::MYSQL_TYPE_TINY)];
    let err = text_row_to_binary(&columns, &TextRow::from_strs(&[Some("300")]), &mut Vec::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }));
}

#[test]
fn test_resultset_rejects_ragged_rows() {
    let columns = vec![ColumnDefinition::new("n", ColumnType::MYSQL_TYPE_LONG)];
    let rows = vec![
        TextRow::from_strs(&[Some("1")]),
        TextRow::from_strs(&[Some("2"), Some("3")]),
    ];

    for format in [RowFormat::Text, RowFormat::Binary] {
        let mut out = Vec::new();
        let mut writer = PacketWriter::new(&mut out, SequenceId::new(1));
        let err = write_resultset(&mut writer, format, &columns, &rows, caps41(), AUTOCOMMIT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RowArity {
                expected: 1,
                actual: 2
            }
        ));
        assert!(!err.is_fatal());
        assert_eq!(err.to_err_payload().error_code, 1105);
        assert_eq!(writer.sequence_id(), SequenceId::new(1));
        assert!(out.is_empty());
    }

    let short = vec![TextRow::from_strs(&[])];
    let columns = resultset_columns();
    let err = write_resultset(
        &mut PacketWriter::new(&mut Vec::new(), SequenceId::new(1)),
        RowFormat::Text,
        &columns,
        &short,
        caps41(),
        AUTOCOMMIT,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::RowArity {
            expected: 3,
            actual: 0
        }
    ));
}

#[test]
fn test_decoder_surfaces_errors() {
    let mut decoder = ResultSetDecoder::new(RowFormat::Text, caps41());
    let mut payload = hex::decode("ff7a04233432533032").unwrap();
    payload.extend_from_slice(b"Table 'x' doesn't exist");
    match decoder.drive(&payload) {
        Err(Error::ServerError(err)) => {
            assert_eq!(err.error_code, 1146);
            assert_eq!(err.sql_state, "42S02");
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut decoder = ResultSetDecoder::new(RowFormat::Text, caps41());
    let event = decoder.drive(&hex::decode("00010002000000").unwrap()).unwrap();
    match event {
        ResultSetEvent::NoResultSet(ok) => assert_eq!(ok.affected_rows, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert!(decoder.drive(&[0x00]).is_err());
}

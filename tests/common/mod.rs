//! Shared fixtures for the server integration tests: a one-table SQL layer and a
//! hand-framing blocking client.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::time::Duration;

use zero_mysql_server::constant::{
    CapabilityFlags, ColumnType, DEFAULT_MAX_PACKET_SIZE, UTF8MB4_GENERAL_CI,
};
use zero_mysql_server::error::{ER_PARSE_ERROR, Error, Result, SQLSTATE_SYNTAX};
use zero_mysql_server::protocol::command::ColumnDefinition;
use zero_mysql_server::protocol::connection::{HandshakeResponse41, InitialHandshake};
use zero_mysql_server::sql::TextRow;
use zero_mysql_server::{
    Engine, ResultSet, Session, SqlExecutor, SqlParser, Statement, StatementKind,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const CLIENT_CAPS: CapabilityFlags = CapabilityFlags::CLIENT_PROTOCOL_41
    .union(CapabilityFlags::CLIENT_SECURE_CONNECTION)
    .union(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    .union(CapabilityFlags::CLIENT_TRANSACTIONS)
    .union(CapabilityFlags::CLIENT_MULTI_RESULTS)
    .union(CapabilityFlags::CLIENT_CONNECT_ATTRS)
    .union(CapabilityFlags::CLIENT_DEPRECATE_EOF);

/// OK with `SERVER_STATUS_AUTOCOMMIT`
pub const OK: &str = "00000002000000";
/// Resultset terminator under `CLIENT_DEPRECATE_EOF`
pub const TERMINATOR: &str = "fe000002000000";

/// Understands `SELECT <cols> FROM greetings [WHERE id = ?]`, `BEGIN` and `COMMIT`
pub struct GreetingParser;

impl SqlParser for GreetingParser {
    fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        sql.split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let upper = part.to_ascii_uppercase();
                let statement = if upper.starts_with("SELECT ") {
                    let (projection, tables) = match upper.find(" FROM ") {
                        Some(idx) => (&part[7..idx], vec!["greetings"]),
                        None => (&part[7..], Vec::new()),
                    };
                    Statement::new(StatementKind::Select, part)
                        .with_projection(projection.split(',').map(str::trim))
                        .with_tables(tables)
                } else if upper == "BEGIN" {
                    Statement::new(StatementKind::Begin, part)
                } else if upper == "COMMIT" {
                    Statement::new(StatementKind::Commit, part)
                } else {
                    return Err(Error::sql(
                        ER_PARSE_ERROR,
                        SQLSTATE_SYNTAX,
                        format!("near '{part}' at line 1"),
                    ));
                };
                Ok(statement.with_placeholders(part.matches('?').count()))
            })
            .collect()
    }
}

pub struct GreetingExecutor;

pub fn greeting_columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new("id", ColumnType::MYSQL_TYPE_LONGLONG),
        ColumnDefinition::new("msg", ColumnType::MYSQL_TYPE_VAR_STRING),
    ]
}

impl SqlExecutor for GreetingExecutor {
    fn table_columns(&self, _session: &Session, _table: &str) -> Result<Vec<ColumnDefinition>> {
        Ok(greeting_columns())
    }

    fn select(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        if statement.tables.is_empty() {
            let literal = statement.projection.join(", ");
            return Ok(ResultSet::rows(
                vec![ColumnDefinition::new(literal.clone(), ColumnType::MYSQL_TYPE_LONGLONG)],
                vec![TextRow::from_strs(&[Some(&literal)])],
            ));
        }
        let mut rows = vec![
            TextRow::from_strs(&[Some("1"), Some("hello")]),
            TextRow::from_strs(&[Some("2"), Some("world")]),
        ];
        if let Some(idx) = statement.sql.to_ascii_uppercase().find("WHERE ID = ") {
            let id = statement.sql[idx + 11..].trim().trim_matches('\'');
            rows.retain(|row| row.get(0) == Some(id.as_bytes()));
        }
        Ok(ResultSet::rows(greeting_columns(), rows))
    }
}

pub type GreetingEngine = Engine<GreetingParser, GreetingExecutor>;

pub fn engine() -> GreetingEngine {
    Engine::new(GreetingParser, GreetingExecutor)
}

/// Speaks just enough of the client side to drive a server byte by byte
pub struct Client<S> {
    stream: S,
    pub handshake: InitialHandshake,
}

impl<S: Read + Write> Client<S> {
    /// Read the initial handshake
    pub fn connect(mut stream: S) -> Self {
        let (sequence_id, payload) = read_packet(&mut stream);
        assert_eq!(sequence_id, 0);
        let handshake = InitialHandshake::read(&payload).expect("initial handshake");
        Self { stream, handshake }
    }

    /// Send HandshakeResponse41 and return the server's answer
    pub fn login(&mut self, capability_flags: CapabilityFlags) -> Vec<u8> {
        let response = HandshakeResponse41 {
            capability_flags,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            charset: UTF8MB4_GENERAL_CI,
            username: "app".to_string(),
            auth_response: vec![0; 20],
            database: None,
            auth_plugin_name: Some("mysql_native_password".to_string()),
            connect_attrs: vec![("_client_name".to_string(), "tests".to_string())],
            zstd_compression_level: None,
        };
        let mut payload = Vec::new();
        response.write(&mut payload).expect("handshake response");
        self.write_packet(1, &payload);
        let (sequence_id, payload) = self.read_packet();
        assert_eq!(sequence_id, 2);
        payload
    }

    pub fn write_packet(&mut self, sequence_id: u8, payload: &[u8]) {
        let len = u32::try_from(payload.len()).expect("payload fits").to_le_bytes();
        self.stream
            .write_all(&[len[0], len[1], len[2], sequence_id])
            .expect("write header");
        self.stream.write_all(payload).expect("write payload");
        self.stream.flush().expect("flush");
    }

    pub fn read_packet(&mut self) -> (u8, Vec<u8>) {
        read_packet(&mut self.stream)
    }

    /// Send a command and read `count` response payloads, checking sequence ids
    pub fn command(&mut self, payload: &[u8], count: usize) -> Vec<Vec<u8>> {
        self.write_packet(0, payload);
        (1..=count)
            .map(|expected| {
                let (sequence_id, payload) = self.read_packet();
                assert_eq!(usize::from(sequence_id), expected);
                payload
            })
            .collect()
    }

    pub fn query(&mut self, sql: &str, count: usize) -> Vec<Vec<u8>> {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        self.command(&payload, count)
    }

    /// Whether the server has closed the connection
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(n) => n == 0,
            Err(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

fn read_packet<S: Read>(stream: &mut S) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("read header");
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("read payload");
    (header[3], payload)
}

pub fn h(payload: &str) -> Vec<u8> {
    hex::decode(payload).expect("hex fixture")
}

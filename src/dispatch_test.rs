use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::Opts;
use crate::connections::ConnRegistry;
use crate::constant::{CapabilityFlags, DEFAULT_MAX_PACKET_SIZE, UTF8MB4_GENERAL_CI};
use crate::dispatch::{DispatchResult, Dispatcher};
use crate::handler::Engine;
use crate::prepared::StatementRegistry;
use crate::protocol::command::ColumnDefinition;
use crate::protocol::connection::{HandshakeResponse41, InitialHandshake, SslRequest};
use crate::protocol::packet::Packet;
use crate::testing::{KeywordParser, TestEngine, UsersExecutor};

const CLIENT_BASE: CapabilityFlags = CapabilityFlags::CLIENT_PROTOCOL_41
    .union(CapabilityFlags::CLIENT_SECURE_CONNECTION)
    .union(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    .union(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
    .union(CapabilityFlags::CLIENT_TRANSACTIONS)
    .union(CapabilityFlags::CLIENT_MULTI_RESULTS);

struct Client {
    dispatcher: Dispatcher<TestEngine>,
    statements: Arc<StatementRegistry>,
}

impl Client {
    fn new(registry: &Arc<ConnRegistry>, client_caps: CapabilityFlags) -> Self {
        let mut client = Self::connect(registry, false);
        client.login(client_caps, 1);
        client
    }

    /// Stop after the initial handshake
    fn connect(registry: &Arc<ConnRegistry>, tls: bool) -> Self {
        let statements = Arc::new(StatementRegistry::new());
        let engine =
            Engine::new(KeywordParser, UsersExecutor).with_registry(Arc::clone(&statements));
        let opts = Opts::default();
        let mut dispatcher =
            Dispatcher::new(engine, registry.register("test"), opts.handshake_config(0, tls));

        let mut out = Vec::new();
        dispatcher.start(&mut out).unwrap();
        let packets = split(&out);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sequence_id, 0);
        let handshake = InitialHandshake::read(&packets[0].payload).unwrap();
        assert_eq!(handshake.connection_id, dispatcher.connection_id());

        Self {
            dispatcher,
            statements,
        }
    }

    fn login(&mut self, client_caps: CapabilityFlags, sequence_id: u8) {
        let (result, packets) = self.send(sequence_id, &handshake_response(client_caps));
        assert_eq!(result, DispatchResult::Continue);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sequence_id, sequence_id + 1);
        assert_eq!(packets[0].payload, hex::decode("00000002000000").unwrap());
    }

    fn send(&mut self, sequence_id: u8, payload: &[u8]) -> (DispatchResult, Vec<Packet>) {
        let mut out = Vec::new();
        let result = self
            .dispatcher
            .handle_packet(sequence_id, payload, &mut out)
            .unwrap();
        (result, split(&out))
    }

    /// Send a command (sequence id 0) and return the response payloads, checking their
    /// sequence ids count up from 1
    fn command(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let (result, packets) = self.send(0, payload);
        assert_eq!(result, DispatchResult::Continue);
        packets
            .into_iter()
            .enumerate()
            .map(|(idx, packet)| {
                assert_eq!(usize::from(packet.sequence_id), idx + 1);
                packet.payload
            })
            .collect()
    }

    fn command_hex(&mut self, payload: &str) -> Vec<Vec<u8>> {
        self.command(&hex::decode(payload).unwrap())
    }
}

fn handshake_response(capability_flags: CapabilityFlags) -> Vec<u8> {
    let response = HandshakeResponse41 {
        capability_flags,
        max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        charset: UTF8MB4_GENERAL_CI,
        username: "app".to_string(),
        auth_response: vec![0x11; 20],
        database: Some("test".to_string()),
        auth_plugin_name: Some("mysql_native_password".to_string()),
        connect_attrs: Vec::new(),
        zstd_compression_level: None,
    };
    let mut payload = Vec::new();
    response.write(&mut payload).unwrap();
    payload
}

fn split(mut data: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    while !data.is_empty() {
        let (packet, rest) = Packet::parse(data).unwrap();
        packets.push(packet);
        data = rest;
    }
    packets
}

fn query(sql: &str) -> Vec<u8> {
    let mut payload = vec![0x03];
    payload.extend_from_slice(sql.as_bytes());
    payload
}

fn column_names(payloads: &[Vec<u8>]) -> Vec<String> {
    payloads
        .iter()
        .map(|p| ColumnDefinition::read(p).unwrap().name)
        .collect()
}

/// COM_STMT_EXECUTE of statement 1 binding `id = 1` as LONGLONG
const EXECUTE_ID_1: &str = concat!(
    "17", "01000000", "00", "01000000", "00", "01", "0800", "0100000000000000"
);
/// Same, reusing the bound types with `id = 2`
const EXECUTE_ID_2: &str =
    concat!("17", "01000000", "00", "01000000", "00", "00", "0200000000000000");
/// COM_STMT_EXECUTE of statement 1 whose only parameter comes from long data
const EXECUTE_LONG_DATA: &str = concat!("17", "01000000", "00", "01000000", "00", "01", "0800");

const EOF: &str = "fe00000200";
const TERMINATOR: &str = "fe000002000000";

fn h(payload: &str) -> Vec<u8> {
    hex::decode(payload).unwrap()
}

#[test]
fn test_login_and_ping() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);
    let session = client.dispatcher.session().unwrap();
    assert_eq!(session.username(), "app");
    assert_eq!(session.database(), Some("test"));
    assert!(
        !session
            .capabilities()
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    );

    assert_eq!(client.command_hex("0e"), vec![h("00000002000000")]);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_text_query_with_eof() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);

    let packets = client.command(&query("SELECT name FROM users"));
    assert_eq!(packets.len(), 6);
    assert_eq!(packets[0], h("01"));
    assert_eq!(column_names(&packets[1..2]), ["name"]);
    assert_eq!(packets[2], h(EOF));
    assert_eq!(packets[3], h("05616c696365"));
    assert_eq!(packets[4], h("fb"));
    assert_eq!(packets[5], h(EOF));
}

#[test]
fn test_text_query_with_deprecate_eof() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE | CapabilityFlags::CLIENT_DEPRECATE_EOF);

    let packets = client.command(&query("SELECT 1"));
    assert_eq!(packets.len(), 4);
    assert_eq!(packets[0], h("01"));
    assert_eq!(column_names(&packets[1..2]), ["1"]);
    assert_eq!(packets[2], h("0131"));
    assert_eq!(packets[3], h(TERMINATOR));
}

#[test]
fn test_insert_reports_affected_rows() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);
    assert_eq!(
        client.command(&query("INSERT INTO users VALUES (3, 'carol', NULL)")),
        vec![h("00010302000000")]
    );
}

#[test]
fn test_errors_keep_the_connection_open() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);

    let packets = client.command(&query("FROB"));
    assert_eq!(packets.len(), 1);
    assert_eq!(&packets[0][..9], h("ff2804233432303030").as_slice());

    let packets = client.command(&query("SELECT * FROM nowhere"));
    let mut expected = h("ff7a04233432533032");
    expected.extend_from_slice(b"Table 'test.nowhere' doesn't exist");
    assert_eq!(packets, vec![expected]);

    // unknown command bytes
    for payload in ["20", "00"] {
        let packets = client.command_hex(payload);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..9], h("ff1704233038533031").as_slice());
    }

    assert_eq!(client.command_hex("0e"), vec![h("00000002000000")]);
}

#[test]
fn test_multi_statements_and_set_option() {
    let registry = Arc::new(ConnRegistry::new());
    let caps = CLIENT_BASE | CapabilityFlags::CLIENT_MULTI_STATEMENTS;
    let mut client = Client::new(&registry, caps);

    let packets = client.command(&query("SELECT 1; SELECT 2"));
    assert_eq!(packets.len(), 10);
    // MORE_RESULTS_EXISTS on the first resultset's EOFs
    assert_eq!(packets[2], h("fe00000a00"));
    assert_eq!(packets[4], h("fe00000a00"));
    assert_eq!(packets[8], h("0132"));
    assert_eq!(packets[9], h(EOF));

    // COM_SET_OPTION MYSQL_OPTION_MULTI_STATEMENTS_OFF
    assert_eq!(client.command_hex("1b0100"), vec![h(EOF)]);
    let packets = client.command(&query("SELECT 1; SELECT 2"));
    assert_eq!(packets.len(), 1);
    assert_eq!(&packets[0][..3], h("ff2804").as_slice());

    assert_eq!(client.command_hex("1b0000"), vec![h(EOF)]);
    assert_eq!(client.command(&query("SELECT 1; SELECT 2")).len(), 10);
}

#[test]
fn test_prepare_execute_close() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);

    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT name FROM users WHERE id = ?");
    let packets = client.command(&prepare);
    assert_eq!(packets.len(), 5);
    assert_eq!(packets[0], h("000100000001000100000000"));
    assert_eq!(column_names(&packets[1..2]), ["?"]);
    assert_eq!(packets[2], h(EOF));
    assert_eq!(column_names(&packets[3..4]), ["name"]);
    assert_eq!(packets[4], h(EOF));
    assert_eq!(client.statements.len(), 1);

    let packets = client.command_hex(EXECUTE_ID_1);
    assert_eq!(packets.len(), 5);
    assert_eq!(packets[0], h("01"));
    assert_eq!(packets[2], h(EOF));
    assert_eq!(packets[3], h("000005616c696365"));
    assert_eq!(packets[4], h(EOF));

    // id = 2 has a NULL name
    let packets = client.command_hex(EXECUTE_ID_2);
    assert_eq!(packets[3], h("0004"));

    // COM_STMT_CLOSE has no response
    assert!(client.command_hex("1901000000").is_empty());
    assert!(client.statements.is_empty());

    let packets = client.command_hex(EXECUTE_ID_1);
    assert_eq!(packets.len(), 1);
    assert_eq!(&packets[0][..9], h("ffdb04234859303030").as_slice());
}

#[test]
fn test_long_data_and_reset() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE | CapabilityFlags::CLIENT_DEPRECATE_EOF);

    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT name FROM users WHERE id = ?");
    let packets = client.command(&prepare);
    assert_eq!(packets.len(), 3);

    // COM_STMT_SEND_LONG_DATA has no response
    assert!(client.command_hex(concat!("18", "01000000", "0000", "31")).is_empty());
    let packets = client.command_hex(EXECUTE_LONG_DATA);
    assert_eq!(packets.len(), 4);
    assert_eq!(packets[2], h("000005616c696365"));
    assert_eq!(packets[3], h(TERMINATOR));
    assert!(client.dispatcher.session().unwrap().long_data(1).unwrap().is_empty());

    assert!(client.command_hex(concat!("18", "01000000", "0000", "32")).is_empty());
    assert_eq!(client.command_hex("1a01000000"), vec![h("00000002000000")]);
    let session = client.dispatcher.session().unwrap();
    assert!(session.long_data(1).unwrap().is_empty());

    let packets = client.command_hex("1a02000000");
    assert_eq!(&packets[0][..3], h("ffdb04").as_slice());
}

#[test]
fn test_reset_connection_forgets_statements() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE | CapabilityFlags::CLIENT_MULTI_STATEMENTS);

    client.command(&query("BEGIN"));
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT 1");
    client.command(&prepare);
    assert_eq!(client.statements.len(), 1);

    let packets = client.command_hex("1f");
    assert_eq!(packets, vec![h("00000002000000")]);
    assert!(client.statements.is_empty());
    assert!(!client.dispatcher.session().unwrap().in_transaction());
}

#[test]
fn test_init_db_field_list_statistics() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);

    let mut init_db = vec![0x02];
    init_db.extend_from_slice(b"app");
    assert_eq!(client.command(&init_db), vec![h("00000002000000")]);
    assert_eq!(client.dispatcher.session().unwrap().database(), Some("app"));

    let mut field_list = vec![0x04];
    field_list.extend_from_slice(b"users\0");
    let packets = client.command(&field_list);
    assert_eq!(packets.len(), 4);
    assert_eq!(column_names(&packets[..3]), ["id", "name", "created"]);
    assert_eq!(ColumnDefinition::read(&packets[0]).unwrap().table, "users");
    assert_eq!(packets[3], h(EOF));

    let packets = client.command_hex("09");
    assert_eq!(packets.len(), 1);
    assert!(packets[0].starts_with(b"Uptime: "));

    // COM_DEBUG
    assert_eq!(client.command_hex("0d"), vec![h(EOF)]);
}

#[test]
fn test_quit_releases_statements() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::new(&registry, CLIENT_BASE);
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT 1");
    client.command(&prepare);
    assert_eq!(client.statements.len(), 1);

    let (result, packets) = client.send(0, &[0x01]);
    assert_eq!(result, DispatchResult::Close);
    assert!(packets.is_empty());
    assert!(client.dispatcher.is_closed());
    assert!(client.statements.is_empty());

    drop(client);
    assert!(registry.is_empty());
}

#[test]
fn test_process_kill() {
    let registry = Arc::new(ConnRegistry::new());
    let mut killer = Client::new(&registry, CLIENT_BASE);
    let mut victim = Client::new(&registry, CLIENT_BASE);
    let victim_id = victim.dispatcher.connection_id();

    let mut kill = vec![0x0c];
    kill.extend_from_slice(&victim_id.to_le_bytes());
    assert_eq!(killer.command(&kill), vec![h("00000002000000")]);

    let (result, packets) = victim.send(0, &[0x0e]);
    assert_eq!(result, DispatchResult::Close);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].sequence_id, 1);
    assert_eq!(&packets[0].payload[..9], h("ff8707233730313030").as_slice());

    let packets = killer.command_hex("0ce7030000");
    let mut expected = h("ff4604234859303030");
    expected.extend_from_slice(b"Unknown thread id: 999");
    assert_eq!(packets, vec![expected]);
}

#[test]
fn test_bad_handshakes_close_the_connection() {
    let registry = Arc::new(ConnRegistry::new());

    let mut client = Client::connect(&registry, false);
    let (result, packets) = client.send(1, &h("0102"));
    assert_eq!(result, DispatchResult::Close);
    assert_eq!(&packets[0].payload[..9], h("ff1304233038533031").as_slice());
    assert_eq!(packets[0].sequence_id, 2);

    // SSLRequest without TLS configured
    let mut client = Client::connect(&registry, false);
    let mut ssl = Vec::new();
    SslRequest {
        capability_flags: CLIENT_BASE | CapabilityFlags::CLIENT_SSL,
        max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        charset: UTF8MB4_GENERAL_CI,
    }
    .write(&mut ssl);
    let (result, packets) = client.send(1, &ssl);
    assert_eq!(result, DispatchResult::Close);
    assert_eq!(&packets[0].payload[..3], h("ffd304").as_slice());
}

#[test]
fn test_tls_upgrade() {
    let registry = Arc::new(ConnRegistry::new());
    let mut client = Client::connect(&registry, true);

    let caps = CLIENT_BASE | CapabilityFlags::CLIENT_SSL;
    let mut ssl = Vec::new();
    SslRequest {
        capability_flags: caps,
        max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        charset: UTF8MB4_GENERAL_CI,
    }
    .write(&mut ssl);
    let (result, packets) = client.send(1, &ssl);
    assert_eq!(result, DispatchResult::UpgradeTls);
    assert!(packets.is_empty());

    client.dispatcher.tls_established().unwrap();
    client.login(caps, 2);
    assert!(
        client
            .dispatcher
            .session()
            .unwrap()
            .capabilities()
            .contains(CapabilityFlags::CLIENT_SSL)
    );
}

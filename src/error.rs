use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::protocol::response::ErrPayload;

/// `ER_UNKNOWN_ERROR`
pub const ER_UNKNOWN_ERROR: u16 = 1105;
/// `ER_UNKNOWN_COM_ERROR`
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
/// `ER_UNKNOWN_STMT_HANDLER`
pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
/// `ER_PARSE_ERROR`
pub const ER_PARSE_ERROR: u16 = 1064;
/// `ER_NOT_SUPPORTED_YET`
pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
/// `ER_BAD_FIELD_ERROR`
pub const ER_BAD_FIELD_ERROR: u16 = 1054;
/// `ER_WRONG_ARGUMENTS`
pub const ER_WRONG_ARGUMENTS: u16 = 1210;
/// `ER_NET_PACKET_TOO_LARGE`
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
/// `ER_NO_DB_ERROR`
pub const ER_NO_DB_ERROR: u16 = 1046;
/// `ER_EMPTY_QUERY`
pub const ER_EMPTY_QUERY: u16 = 1065;
/// `ER_NO_SUCH_TABLE`
pub const ER_NO_SUCH_TABLE: u16 = 1146;
/// `ER_ACCESS_DENIED_ERROR`
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
/// `ER_HANDSHAKE_ERROR`
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
/// `ER_NO_SUCH_THREAD`
pub const ER_NO_SUCH_THREAD: u16 = 1094;
/// `ER_CON_COUNT_ERROR`
pub const ER_CON_COUNT_ERROR: u16 = 1040;
/// `ER_CONNECTION_KILLED`
pub const ER_CONNECTION_KILLED: u16 = 1927;

pub const SQLSTATE_GENERAL: &str = "HY000";
pub const SQLSTATE_SYNTAX: &str = "42000";
pub const SQLSTATE_COMMUNICATION: &str = "08S01";
pub const SQLSTATE_NO_DB: &str = "3D000";
pub const SQLSTATE_NO_SUCH_TABLE: &str = "42S02";
pub const SQLSTATE_BAD_FIELD: &str = "42S22";
pub const SQLSTATE_ACCESS_DENIED: &str = "28000";
pub const SQLSTATE_INTERRUPTED: &str = "70100";
pub const SQLSTATE_CONNECTION_REJECTED: &str = "08004";

#[derive(Debug, Error)]
pub enum Error {
    /// An SQL-level error carrying its own code and SQLSTATE
    #[error("Server Error: {0}")]
    ServerError(#[from] ErrPayload),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Unexpected end of packet")]
    UnexpectedEof,

    #[error("Packet payload of {0} bytes exceeds the 3-byte length field")]
    PacketTooLarge(usize),

    #[error("Not supported: {0}")]
    UnsupportedCapability(String),

    #[error("Unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Unknown prepared statement handler ({0})")]
    StatementNotFound(u32),

    #[error("Prepared statement id space exhausted")]
    StatementIdOverflow,

    #[error("Unsupported field type: 0x{0:02X}")]
    UnsupportedFieldType(u8),

    #[error("Invalid value {value:?} for column type {column_type:?}")]
    InvalidValue {
        column_type: crate::constant::ColumnType,
        value: String,
    },

    #[error("Row has {actual} cells but the resultset has {expected} columns")]
    RowArity { expected: usize, actual: usize },

    #[error("Library bug: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    /// Whether the error leaves the packet stream in an unknown state.
    ///
    /// Fatal errors close the connection; every other error is reported to the client
    /// as an ERR packet and the connection keeps serving commands.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IoError(_)
                | Error::InvalidPacket
                | Error::UnexpectedEof
                | Error::PacketTooLarge(_)
                | Error::UnsupportedCapability(_)
                | Error::BadConfigError(_)
                | Error::LibraryBug(_)
        )
    }

    /// Convert into the ERR payload sent to the client
    pub fn to_err_payload(&self) -> ErrPayload {
        match self {
            Error::ServerError(err) => err.clone(),
            Error::UnknownCommand(_) => ErrPayload::new(
                ER_UNKNOWN_COM_ERROR,
                SQLSTATE_COMMUNICATION,
                "Unknown command",
            ),
            Error::StatementNotFound(id) => ErrPayload::new(
                ER_UNKNOWN_STMT_HANDLER,
                SQLSTATE_GENERAL,
                format!("Unknown prepared statement handler ({id}) given to mysqld_stmt_execute"),
            ),
            Error::PacketTooLarge(_) => ErrPayload::new(
                ER_NET_PACKET_TOO_LARGE,
                SQLSTATE_COMMUNICATION,
                "Got a packet bigger than 'max_allowed_packet' bytes",
            ),
            Error::UnsupportedCapability(msg) => {
                ErrPayload::new(ER_NOT_SUPPORTED_YET, SQLSTATE_SYNTAX, msg.clone())
            }
            other => ErrPayload::new(ER_UNKNOWN_ERROR, SQLSTATE_GENERAL, other.to_string()),
        }
    }

    pub fn from_debug<E: std::fmt::Debug>(err: E) -> Self {
        Error::LibraryBug(eyre!("{:?}", err))
    }

    /// Shorthand for an SQL error with the given code and SQLSTATE
    pub fn sql(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Error::ServerError(ErrPayload::new(code, sql_state, message))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

pub type Result<T> = std::result::Result<T, Error>;

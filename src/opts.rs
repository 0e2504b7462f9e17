use std::sync::Arc;

use smart_default::SmartDefault;

use crate::buffer_pool::{BufferPool, GLOBAL_BUFFER_POOL};
use crate::constant::{
    CapabilityFlags, MYSQL_NATIVE_PASSWORD, ServerStatusFlags, UTF8MB4_GENERAL_CI,
};
use crate::error::Error;
use crate::protocol::connection::{HandshakeConfig, generate_auth_plugin_data};

/// A configuration for the server
///
/// ```rs
/// let mut opts1 = Opts::default();
/// opts1.port = 5000;
///
/// let mut opts2 = Opts::try_from("mysql://0.0.0.0:3307?max_connections=10")?;
/// opts2.capabilities |= CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;
/// ```
#[derive(Debug, Clone, SmartDefault)]
pub struct Opts {
    /// Address to listen on
    #[default = "127.0.0.1"]
    pub host: String,

    #[default = 3306]
    pub port: u16,

    /// Listen on this unix socket instead of TCP
    pub socket: Option<String>,

    /// Enable TCP_NODELAY on accepted sockets
    /// Unix socket is not affected
    #[default = true]
    pub tcp_nodelay: bool,

    /// Version string announced in the initial handshake
    #[default = "8.0.36-zero-mysql-server"]
    pub server_version: String,

    /// The advertised capabilities are `CAPABILITIES_SERVER_DEFAULT | (opts.capabilities & CAPABILITIES_CONFIGURABLE)`,
    /// plus `CLIENT_SSL` when a TLS acceptor is installed.
    /// The negotiated capabilities are `SERVER_CAPABILITIES & CLIENT_CAPABILITIES`.
    #[default(CapabilityFlags::CLIENT_MULTI_STATEMENTS | CapabilityFlags::CLIENT_DEPRECATE_EOF)]
    pub capabilities: CapabilityFlags,

    /// Collation id announced in the initial handshake
    #[default(UTF8MB4_GENERAL_CI)]
    pub charset: u8,

    /// Status of a fresh session
    #[default(ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT)]
    pub status_flags: ServerStatusFlags,

    #[default = "mysql_native_password"]
    pub auth_plugin_name: String,

    /// Connections beyond this many wait until another connection closes
    #[default = 151]
    pub max_connections: usize,

    #[default(Arc::clone(&GLOBAL_BUFFER_POOL))]
    pub buffer_pool: Arc<BufferPool>,
}

impl Opts {
    /// `host:port` to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handshake parameters for a new connection, with a fresh scramble
    pub fn handshake_config(&self, connection_id: u32, tls: bool) -> HandshakeConfig {
        HandshakeConfig {
            server_version: self.server_version.clone(),
            connection_id,
            capabilities: self.capabilities,
            charset: self.charset,
            status_flags: self.status_flags,
            auth_plugin_name: self.auth_plugin_name.clone(),
            auth_plugin_data: generate_auth_plugin_data(),
            tls,
        }
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(url: &str) -> Result<Self, Self::Error> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::BadConfigError(format!("Failed to parse MySQL URL: {}", e)))?;

        if parsed.scheme() != "mysql" {
            return Err(Error::BadConfigError(format!(
                "Invalid URL scheme '{}', expected 'mysql'",
                parsed.scheme()
            )));
        }

        let mut opts = Self::default();
        if let Some(host) = parsed.host_str() {
            opts.host = host.to_string();
        }
        if let Some(port) = parsed.port() {
            opts.port = port;
        }

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "socket" => opts.socket = Some(value.to_string()),
                "server_version" => opts.server_version = value.to_string(),
                "auth_plugin_name" => opts.auth_plugin_name = value.to_string(),
                "max_connections" => {
                    opts.max_connections = value.parse().map_err(|_| {
                        Error::BadConfigError(format!("Invalid max_connections: {}", value))
                    })?;
                    if opts.max_connections == 0 {
                        return Err(Error::BadConfigError(
                            "max_connections must be at least 1".to_string(),
                        ));
                    }
                }
                "tcp_nodelay" => opts.tcp_nodelay = parse_bool(&key, &value)?,
                "multi_statements" => set_capability(
                    &mut opts,
                    CapabilityFlags::CLIENT_MULTI_STATEMENTS,
                    parse_bool(&key, &value)?,
                ),
                "deprecate_eof" => set_capability(
                    &mut opts,
                    CapabilityFlags::CLIENT_DEPRECATE_EOF,
                    parse_bool(&key, &value)?,
                ),
                "query_attributes" => set_capability(
                    &mut opts,
                    CapabilityFlags::CLIENT_QUERY_ATTRIBUTES,
                    parse_bool(&key, &value)?,
                ),
                _ => {
                    return Err(Error::BadConfigError(format!(
                        "Unknown URL parameter '{}'",
                        key
                    )));
                }
            }
        }

        if opts.auth_plugin_name.is_empty() {
            opts.auth_plugin_name = MYSQL_NATIVE_PASSWORD.to_string();
        }
        Ok(opts)
    }
}

impl TryFrom<&Opts> for Opts {
    type Error = Error;

    fn try_from(opts: &Opts) -> Result<Self, Self::Error> {
        Ok(opts.clone())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(Error::BadConfigError(format!(
            "Invalid boolean for {}: {}",
            key, value
        ))),
    }
}

fn set_capability(opts: &mut Opts, flag: CapabilityFlags, enabled: bool) {
    opts.capabilities.set(flag, enabled);
}

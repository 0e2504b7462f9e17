use std::collections::HashMap;

use crate::constant::{CapabilityFlags, ServerStatusFlags};
use crate::protocol::command::prepared::ParamType;
use crate::protocol::connection::HandshakeResponse41;

/// Command-phase state of one client connection
#[derive(Debug, Clone)]
pub struct Session {
    connection_id: u32,
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
    username: String,
    database: Option<String>,
    connect_attrs: Vec<(String, String)>,
    multi_statements: bool,
    /// Prepared statements owned by this connection
    statements: HashMap<u32, StatementState>,
}

#[derive(Debug, Clone, Default)]
struct StatementState {
    long_data: HashMap<u16, Vec<u8>>,
    bound_types: Vec<ParamType>,
}

impl Session {
    pub fn new(
        connection_id: u32,
        capabilities: CapabilityFlags,
        status_flags: ServerStatusFlags,
    ) -> Self {
        Self {
            connection_id,
            capabilities,
            status_flags,
            username: String::new(),
            database: None,
            connect_attrs: Vec::new(),
            multi_statements: capabilities.contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS),
            statements: HashMap::new(),
        }
    }

    /// Session for a client whose handshake response was accepted
    pub fn from_handshake(
        connection_id: u32,
        response: &HandshakeResponse41,
        capabilities: CapabilityFlags,
        status_flags: ServerStatusFlags,
    ) -> Self {
        let mut session = Self::new(connection_id, capabilities, status_flags);
        session.username = response.username.clone();
        session.database = response.database.clone().filter(|db| !db.is_empty());
        session.connect_attrs = response.connect_attrs.clone();
        session
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Capabilities negotiated in the handshake
    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn status_flags(&self) -> ServerStatusFlags {
        self.status_flags
    }

    pub fn insert_status(&mut self, flags: ServerStatusFlags) {
        self.status_flags.insert(flags);
    }

    pub fn remove_status(&mut self, flags: ServerStatusFlags) {
        self.status_flags.remove(flags);
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags
            .contains(ServerStatusFlags::SERVER_STATUS_IN_TRANS)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn set_database(&mut self, database: Option<String>) {
        self.database = database;
    }

    pub fn connect_attrs(&self) -> &[(String, String)] {
        &self.connect_attrs
    }

    /// Whether a query may carry several statements
    pub fn multi_statements(&self) -> bool {
        self.multi_statements
    }

    /// COM_SET_OPTION
    pub fn set_multi_statements(&mut self, enabled: bool) {
        self.multi_statements = enabled;
    }

    pub fn track_statement(&mut self, statement_id: u32) {
        self.statements.entry(statement_id).or_default();
    }

    pub fn owns_statement(&self, statement_id: u32) -> bool {
        self.statements.contains_key(&statement_id)
    }

    pub fn forget_statement(&mut self, statement_id: u32) {
        self.statements.remove(&statement_id);
    }

    /// Ids of every statement this connection prepared and has not closed
    pub fn statement_ids(&self) -> Vec<u32> {
        self.statements.keys().copied().collect()
    }

    /// Append a COM_STMT_SEND_LONG_DATA chunk; ignored for statements not owned here
    pub fn append_long_data(&mut self, statement_id: u32, param_id: u16, data: &[u8]) {
        if let Some(state) = self.statements.get_mut(&statement_id) {
            state
                .long_data
                .entry(param_id)
                .or_default()
                .extend_from_slice(data);
        }
    }

    pub fn long_data(&self, statement_id: u32) -> Option<&HashMap<u16, Vec<u8>>> {
        self.statements.get(&statement_id).map(|s| &s.long_data)
    }

    pub fn bound_types(&self, statement_id: u32) -> &[ParamType] {
        self.statements
            .get(&statement_id)
            .map(|s| s.bound_types.as_slice())
            .unwrap_or_default()
    }

    pub fn set_bound_types(&mut self, statement_id: u32, types: Vec<ParamType>) {
        if let Some(state) = self.statements.get_mut(&statement_id) {
            state.bound_types = types;
        }
    }

    /// Drop buffered long data; called by COM_STMT_RESET and after each execute
    pub fn clear_long_data(&mut self, statement_id: u32) {
        if let Some(state) = self.statements.get_mut(&statement_id) {
            state.long_data.clear();
        }
    }

    /// COM_RESET_CONNECTION: end the transaction and forget prepared statements.
    /// Returns the ids of the forgotten statements.
    pub fn reset(&mut self) -> Vec<u32> {
        self.status_flags
            .remove(ServerStatusFlags::SERVER_STATUS_IN_TRANS);
        self.multi_statements = self
            .capabilities
            .contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS);
        self.statements.drain().map(|(id, _)| id).collect()
    }
}

//! Command-phase state machine of one client connection.
//!
//! [`Dispatcher`] performs no I/O: the server reads a packet, hands its payload to
//! [`Dispatcher::handle_packet`] and flushes whatever framed packets were appended to `out`.

use std::collections::HashMap;

use crate::connections::ConnHandle;
use crate::constant::{
    AUTH_PLUGIN_DATA_LEN, CAPABILITIES_SERVER_DEFAULT, CapabilityFlags, CommandByte,
    ResultsetMetadata, ServerStatusFlags,
};
use crate::error::{
    ER_CON_COUNT_ERROR, ER_CONNECTION_KILLED, ER_HANDSHAKE_ERROR, ER_NO_SUCH_THREAD, Error,
    Result, SQLSTATE_COMMUNICATION, SQLSTATE_CONNECTION_REJECTED, SQLSTATE_GENERAL,
    SQLSTATE_INTERRUPTED,
};
use crate::handler::{CommandHandler, ResultWriter};
use crate::protocol::command::prepared::{
    ComStmtClose, ComStmtExecute, ComStmtPrepare, ComStmtReset, ComStmtSendLongData,
    ExecuteContext, StmtPrepareResponse, read_statement_id,
};
use crate::protocol::command::query::ComQuery;
use crate::protocol::command::resultset::{RowFormat, write_field_list, write_resultset};
use crate::protocol::command::utility::{ComFieldList, ComInitDb, ComProcessKill, ComSetOption};
use crate::protocol::command::{Command, read_command};
use crate::protocol::connection::{Handshake, HandshakeConfig, HandshakeResult};
use crate::protocol::packet::{PacketWriter, SequenceId};
use crate::protocol::response::{ErrPayload, OkPayload, write_terminator};
use crate::session::Session;
use crate::sql::ResultSet;

/// What the server does after flushing `out`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Read the next packet
    Continue,
    /// Upgrade the stream to TLS, call [`Dispatcher::tls_established`], then read the next packet
    UpgradeTls,
    /// Close the connection
    Close,
}

enum Phase {
    Handshake(Handshake),
    Command(Session),
    Closed,
}

/// Drives one connection from the initial handshake to COM_QUIT
pub struct Dispatcher<H: CommandHandler> {
    handler: H,
    conn: ConnHandle,
    phase: Phase,
    server_capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
    scramble: [u8; AUTH_PLUGIN_DATA_LEN],
}

impl<H: CommandHandler> Dispatcher<H> {
    /// `config.connection_id` is replaced by the id of `conn`
    pub fn new(handler: H, conn: ConnHandle, mut config: HandshakeConfig) -> Self {
        config.connection_id = conn.id();
        Self {
            handler,
            server_capabilities: config.server_capabilities(),
            status_flags: config.status_flags,
            scramble: config.auth_plugin_data,
            conn,
            phase: Phase::Handshake(Handshake::new(config)),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.conn.id()
    }

    /// The command-phase session, once the handshake has succeeded
    pub fn session(&self) -> Option<&Session> {
        match &self.phase {
            Phase::Command(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Append the initial handshake packet (sequence id 0) to `out`
    pub fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let Phase::Handshake(handshake) = &mut self.phase else {
            return Err(Error::LibraryBug(crate::error::eyre!(
                "start() called after the handshake"
            )));
        };
        let HandshakeResult::Write(payload) = handshake.drive(&[])? else {
            return Err(Error::LibraryBug(crate::error::eyre!(
                "handshake did not start with the initial packet"
            )));
        };
        PacketWriter::new(out, SequenceId::default()).write_payload(&payload)
    }

    /// Continue the handshake after the stream was upgraded to TLS
    pub fn tls_established(&mut self) -> Result<()> {
        match &mut self.phase {
            Phase::Handshake(handshake) => handshake.drive_after_tls(),
            _ => Err(Error::LibraryBug(crate::error::eyre!(
                "tls_established() called outside of the handshake"
            ))),
        }
    }

    /// Handle one client packet, appending the framed response to `out`
    pub fn handle_packet(
        &mut self,
        sequence_id: u8,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<DispatchResult> {
        let mut writer = PacketWriter::new(out, SequenceId::new(sequence_id).next());
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Handshake(handshake) => self.handshake(handshake, payload, &mut writer),
            Phase::Command(mut session) => {
                let result = self.command(&mut session, payload, &mut writer);
                self.phase = Phase::Command(session);
                if result == DispatchResult::Close {
                    self.close();
                }
                Ok(result)
            }
            Phase::Closed => Err(Error::LibraryBug(crate::error::eyre!(
                "packet received on a closed connection"
            ))),
        }
    }

    /// Release every statement the connection still owns
    pub fn close(&mut self) {
        if let Phase::Command(session) = &mut self.phase {
            for statement_id in session.statement_ids() {
                self.handler.close_statement(session, statement_id);
            }
            tracing::debug!(connection_id = self.conn.id(), "connection closed");
        }
        self.phase = Phase::Closed;
    }

    fn handshake(
        &mut self,
        mut handshake: Handshake,
        payload: &[u8],
        writer: &mut PacketWriter<'_>,
    ) -> Result<DispatchResult> {
        let result = match handshake.drive(payload) {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(connection_id = self.conn.id(), %err, "handshake failed");
                let err = match err {
                    Error::InvalidPacket | Error::UnexpectedEof => {
                        ErrPayload::new(ER_HANDSHAKE_ERROR, SQLSTATE_COMMUNICATION, "Bad handshake")
                    }
                    other => other.to_err_payload(),
                };
                write_err(writer, &err, self.server_capabilities)?;
                return Ok(DispatchResult::Close);
            }
        };

        match result {
            HandshakeResult::Write(payload) => {
                writer.write_payload(&payload)?;
                self.phase = Phase::Handshake(handshake);
                Ok(DispatchResult::Continue)
            }
            HandshakeResult::UpgradeTls(request) => {
                tracing::debug!(
                    connection_id = self.conn.id(),
                    capabilities = ?request.capability_flags,
                    "upgrading to TLS"
                );
                self.phase = Phase::Handshake(handshake);
                Ok(DispatchResult::UpgradeTls)
            }
            HandshakeResult::Established {
                response,
                capability_flags,
            } => {
                let mut session = Session::from_handshake(
                    self.conn.id(),
                    &response,
                    capability_flags,
                    self.status_flags,
                );
                if let Err(err) = self
                    .handler
                    .authenticate(&mut session, &response, &self.scramble)
                {
                    tracing::debug!(
                        connection_id = self.conn.id(),
                        username = %response.username,
                        %err,
                        "authentication rejected"
                    );
                    write_err(writer, &err.to_err_payload(), capability_flags)?;
                    return Ok(DispatchResult::Close);
                }
                write_ok(writer, &OkPayload::new(session.status_flags()), capability_flags)?;
                tracing::debug!(
                    connection_id = self.conn.id(),
                    username = %session.username(),
                    database = ?session.database(),
                    "connection established"
                );
                self.phase = Phase::Command(session);
                Ok(DispatchResult::Continue)
            }
        }
    }

    /// Run one command. Errors become ERR packets; fatal ones also close the connection.
    fn command(
        &self,
        session: &mut Session,
        payload: &[u8],
        writer: &mut PacketWriter<'_>,
    ) -> DispatchResult {
        let capabilities = session.capabilities();
        if self.conn.info().is_killed() {
            let err = ErrPayload::new(
                ER_CONNECTION_KILLED,
                SQLSTATE_INTERRUPTED,
                "Connection was killed",
            );
            tracing::debug!(connection_id = self.conn.id(), "rejecting command on killed connection");
            if let Err(failure) = write_err(writer, &err, capabilities) {
                tracing::debug!(connection_id = self.conn.id(), %failure, "failed to report kill");
            }
            return DispatchResult::Close;
        }

        let mark = writer.mark();
        match self.run_command(session, payload, writer) {
            Ok(result) => result,
            Err(err) => {
                let fatal = err.is_fatal();
                if fatal {
                    tracing::warn!(connection_id = self.conn.id(), %err, "closing connection");
                    writer.rollback(mark);
                } else {
                    tracing::debug!(connection_id = self.conn.id(), %err, "command failed");
                }
                if write_err(writer, &err.to_err_payload(), capabilities).is_err() || fatal {
                    DispatchResult::Close
                } else {
                    DispatchResult::Continue
                }
            }
        }
    }

    fn run_command(
        &self,
        session: &mut Session,
        payload: &[u8],
        writer: &mut PacketWriter<'_>,
    ) -> Result<DispatchResult> {
        let command = read_command(payload)?;
        let capabilities = session.capabilities();
        tracing::trace!(connection_id = self.conn.id(), command = ?command.byte, "command");

        match command.byte {
            CommandByte::Quit => return Ok(DispatchResult::Close),
            CommandByte::Ping => {
                write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
            }
            CommandByte::InitDb => {
                let init_db = ComInitDb::read(payload)?;
                self.handler.init_db(session, &init_db.schema)?;
                write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
            }
            CommandByte::Query => {
                let query = ComQuery::read(payload, capabilities)?;
                let mut results = Results::new(writer, capabilities, RowFormat::Text);
                self.handler.handle_query(session, &query, &mut results)?;
                results.finish(session.status_flags())?;
            }
            CommandByte::FieldList => {
                let field_list = ComFieldList::read(payload)?;
                let columns =
                    self.handler
                        .field_list(session, &field_list.table, &field_list.wildcard)?;
                atomically(writer, |writer| {
                    write_field_list(writer, &columns, capabilities, session.status_flags())
                })?;
            }
            CommandByte::Statistics => {
                let statistics = self.handler.statistics(session);
                writer.write_payload(statistics.as_bytes())?;
            }
            CommandByte::SetOption => {
                let option = ComSetOption::read(payload)?;
                session.set_multi_statements(option == ComSetOption::MultiStatementsOn);
                write_eof(writer, capabilities, session.status_flags())?;
            }
            CommandByte::Debug => write_eof(writer, capabilities, session.status_flags())?,
            CommandByte::ResetConnection => {
                for statement_id in session.statement_ids() {
                    self.handler.close_statement(session, statement_id);
                }
                session.reset();
                write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
            }
            CommandByte::ProcessKill => return self.process_kill(session, payload, writer),
            CommandByte::StmtPrepare => {
                let prepare = ComStmtPrepare::read(payload)?;
                let statement = self.handler.prepare_statement(session, &prepare.sql)?;
                let response = StmtPrepareResponse {
                    statement_id: statement.id,
                    warning_count: 0,
                    metadata: ResultsetMetadata::Full,
                    params: statement.params.clone(),
                    columns: statement.columns.clone(),
                };
                let written = atomically(writer, |writer| {
                    response.write(writer, capabilities, session.status_flags())
                });
                if let Err(err) = written {
                    self.handler.close_statement(session, statement.id);
                    return Err(err);
                }
            }
            CommandByte::StmtExecute => self.execute(session, &command, writer)?,
            CommandByte::StmtSendLongData => {
                let long_data = ComStmtSendLongData::read(payload)?;
                session.append_long_data(
                    long_data.statement_id,
                    long_data.param_id,
                    &long_data.data,
                );
            }
            CommandByte::StmtClose => {
                let close = ComStmtClose::read(payload)?;
                self.handler.close_statement(session, close.statement_id);
            }
            CommandByte::StmtReset => {
                let reset = ComStmtReset::read(payload)?;
                self.handler.reset_statement(session, reset.statement_id)?;
                write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
            }
            other => return Err(Error::UnknownCommand(other as u8)),
        }
        Ok(DispatchResult::Continue)
    }

    fn execute(
        &self,
        session: &mut Session,
        command: &Command<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> Result<()> {
        let statement_id = read_statement_id(command.payload)?;
        let statement = self.handler.statement(session, statement_id)?;

        let no_long_data = HashMap::new();
        let execute = ComStmtExecute::read(
            command.payload,
            &ExecuteContext {
                capabilities: session.capabilities(),
                num_params: statement.num_params(),
                bound_types: session.bound_types(statement_id),
                long_data: session.long_data(statement_id).unwrap_or(&no_long_data),
            },
        )?;
        if execute.new_params_bound {
            session.set_bound_types(statement_id, execute.param_types());
        }
        session.clear_long_data(statement_id);
        if execute.flags & 0x07 != 0 {
            tracing::trace!(statement_id, flags = execute.flags, "cursor requested, sending rows");
        }

        let mut results = Results::new(writer, session.capabilities(), RowFormat::Binary);
        self.handler
            .execute_statement(session, &statement, &execute.params, &mut results)?;
        results.finish(session.status_flags())
    }

    fn process_kill(
        &self,
        session: &Session,
        payload: &[u8],
        writer: &mut PacketWriter<'_>,
    ) -> Result<DispatchResult> {
        let kill = ComProcessKill::read(payload)?;
        let capabilities = session.capabilities();
        if kill.connection_id == self.conn.id() {
            self.conn.info().kill();
            write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
            return Ok(DispatchResult::Close);
        }
        if !self.conn.registry().kill(kill.connection_id) {
            return Err(Error::sql(
                ER_NO_SUCH_THREAD,
                SQLSTATE_GENERAL,
                format!("Unknown thread id: {}", kill.connection_id),
            ));
        }
        tracing::debug!(
            connection_id = self.conn.id(),
            target = kill.connection_id,
            "connection killed"
        );
        write_ok(writer, &OkPayload::new(session.status_flags()), capabilities)?;
        Ok(DispatchResult::Continue)
    }
}

impl<H: CommandHandler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frames statement results: an OK packet for results without columns, a resultset otherwise.
///
/// A result is either written whole or not at all, so an error after some results still
/// leaves a well-formed response for the ERR packet to follow.
struct Results<'w, 'a> {
    writer: &'w mut PacketWriter<'a>,
    capabilities: CapabilityFlags,
    format: RowFormat,
    written: usize,
}

impl<'w, 'a> Results<'w, 'a> {
    fn new(
        writer: &'w mut PacketWriter<'a>,
        capabilities: CapabilityFlags,
        format: RowFormat,
    ) -> Self {
        Self {
            writer,
            capabilities,
            format,
            written: 0,
        }
    }

    /// A handler that produced nothing still answers with OK
    fn finish(self, status_flags: ServerStatusFlags) -> Result<()> {
        if self.written == 0 {
            write_ok(self.writer, &OkPayload::new(status_flags), self.capabilities)?;
        }
        Ok(())
    }
}

impl ResultWriter for Results<'_, '_> {
    fn write_result(&mut self, result: &ResultSet, status_flags: ServerStatusFlags) -> Result<()> {
        let capabilities = self.capabilities;
        let format = self.format;
        atomically(self.writer, |writer| {
            if result.columns.is_empty() {
                let ok = OkPayload {
                    affected_rows: result.rows_affected,
                    last_insert_id: result.last_insert_id,
                    info: result.info.clone(),
                    ..OkPayload::new(status_flags)
                };
                write_ok(writer, &ok, capabilities)
            } else {
                write_resultset(
                    writer,
                    format,
                    &result.columns,
                    &result.rows,
                    capabilities,
                    status_flags,
                )
            }
        })?;
        self.written += 1;
        Ok(())
    }
}

/// ERR packet sent in place of the initial handshake when the server is full
pub fn write_too_many_connections(out: &mut Vec<u8>) -> Result<()> {
    let err = ErrPayload::new(
        ER_CON_COUNT_ERROR,
        SQLSTATE_CONNECTION_REJECTED,
        "Too many connections",
    );
    write_err(
        &mut PacketWriter::new(out, SequenceId::default()),
        &err,
        CAPABILITIES_SERVER_DEFAULT,
    )
}

/// Run `f`, discarding every packet it wrote if it fails
fn atomically<'a, F>(writer: &mut PacketWriter<'a>, f: F) -> Result<()>
where
    F: FnOnce(&mut PacketWriter<'a>) -> Result<()>,
{
    let mark = writer.mark();
    let written = f(writer);
    if written.is_err() {
        writer.rollback(mark);
    }
    written
}

fn write_ok(
    writer: &mut PacketWriter<'_>,
    ok: &OkPayload,
    capabilities: CapabilityFlags,
) -> Result<()> {
    writer.write(|out| {
        ok.write(out, capabilities);
        Ok(())
    })
}

fn write_err(
    writer: &mut PacketWriter<'_>,
    err: &ErrPayload,
    capabilities: CapabilityFlags,
) -> Result<()> {
    writer.write(|out| {
        err.write(out, capabilities);
        Ok(())
    })
}

fn write_eof(
    writer: &mut PacketWriter<'_>,
    capabilities: CapabilityFlags,
    status_flags: ServerStatusFlags,
) -> Result<()> {
    writer.write(|out| {
        write_terminator(out, capabilities, status_flags, 0);
        Ok(())
    })
}

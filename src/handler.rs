use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use auto_impl::auto_impl;

use crate::constant::ServerStatusFlags;
use crate::error::{
    ER_BAD_FIELD_ERROR, ER_EMPTY_QUERY, ER_PARSE_ERROR, Error, Result, SQLSTATE_BAD_FIELD,
    SQLSTATE_SYNTAX,
};
use crate::prepared::{PreparedStatement, StatementRegistry};
use crate::protocol::command::ColumnDefinition;
use crate::protocol::command::query::ComQuery;
use crate::protocol::connection::HandshakeResponse41;
use crate::protocol::value::Parameter;
use crate::session::Session;
use crate::sql::{ResultSet, SqlExecutor, SqlParser, Statement, StatementKind};

/// Receives statement results as they are produced; the dispatcher frames them as OK
/// packets or resultsets.
pub trait ResultWriter {
    /// `status_flags` carries `SERVER_MORE_RESULTS_EXISTS` when another result follows
    fn write_result(&mut self, result: &ResultSet, status_flags: ServerStatusFlags) -> Result<()>;
}

/// What a connection asks of its host, one method per command.
///
/// Errors returned here become ERR packets unless [`Error::is_fatal`] says otherwise.
#[auto_impl(&, Box, Arc)]
pub trait CommandHandler: Send + Sync {
    /// Accept or reject the client. Only the framing of the auth data is handled by the
    /// engine; the default accepts everyone.
    fn authenticate(
        &self,
        _session: &mut Session,
        _response: &HandshakeResponse41,
        _scramble: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    /// COM_QUERY. Several statements produce several results.
    fn handle_query(
        &self,
        session: &mut Session,
        query: &ComQuery,
        out: &mut dyn ResultWriter,
    ) -> Result<()>;

    /// COM_STMT_PREPARE
    fn prepare_statement(&self, session: &mut Session, sql: &str)
    -> Result<Arc<PreparedStatement>>;

    /// Look up a statement prepared on this connection
    fn statement(&self, session: &Session, statement_id: u32) -> Result<Arc<PreparedStatement>>;

    /// COM_STMT_EXECUTE with its decoded parameters
    fn execute_statement(
        &self,
        session: &mut Session,
        statement: &PreparedStatement,
        params: &[Parameter],
        out: &mut dyn ResultWriter,
    ) -> Result<()>;

    /// COM_STMT_CLOSE; closing an unknown id does nothing
    fn close_statement(&self, session: &mut Session, statement_id: u32);

    /// COM_STMT_RESET
    fn reset_statement(&self, session: &mut Session, statement_id: u32) -> Result<()> {
        self.statement(session, statement_id)?;
        session.clear_long_data(statement_id);
        Ok(())
    }

    /// COM_INIT_DB
    fn init_db(&self, session: &mut Session, schema: &str) -> Result<()>;

    /// COM_FIELD_LIST
    fn field_list(
        &self,
        session: &mut Session,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>>;

    /// COM_STATISTICS
    fn statistics(&self, _session: &Session) -> String {
        String::new()
    }
}

/// Turns parser failures into the error sent to the client
#[auto_impl(&, Box, Arc)]
pub trait ParseErrorHandler: Send + Sync {
    fn handle(&self, sql: &str, error: Error) -> Error;
}

/// Reports every parse failure as `ER_PARSE_ERROR (1064, 42000)`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultParseErrorHandler;

impl ParseErrorHandler for DefaultParseErrorHandler {
    fn handle(&self, sql: &str, error: Error) -> Error {
        tracing::debug!(%sql, %error, "query failed to parse");
        let detail = match error {
            Error::ServerError(err) => err.message,
            other => other.to_string(),
        };
        Error::sql(
            ER_PARSE_ERROR,
            SQLSTATE_SYNTAX,
            format!("You have an error in your SQL syntax; {detail}"),
        )
    }
}

/// [`CommandHandler`] over an [`SqlParser`] and an [`SqlExecutor`]
pub struct Engine<P, E, H = DefaultParseErrorHandler> {
    parser: P,
    executor: E,
    parse_errors: H,
    registry: Arc<StatementRegistry>,
    started: Instant,
    questions: AtomicU64,
}

impl<P: SqlParser, E: SqlExecutor> Engine<P, E> {
    pub fn new(parser: P, executor: E) -> Self {
        Self {
            parser,
            executor,
            parse_errors: DefaultParseErrorHandler,
            registry: Arc::new(StatementRegistry::new()),
            started: Instant::now(),
            questions: AtomicU64::new(0),
        }
    }
}

impl<P: SqlParser, E: SqlExecutor, H: ParseErrorHandler> Engine<P, E, H> {
    pub fn with_parse_error_handler<H2: ParseErrorHandler>(self, handler: H2) -> Engine<P, E, H2> {
        Engine {
            parser: self.parser,
            executor: self.executor,
            parse_errors: handler,
            registry: self.registry,
            started: self.started,
            questions: self.questions,
        }
    }

    /// Share a statement registry with other engines
    pub fn with_registry(mut self, registry: Arc<StatementRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<StatementRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        self.parser
            .parse(sql)
            .map_err(|err| self.parse_errors.handle(sql, err))
    }

    fn run(
        &self,
        session: &mut Session,
        statements: &[Statement],
        out: &mut dyn ResultWriter,
    ) -> Result<()> {
        let last = statements.len().saturating_sub(1);
        for (idx, statement) in statements.iter().enumerate() {
            tracing::trace!(kind = ?statement.kind, sql = %statement.sql, "executing");
            let result = self.executor.execute(session, statement)?;
            let mut status_flags = session.status_flags();
            if idx < last {
                status_flags |= ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS;
            }
            out.write_result(&result, status_flags)?;
        }
        Ok(())
    }

    /// Definitions of the columns a prepared statement will return
    fn describe_columns(
        &self,
        session: &Session,
        statement: &Statement,
    ) -> Result<Vec<ColumnDefinition>> {
        if statement.kind != StatementKind::Select || statement.tables.is_empty() {
            return Ok(Vec::new());
        }
        let mut available = Vec::new();
        for table in &statement.tables {
            available.extend(self.executor.table_columns(session, table)?);
        }
        if statement.projects_all_columns() {
            return Ok(available);
        }
        statement
            .projection
            .iter()
            .map(|name| {
                available
                    .iter()
                    .find(|column| column.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| {
                        Error::sql(
                            ER_BAD_FIELD_ERROR,
                            SQLSTATE_BAD_FIELD,
                            format!("Unknown column '{name}' in 'field list'"),
                        )
                    })
            })
            .collect()
    }
}

impl<P: SqlParser, E: SqlExecutor, H: ParseErrorHandler> CommandHandler for Engine<P, E, H> {
    fn handle_query(
        &self,
        session: &mut Session,
        query: &ComQuery,
        out: &mut dyn ResultWriter,
    ) -> Result<()> {
        self.questions.fetch_add(1, Ordering::Relaxed);
        if !query.attributes.is_empty() {
            tracing::trace!(count = query.attributes.len(), "query attributes ignored");
        }

        let statements = self.parse(&query.sql)?;
        if statements.is_empty() {
            return Err(Error::sql(ER_EMPTY_QUERY, SQLSTATE_SYNTAX, "Query was empty"));
        }
        if statements.len() > 1 && !session.multi_statements() {
            return Err(self.parse_errors.handle(
                &query.sql,
                Error::sql(
                    ER_PARSE_ERROR,
                    SQLSTATE_SYNTAX,
                    "multiple statements are not enabled on this connection",
                ),
            ));
        }
        self.run(session, &statements, out)
    }

    fn prepare_statement(
        &self,
        session: &mut Session,
        sql: &str,
    ) -> Result<Arc<PreparedStatement>> {
        let mut statements = self.parse(sql)?;
        let statement = match statements.len() {
            0 => return Err(Error::sql(ER_EMPTY_QUERY, SQLSTATE_SYNTAX, "Query was empty")),
            1 => statements.remove(0),
            _ => {
                return Err(self.parse_errors.handle(
                    sql,
                    Error::sql(
                        ER_PARSE_ERROR,
                        SQLSTATE_SYNTAX,
                        "a prepared statement must contain a single statement",
                    ),
                ));
            }
        };

        let columns = self.describe_columns(session, &statement)?;
        let params = vec![ColumnDefinition::param(); statement.placeholders];
        let id = self.registry.next_statement_id()?;
        let prepared = self.registry.register(PreparedStatement {
            id,
            query: sql.to_string(),
            statement,
            params,
            columns,
        });
        session.track_statement(id);
        tracing::debug!(
            statement_id = id,
            params = prepared.params.len(),
            columns = prepared.columns.len(),
            "statement prepared"
        );
        Ok(prepared)
    }

    fn statement(&self, session: &Session, statement_id: u32) -> Result<Arc<PreparedStatement>> {
        if !session.owns_statement(statement_id) {
            return Err(Error::StatementNotFound(statement_id));
        }
        self.registry.get(statement_id)
    }

    fn execute_statement(
        &self,
        session: &mut Session,
        statement: &PreparedStatement,
        params: &[Parameter],
        out: &mut dyn ResultWriter,
    ) -> Result<()> {
        self.questions.fetch_add(1, Ordering::Relaxed);
        let bound = if statement.statement.placeholders == 0 && params.is_empty() {
            statement.statement.clone()
        } else {
            let values = params
                .iter()
                .map(Parameter::value)
                .collect::<Result<Vec<_>>>()?;
            self.parser.bind(&statement.statement, &values)?
        };
        self.run(session, std::slice::from_ref(&bound), out)
    }

    fn close_statement(&self, session: &mut Session, statement_id: u32) {
        if session.owns_statement(statement_id) {
            self.registry.remove(statement_id);
            session.forget_statement(statement_id);
        }
    }

    fn init_db(&self, session: &mut Session, schema: &str) -> Result<()> {
        let statement =
            Statement::new(StatementKind::Use, format!("USE `{schema}`")).with_database(schema);
        self.executor.use_database(session, &statement)?;
        Ok(())
    }

    fn field_list(
        &self,
        session: &mut Session,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>> {
        let schema = session.database().unwrap_or_default().to_string();
        Ok(self
            .executor
            .table_columns(session, table)?
            .into_iter()
            .filter(|column| like(wildcard, &column.name))
            .map(|column| column.with_table(&schema, table))
            .collect())
    }

    fn statistics(&self, _session: &Session) -> String {
        format!(
            "Uptime: {}  Questions: {}  Prepared statements: {}",
            self.started.elapsed().as_secs(),
            self.questions.load(Ordering::Relaxed),
            self.registry.len()
        )
    }
}

/// SQL `LIKE` with `%` and `_`, case-insensitive; an empty pattern matches everything.
///
/// Greedy two-pointer match: on a mismatch, resume after the last `%` with one more text
/// character consumed by it.
pub(crate) fn like(pattern: &str, text: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern = pattern.chars().collect::<Vec<_>>();
    let text = text.chars().collect::<Vec<_>>();

    let (mut p, mut t) = (0, 0);
    // (pattern index after the last `%`, text index it resumes from)
    let mut resume: Option<(usize, usize)> = None;
    while let Some(&ch) = text.get(t) {
        match pattern.get(p) {
            Some('%') => {
                p += 1;
                resume = Some((p, t));
            }
            Some('_') => {
                p += 1;
                t += 1;
            }
            Some(c) if c.eq_ignore_ascii_case(&ch) => {
                p += 1;
                t += 1;
            }
            _ => match resume {
                Some((after_percent, from)) => {
                    p = after_percent;
                    t = from + 1;
                    resume = Some((after_percent, t));
                }
                None => return false,
            },
        }
    }
    pattern.iter().skip(p).all(|&c| c == '%')
}

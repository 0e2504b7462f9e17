//! Interfaces to the SQL layer the protocol engine delegates to.
//!
//! The engine never interprets SQL itself: a [`SqlParser`] turns query text into typed
//! [`Statement`]s and a [`SqlExecutor`] runs them, producing a [`ResultSet`].

use std::iter::Peekable;
use std::str::Chars;

use auto_impl::auto_impl;

use crate::constant::ServerStatusFlags;
use crate::error::{
    ER_NO_DB_ERROR, ER_NO_SUCH_TABLE, ER_NOT_SUPPORTED_YET, ER_WRONG_ARGUMENTS, Error, Result,
    SQLSTATE_GENERAL, SQLSTATE_NO_DB, SQLSTATE_NO_SUCH_TABLE, SQLSTATE_SYNTAX,
};
use crate::protocol::command::ColumnDefinition;
pub use crate::protocol::command::resultset::TextRow;
use crate::protocol::value::Value;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    CreateDatabase,
    DropDatabase,
    CreateTable,
    DropTable,
    AlterTable,
    ShowDatabases,
    ShowTables,
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Use,
    Set,
    Other,
}

/// A parsed statement as handed to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    /// Tables the statement reads or writes, in order of appearance
    pub tables: Vec<String>,
    /// Selected column names; empty or `*` selects every column
    pub projection: Vec<String>,
    /// Number of `?` placeholders
    pub placeholders: usize,
    /// Target schema of `USE`, `CREATE DATABASE` and `DROP DATABASE`
    pub database: Option<String>,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            tables: Vec::new(),
            projection: Vec::new(),
            placeholders: 0,
            database: None,
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_projection<I, S>(mut self, projection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = projection.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_placeholders(mut self, placeholders: usize) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn projects_all_columns(&self) -> bool {
        self.projection.is_empty() || self.projection.iter().any(|c| c == "*")
    }
}

/// Outcome of one statement. Empty `columns` is answered with an OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<TextRow>,
    pub rows_affected: u64,
    pub last_insert_id: u64,
    pub info: String,
}

impl ResultSet {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn rows(columns: Vec<ColumnDefinition>, rows: Vec<TextRow>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    pub fn with_last_insert_id(mut self, last_insert_id: u64) -> Self {
        self.last_insert_id = last_insert_id;
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

#[auto_impl(&, Box, Arc)]
pub trait SqlParser: Send + Sync {
    /// Split query text into its statements
    fn parse(&self, sql: &str) -> Result<Vec<Statement>>;

    /// Produce the executable statement for one execution of a prepared statement.
    ///
    /// The default substitutes the values as literals for the `?` placeholders and
    /// parses the result again.
    fn bind(&self, statement: &Statement, params: &[Value]) -> Result<Statement> {
        let sql = substitute_placeholders(&statement.sql, params)?;
        let mut statements = self.parse(&sql)?;
        match statements.len() {
            1 => Ok(statements.remove(0)),
            _ => Err(Error::sql(
                ER_WRONG_ARGUMENTS,
                SQLSTATE_GENERAL,
                "Bound statement does not parse into a single statement",
            )),
        }
    }
}

/// Executes parsed statements against some backend.
///
/// Every statement kind has its own method; only `table_columns` and `select` must be
/// provided. The transaction methods and `use_database` update the session by default.
#[auto_impl(&, Box, Arc)]
pub trait SqlExecutor: Send + Sync {
    /// Column definitions of `table`, used to describe prepared statements and COM_FIELD_LIST
    fn table_columns(&self, session: &Session, table: &str) -> Result<Vec<ColumnDefinition>>;

    fn select(&self, session: &mut Session, statement: &Statement) -> Result<ResultSet>;

    fn create_database(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn drop_database(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn create_table(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn drop_table(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn alter_table(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn show_databases(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn show_tables(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn insert(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn update(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn delete(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    fn begin(&self, session: &mut Session, _statement: &Statement) -> Result<ResultSet> {
        session.insert_status(ServerStatusFlags::SERVER_STATUS_IN_TRANS);
        Ok(ResultSet::default())
    }

    fn commit(&self, session: &mut Session, _statement: &Statement) -> Result<ResultSet> {
        session.remove_status(ServerStatusFlags::SERVER_STATUS_IN_TRANS);
        Ok(ResultSet::default())
    }

    fn rollback(&self, session: &mut Session, _statement: &Statement) -> Result<ResultSet> {
        session.remove_status(ServerStatusFlags::SERVER_STATUS_IN_TRANS);
        Ok(ResultSet::default())
    }

    fn use_database(&self, session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        let database = statement
            .database
            .clone()
            .ok_or_else(|| Error::sql(ER_NO_DB_ERROR, SQLSTATE_NO_DB, "No database selected"))?;
        session.set_database(Some(database));
        Ok(ResultSet::default())
    }

    fn set_variable(&self, _session: &mut Session, _statement: &Statement) -> Result<ResultSet> {
        Ok(ResultSet::default())
    }

    fn other(&self, _session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        Err(not_supported(statement))
    }

    /// Route a statement to the method for its kind
    fn execute(&self, session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        match statement.kind {
            StatementKind::CreateDatabase => self.create_database(session, statement),
            StatementKind::DropDatabase => self.drop_database(session, statement),
            StatementKind::CreateTable => self.create_table(session, statement),
            StatementKind::DropTable => self.drop_table(session, statement),
            StatementKind::AlterTable => self.alter_table(session, statement),
            StatementKind::ShowDatabases => self.show_databases(session, statement),
            StatementKind::ShowTables => self.show_tables(session, statement),
            StatementKind::Select => self.select(session, statement),
            StatementKind::Insert => self.insert(session, statement),
            StatementKind::Update => self.update(session, statement),
            StatementKind::Delete => self.delete(session, statement),
            StatementKind::Begin => self.begin(session, statement),
            StatementKind::Commit => self.commit(session, statement),
            StatementKind::Rollback => self.rollback(session, statement),
            StatementKind::Use => self.use_database(session, statement),
            StatementKind::Set => self.set_variable(session, statement),
            StatementKind::Other => self.other(session, statement),
        }
    }
}

fn not_supported(statement: &Statement) -> Error {
    Error::sql(
        ER_NOT_SUPPORTED_YET,
        SQLSTATE_SYNTAX,
        format!("This version doesn't yet support '{}'", statement.sql),
    )
}

/// Error for a table the executor does not know
pub fn no_such_table(session: &Session, table: &str) -> Error {
    let qualified = match session.database() {
        Some(db) => format!("{db}.{table}"),
        None => table.to_string(),
    };
    Error::sql(
        ER_NO_SUCH_TABLE,
        SQLSTATE_NO_SUCH_TABLE,
        format!("Table '{qualified}' doesn't exist"),
    )
}

/// Replace each `?` outside quotes, backticks and comments with the next value as an SQL literal
pub fn substitute_placeholders(sql: &str, params: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut params = params.iter();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '-' if starts_line_comment(&chars) => {
                    out.push(c);
                    copy_line(&mut chars, &mut out);
                }
                '#' => {
                    out.push(c);
                    copy_line(&mut chars, &mut out);
                }
                '/' if chars.peek() == Some(&'*') => {
                    out.push(c);
                    out.extend(chars.next());
                    let mut prev = None;
                    for inner in chars.by_ref() {
                        out.push(inner);
                        if prev == Some('*') && inner == '/' {
                            break;
                        }
                        prev = Some(inner);
                    }
                }
                '?' => {
                    let value = params.next().ok_or_else(wrong_argument_count)?;
                    out.push_str(&value.to_sql_literal());
                }
                c => out.push(c),
            },
        }
    }

    if params.next().is_some() {
        return Err(wrong_argument_count());
    }
    Ok(out)
}

/// `--` opens a comment only when followed by whitespace or the end of input
fn starts_line_comment(chars: &Peekable<Chars<'_>>) -> bool {
    let mut ahead = chars.clone();
    ahead.next() == Some('-') && ahead.next().is_none_or(char::is_whitespace)
}

fn copy_line(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    for c in chars.by_ref() {
        out.push(c);
        if c == '\n' {
            break;
        }
    }
}

fn wrong_argument_count() -> Error {
    Error::sql(
        ER_WRONG_ARGUMENTS,
        SQLSTATE_GENERAL,
        "Incorrect arguments to mysqld_stmt_execute",
    )
}

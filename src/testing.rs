//! In-memory SQL layer for unit tests: one `users` table and a keyword parser.

use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{ER_PARSE_ERROR, Error, Result, SQLSTATE_SYNTAX};
use crate::handler::Engine;
use crate::protocol::command::ColumnDefinition;
use crate::session::Session;
use crate::sql::{
    ResultSet, SqlExecutor, SqlParser, Statement, StatementKind, TextRow, no_such_table,
};

pub struct KeywordParser;

impl SqlParser for KeywordParser {
    fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        sql.split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(parse_one)
            .collect()
    }
}

fn parse_one(sql: &str) -> Result<Statement> {
    let words = sql.split_whitespace().collect::<Vec<_>>();
    let upper = words
        .iter()
        .map(|w| w.to_ascii_uppercase())
        .collect::<Vec<_>>();
    let kind = match upper.first().map(String::as_str) {
        Some("SELECT") => StatementKind::Select,
        Some("INSERT") => StatementKind::Insert,
        Some("UPDATE") => StatementKind::Update,
        Some("DELETE") => StatementKind::Delete,
        Some("BEGIN") => StatementKind::Begin,
        Some("COMMIT") => StatementKind::Commit,
        Some("ROLLBACK") => StatementKind::Rollback,
        Some("USE") => StatementKind::Use,
        Some("SET") => StatementKind::Set,
        Some("CREATE") if upper.get(1).map(String::as_str) == Some("DATABASE") => {
            StatementKind::CreateDatabase
        }
        _ => {
            return Err(Error::sql(
                ER_PARSE_ERROR,
                SQLSTATE_SYNTAX,
                format!("near '{sql}' at line 1"),
            ));
        }
    };

    let mut statement =
        Statement::new(kind, sql).with_placeholders(sql.chars().filter(|c| *c == '?').count());
    match kind {
        StatementKind::Select => {
            let from = upper.iter().position(|w| w == "FROM");
            let projection = words[1..from.unwrap_or(words.len())]
                .join(" ")
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>();
            statement = statement.with_projection(projection);
            if let Some(table) = from.and_then(|idx| words.get(idx + 1)) {
                statement = statement.with_tables([*table]);
            }
        }
        StatementKind::Insert => {
            if let Some(table) = words.get(2) {
                statement = statement.with_tables([*table]);
            }
        }
        StatementKind::Use => {
            if let Some(db) = words.get(1) {
                statement = statement.with_database(db.trim_matches('`'));
            }
        }
        _ => {}
    }
    Ok(statement)
}

/// `users(id INT NOT NULL PRIMARY KEY, name VARCHAR, created DATETIME)` with two rows
pub struct UsersExecutor;

pub fn users_columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new("id", ColumnType::MYSQL_TYPE_LONG)
            .with_flags(ColumnFlags::NOT_NULL_FLAG | ColumnFlags::PRI_KEY_FLAG),
        ColumnDefinition::new("name", ColumnType::MYSQL_TYPE_VAR_STRING),
        ColumnDefinition::new("created", ColumnType::MYSQL_TYPE_DATETIME),
    ]
}

fn users_rows() -> Vec<TextRow> {
    vec![
        TextRow::from_strs(&[Some("1"), Some("alice"), Some("2024-01-02 03:04:05")]),
        TextRow::from_strs(&[Some("2"), None, None]),
    ]
}

impl SqlExecutor for UsersExecutor {
    fn table_columns(&self, session: &Session, table: &str) -> Result<Vec<ColumnDefinition>> {
        if table.eq_ignore_ascii_case("users") {
            Ok(users_columns())
        } else {
            Err(no_such_table(session, table))
        }
    }

    fn select(&self, session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        let Some(table) = statement.tables.first() else {
            // SELECT <literal>
            let literal = statement.projection.join(", ");
            let column = ColumnDefinition::new(literal.clone(), ColumnType::MYSQL_TYPE_LONGLONG);
            return Ok(ResultSet::rows(
                vec![column],
                vec![TextRow::from_strs(&[Some(&literal)])],
            ));
        };

        let columns = self.table_columns(session, table)?;
        let mut rows = users_rows();
        if let Some(id) = where_id(&statement.sql) {
            rows.retain(|row| row.get(0) == Some(id.as_bytes()));
        }
        if statement.projects_all_columns() {
            return Ok(ResultSet::rows(columns, rows));
        }

        let picked = statement
            .projection
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        Error::sql(
                            crate::error::ER_BAD_FIELD_ERROR,
                            crate::error::SQLSTATE_BAD_FIELD,
                            format!("Unknown column '{name}' in 'field list'"),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let columns = picked.iter().map(|&idx| columns[idx].clone()).collect();
        let rows = rows
            .into_iter()
            .map(|row| {
                picked
                    .iter()
                    .map(|&idx| row.0.get(idx).cloned().flatten())
                    .collect()
            })
            .collect();
        Ok(ResultSet::rows(columns, rows))
    }

    fn insert(&self, session: &mut Session, statement: &Statement) -> Result<ResultSet> {
        for table in &statement.tables {
            self.table_columns(session, table)?;
        }
        Ok(ResultSet::affected(1).with_last_insert_id(3))
    }

    fn create_database(&self, _session: &mut Session, _statement: &Statement) -> Result<ResultSet> {
        Ok(ResultSet::affected(1))
    }
}

/// Value of a trailing `WHERE id = N`
fn where_id(sql: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let idx = upper.find("WHERE ID = ")?;
    Some(
        sql[idx + "WHERE ID = ".len()..]
            .trim()
            .trim_matches('\'')
            .to_string(),
    )
}

pub type TestEngine = Engine<KeywordParser, UsersExecutor>;

pub fn engine() -> TestEngine {
    Engine::new(KeywordParser, UsersExecutor)
}

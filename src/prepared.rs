use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::protocol::command::ColumnDefinition;
use crate::sql::Statement;

/// A statement prepared by COM_STMT_PREPARE, kept until COM_STMT_CLOSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub id: u32,
    pub query: String,
    /// Parsed form of `query`, placeholders unbound
    pub statement: Statement,
    /// One definition per placeholder, in positional order
    pub params: Vec<ColumnDefinition>,
    /// Columns the statement projects; empty for statements without a resultset
    pub columns: Vec<ColumnDefinition>,
}

impl PreparedStatement {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

/// Process-wide prepared statement table.
///
/// Ids are unique for the lifetime of the registry (not per connection) and never reused.
/// 0 is never handed out.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    last_id: AtomicU32,
    statements: RwLock<HashMap<u32, Arc<PreparedStatement>>>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose next id is `last_id + 1`
    pub fn starting_after(last_id: u32) -> Self {
        Self {
            last_id: AtomicU32::new(last_id),
            statements: RwLock::default(),
        }
    }

    /// Allocate a fresh statement id; fails once the 32-bit space is exhausted
    pub fn next_statement_id(&self) -> Result<u32> {
        self.last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map(|prev| prev + 1)
            .map_err(|_| Error::StatementIdOverflow)
    }

    /// Insert by id, replacing any statement already registered under it
    pub fn register(&self, statement: PreparedStatement) -> Arc<PreparedStatement> {
        let statement = Arc::new(statement);
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(statement.id, Arc::clone(&statement));
        statement
    }

    pub fn get(&self, id: u32) -> Result<Arc<PreparedStatement>> {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::StatementNotFound(id))
    }

    /// Remove a statement; removing an unknown id is a no-op
    pub fn remove(&self, id: u32) -> Option<Arc<PreparedStatement>> {
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

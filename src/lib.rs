mod buffer;
mod buffer_pool;
mod opts;
pub mod connections;
pub mod constant;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod prepared;
pub mod protocol;
pub mod session;
pub mod sql;

#[cfg(test)]
mod dispatch_test;
#[cfg(test)]
mod testing;

pub use buffer::BufferSet;
pub use buffer_pool::{BufferPool, GLOBAL_BUFFER_POOL, PooledBufferSet};
pub use connections::{ConnHandle, ConnInfo, ConnRegistry};
pub use dispatch::{DispatchResult, Dispatcher};
pub use error::{Error, Result};
pub use handler::{CommandHandler, Engine, ParseErrorHandler, ResultWriter};
pub use opts::Opts;
pub use session::Session;
pub use sql::{ResultSet, SqlExecutor, SqlParser, Statement, StatementKind};

#[cfg(feature = "sync")]
pub mod sync;

#[cfg(feature = "tokio")]
pub mod tokio;

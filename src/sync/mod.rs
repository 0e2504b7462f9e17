mod conn;
mod server;
mod stream;

pub use conn::{Conn, read_payload};
pub use server::Server;
pub use stream::Stream;

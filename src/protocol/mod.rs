pub mod command;
pub mod connection;
pub mod packet;
pub mod primitive;
pub mod response;
pub mod value;


pub use packet::{Packet, PacketHeader, PacketReader, PacketWriter, SequenceId};
pub use response::{ErrPayload, OkPayload, PacketType};
pub use value::{NullBitmap, Parameter, Value};

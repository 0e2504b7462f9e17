mod handshake;
mod ssl_request;


pub use handshake::AuthSwitchRequest;
pub use handshake::Handshake;
pub use handshake::HandshakeConfig;
pub use handshake::HandshakeResponse41;
pub use handshake::HandshakeResult;
pub use handshake::InitialHandshake;
pub use handshake::generate_auth_plugin_data;
pub use ssl_request::SslRequest;

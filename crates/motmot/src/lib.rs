pub mod client;
pub mod codec;
pub mod principal;
pub mod protocol;

/// Conventional TCP port for client and server-to-server traffic.
pub const DEFAULT_PORT: u16 = 8888;

pub mod certs;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod federation;
pub mod handler;
pub mod registry;
pub mod server;
pub mod store;
pub mod tls;

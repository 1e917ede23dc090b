pub mod client;
pub mod codec;
pub mod command;
pub mod commands;
pub mod connection;
pub mod frame;
pub mod server;
pub mod store;
pub mod subscriptions;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

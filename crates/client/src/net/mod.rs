pub mod client;
pub mod config;
pub mod remote;

pub use client::{ConnectionState, LocalAvatar, NetworkClient};
pub use config::ClientConfig;
pub use remote::{RemoteEntity, RemoteView, RemoteViewConfig};

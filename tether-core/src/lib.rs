pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod qr;
pub mod sidecar;
pub mod store;

pub use client::{
    ClientError, MessageContent, MessagingClient, SendAck, SessionEvent, SessionHandle,
    SessionOptions, SessionParts,
};
pub use config::TetherConfig;
pub use error::{TetherError, TetherResult};
pub use models::{
    AccountInfo, Connection, ConnectionStatus, ConnectionView, LiveSnapshot, TransitionKind,
};
pub use sidecar::SidecarClient;
pub use store::{ConnectionStore, MemoryConnectionStore, PgConnectionStore, StoreError};

pub mod http;
pub mod service;
pub mod subsystems;

pub use service::{AddedConnection, ConnectionService};

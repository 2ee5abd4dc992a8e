pub mod connection;
pub mod status;

pub use connection::{AccountInfo, Connection, ConnectionView, LiveSnapshot};
pub use status::{ConnectionStatus, TransitionKind};

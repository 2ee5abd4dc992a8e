pub mod bridge;
pub mod dispatcher;
pub mod launcher;
pub mod locks;
pub mod registry;
pub mod restore;
pub mod sweeper;

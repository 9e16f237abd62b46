//! Server target registry

pub mod store;
pub mod validate;

pub use store::{ServerRegistry, StatusUpdate};

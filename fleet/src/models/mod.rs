//! Data models shared across the registry, pipeline and HTTP surface

pub mod progress;
pub mod rollback;
pub mod target;

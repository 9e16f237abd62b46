//! fleetd library
//!
//! Deploys an agent stack to many remote hosts at once, tracks every host
//! through a fixed pipeline of stages and rolls hosts back on failure.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;
pub mod utils;

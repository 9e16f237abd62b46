//! HTTP and WebSocket surface

pub mod handlers;
pub mod serve;
pub mod ws;

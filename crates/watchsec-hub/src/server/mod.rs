//! Websocket endpoints for agents and viewers

mod agent;
mod listener;
mod socket;
mod viewer;

pub use listener::{router, serve, Health};
pub use socket::pump_outbound;

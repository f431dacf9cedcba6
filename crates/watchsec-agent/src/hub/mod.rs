//! Control connection to the relay hub

mod connector;
mod reconnect;

pub use connector::{ConnectionError, HubConnector, HubEvent, HubLink, HubSender};
#[cfg(test)]
pub(crate) use connector::Outbound;
pub use reconnect::ExponentialBackoff;

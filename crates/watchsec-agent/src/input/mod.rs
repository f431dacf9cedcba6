//! Input executor

mod executor;
mod keys;

pub use executor::{denormalize, execute, InputExecutor, InputRequest};
pub use keys::NamedKey;

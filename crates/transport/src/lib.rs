pub mod dial;
pub mod relay;

pub use dial::{DialError, dial};
pub use relay::{RelayEnd, relay};

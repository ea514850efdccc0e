//! Transport layer: trait and implementations.

mod mock;
mod socketcan;
mod traits;

pub use mock::{MockTransport, ServiceHandler};
pub use socketcan::SocketCanTransport;
pub use traits::{CanFrame, CanTransport, TransportError};

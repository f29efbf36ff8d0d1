//! Request dispatch over an injected transport.

mod dispatcher;
mod transport;

pub use dispatcher::Dispatcher;
pub use transport::{SimulatedVendor, Transport, TransportError, TransportResponse};

mod exchange;
pub mod model;
mod node;
mod protocol;
mod resources;
mod session;
mod transport;

#[cfg(test)]
mod test_support;

pub use exchange::{ClusterListener, ListenerId, ResourceExchange, RouteListener};
pub use node::NodeBuilder;
pub use protocol::{Cds, DecodeError, Discovery, Eds, Lds, Protocol, Rds};
pub use resources::ResourceType;
pub use session::{AdsSession, ResponseHandler, SessionError, SessionState, RECONNECT_DELAY};
pub use transport::{Connect, RequestStream, ResponseStream, TonicConnector};

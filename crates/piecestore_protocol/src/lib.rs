//! Piece transfer protocol: sessions, the storage node endpoint, background
//! services and a QUIC client and server.

pub mod chores;
pub mod client;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod inflight;
pub mod message;
pub mod retain;
pub mod server;
pub mod session;
pub mod transport;
pub mod verification;

pub use endpoint::{Endpoint, EndpointConfig};
pub use error::{AuthError, ErrorCode, ProtocolError, RpcError};
pub use inflight::InFlight;
pub use retain::{RetainConfig, RetainQueue, RetainService, RetainStatus};
pub use session::SessionContext;
pub use transport::{memory_pair, Transport};
pub use verification::Verifier;

use std::time::Duration;

pub const PROTOCOL_VERSION: u16 = 1;

pub(crate) const MAX_ATTEMPTS: i32 = 5;
pub const QUIC_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest frame accepted on a stream.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
/// Largest payload the node puts in one download chunk.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;
/// How long a session waits for the peer's next message.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub const NAME: &str = "Piecestore";
pub const BIN_NAME: &str = "piecestore";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Storage node for erasure-coded pieces";

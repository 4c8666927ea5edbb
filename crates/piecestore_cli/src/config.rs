//! Settings for the piecestore node, defined in the settings.toml file.
//!
//! Every value can be overridden from the environment with a `PIECESTORE__`
//! prefix and `__` between sections, e.g. `PIECESTORE__NODE__QUIC_PORT=7777`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[allow(unused)]
#[derive(Debug, Deserialize)]
pub struct Node {
    pub store_dir: String,
    pub identity_file: String,
    pub expiration_db: String,
    /// Hex node IDs of the satellites whose requests are honoured.
    #[serde(default)]
    pub trusted_satellites: Vec<String>,
    /// Allowed clock difference for order limits and signed requests, in seconds.
    pub max_time_skew: u64,
    /// Seconds to wait for the next message on a stream.
    pub stream_timeout: u64,
    pub max_chunk_size: u64,
}

#[allow(unused)]
#[derive(Debug, Deserialize)]
pub struct Retain {
    pub status: String,
    /// Hours subtracted from a retain request's creation date.
    pub max_time_skew: u64,
    pub queue_capacity: usize,
}

#[allow(unused)]
#[derive(Debug, Deserialize)]
pub struct Chores {
    /// Seconds between expiration collector runs.
    pub expiration_interval: u64,
    pub expiration_batch_size: usize,
    /// Seconds between trash chore runs.
    pub trash_interval: u64,
    /// Hours a piece stays in the trash.
    pub trash_expiry: u64,
}

#[allow(unused)]
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub version: String,
    pub log_level: String,
    pub log_dir: String,

    pub otel_api_key: String,
    pub otel_endpoint: String,
    pub otel_service_name: String,

    pub external_ip: String,
    pub quic_port: u16,

    pub node: Node,
    pub retain: Retain,
    pub chores: Chores,
}

impl Settings {
    /// Load settings and create a new `Settings` instance.
    pub(crate) fn new(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let file: &str = match config_file {
            Some(name) => name,
            None => "settings.toml",
        };

        let s = Config::builder()
            .add_source(File::with_name(file))
            .add_source(Environment::with_prefix("PIECESTORE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

/// Macro to get a value from CLI args if present, otherwise use the settings value.
///
/// # Example
///
/// ```rust
/// get_config_value(args, "arg_name", String, settings.arg_name);
/// ```
#[macro_export]
macro_rules! get_config_value {
    ($args:expr, $arg_name:expr, $arg_type:ty, $settings:expr) => {
        match $args.try_get_one::<$arg_type>($arg_name) {
            Ok(Some(value)) => value,
            Ok(None) => &$settings,
            Err(err) => {
                tracing::warn!("Failed to load CLI config, loading default settings. Error: {err}");
                &$settings
            }
        }
    };
}

//! Arguments shared by every subcommand.

use clap::{Arg, ArgAction};

pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .long("config")
            .value_name("file")
            .help("Path to the settings file")
            .action(ArgAction::Set)
            .global(true),
        Arg::new("log_level")
            .long("log-level")
            .value_name("level")
            .help("Set the log level")
            .action(ArgAction::Set)
            .global(true),
        Arg::new("otel_api_key")
            .long("otel-api-key")
            .value_name("key")
            .help("API key for the OpenTelemetry collector")
            .action(ArgAction::Set)
            .global(true),
        Arg::new("otel_endpoint")
            .long("otel-endpoint")
            .value_name("url")
            .help("OpenTelemetry collector endpoint")
            .action(ArgAction::Set)
            .global(true),
        Arg::new("otel_service_name")
            .long("otel-service-name")
            .value_name("name")
            .help("Service name reported to the collector")
            .action(ArgAction::Set)
            .global(true),
    ]
}

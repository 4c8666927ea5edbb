use std::collections::HashMap;

use anyhow::Result;
use clap::Command;
use constants::{ABOUT, BIN_NAME, NAME, VERSION};
use expanduser::expanduser;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{logs::SdkLoggerProvider, Resource};
use tracing::info;

mod cli;
mod config;
mod constants;
mod log;

pub fn main() -> Result<()> {
    let about_text = format!("{} {}\n{}", NAME, VERSION, ABOUT);
    let usage_text = format!("{} <command> [options]", BIN_NAME);
    let after_help_text = format!(
        "See '{} help <command>' for more information on a command",
        BIN_NAME
    );

    let piecestore = Command::new("piecestore")
        .bin_name(BIN_NAME)
        .name(NAME)
        .version(VERSION)
        .about(about_text)
        .override_usage(usage_text)
        .after_help(after_help_text)
        .args(cli::args::common_args())
        .arg_required_else_help(true)
        .subcommands(cli::builtin())
        .subcommand_required(true);

    let matches = piecestore.get_matches();

    // Offline tools do not need settings or a logger.
    match matches.subcommand() {
        Some(("id", cmd)) => return cli::id::exec(cmd),
        Some(("identity", cmd)) => return cli::identity::exec(cmd),
        Some(("piece", cmd)) => return cli::piece::exec(cmd),
        _ => {}
    }

    // Gets the config file as str
    let config_file_raw: Option<&str> = match matches.try_get_one::<String>("config") {
        Ok(config_path) => config_path.map(|s| s.as_str()),
        Err(error) => {
            fatal!("Error while parsing config file flag: {error}")
        }
    };

    let expanded_path = match expanduser(config_file_raw.unwrap_or("settings.toml")) {
        Ok(path) => path,
        Err(error) => fatal!("Error while expanding config file path: {error}"),
    };

    let config_file = match expanded_path.to_str() {
        Some(s) => Some(s.to_owned()),
        None => {
            fatal!(
                "Config path is not valid UTF-8: {}",
                expanded_path.display()
            );
        }
    };

    // CLI values take precedence over settings.toml
    let settings = match config::Settings::new(config_file.as_deref()) {
        Ok(s) => s,
        Err(error) => fatal!("Failed to parse settings file: {error:?}"),
    };

    // Initialise logger and set the logging level
    let log_level_arg = match matches.try_get_one::<String>("log_level") {
        Ok(level) => level,
        Err(error) => {
            fatal!("Error while parsing log level flag: {error}");
        }
    };
    let log_level = match log_level_arg {
        Some(level) => level,
        None => &settings.log_level,
    };

    let otel_api_key = get_config_value!(matches, "otel_api_key", String, settings.otel_api_key);
    let otel_endpoint =
        get_config_value!(matches, "otel_endpoint", String, settings.otel_endpoint);
    let otel_service_name = get_config_value!(
        matches,
        "otel_service_name",
        String,
        settings.otel_service_name
    )
    .clone();

    let otel_layer = if otel_api_key.trim().is_empty() {
        // Build a no-export provider so nothing is sent
        let provider = SdkLoggerProvider::builder().build();
        OpenTelemetryTracingBridge::new(&provider)
    } else {
        let mut otel_headers: HashMap<String, String> = HashMap::new();
        otel_headers.insert("X-Api-Key".to_string(), otel_api_key.to_string());
        let url: String = otel_endpoint.to_owned() + "logs";

        let identifier_resource = Resource::builder()
            .with_attribute(opentelemetry::KeyValue::new(
                "service.name",
                otel_service_name,
            ))
            .build();

        let otel_exporters = match LogExporter::builder()
            .with_http()
            .with_endpoint(url)
            .with_protocol(Protocol::HttpBinary)
            .with_headers(otel_headers)
            .build()
        {
            Ok(exporter) => exporter,
            Err(error) => fatal!("Failed to create OTEL log exporter: {error}"),
        };

        let otel_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(otel_exporters)
            .with_resource(identifier_resource)
            .build();

        OpenTelemetryTracingBridge::new(&otel_provider)
    };

    let _guards = log::new(log_level.as_str(), &settings.log_dir, otel_layer);
    info!("Initialised logger with log level {log_level}");
    if otel_api_key.trim().is_empty() {
        info!("No OTEL API key provided; skipping telemetry");
    } else {
        info!("OTEL API key provided; enabling telemetry");
    }

    match matches.subcommand() {
        Some(("node", cmd)) => cli::node::exec(cmd, &settings)?,
        _ => unreachable!(),
    }

    Ok(())
}

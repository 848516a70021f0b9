//! # hermes
//!
//! Command line entry point. Two subcommands:
//!
//! - `consume_events` runs the configured consumer for one signal until it
//!   stops or the process receives ctrl-c.
//! - `generate_schemas` writes the Avro schema of signals to disk.
//!
//! Settings come from `--settings <file>` and the environment; see
//! [`hermes::settings`]. Any failure is logged and the process exits with a
//! non-zero status.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hermes::cli::{Cli, Commands};
use hermes::commands::{ConsumeRequest, SchemaRequest, consume_events, generate_schemas};
use hermes::custom::CustomTypeRegistry;
use hermes::event::{SourceInfo, configure_source, registry};
use hermes::loader::{Loader, shutdown_producer};
use hermes::settings::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "hermes failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.settings.as_deref()).context("Failed to load settings")?;
    if let Some(service_variant) = settings.service_variant.clone() {
        let source = SourceInfo {
            service_variant,
            ..SourceInfo::from_env()
        };
        if configure_source(source).is_err() {
            warn!("Event source was already configured");
        }
    }
    let registry = registry::global().context("Failed to build the signal registry")?;

    match cli.command {
        Commands::GenerateSchemas {
            event_types,
            all,
            root,
        } => {
            let request = SchemaRequest {
                event_types,
                all,
                root,
            };
            let written = generate_schemas(
                registry,
                &CustomTypeRegistry::default(),
                &request,
                confirm_overwrite,
            )
            .context("Failed to generate schemas")?;
            info!(files = written.len(), "Schema generation finished");
            Ok(())
        }
        Commands::ConsumeEvents {
            topic,
            group_id,
            signal,
            extra,
        } => {
            let loader = Loader::with_defaults();
            let request = ConsumeRequest {
                topic,
                group_id,
                signal,
                extra: extra.unwrap_or_default(),
            };
            let result = tokio::select! {
                result = consume_events(registry, &loader, &settings, request) => {
                    result.context("Event consumer failed")
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted; stopping consumer");
                    Ok(())
                }
            };
            shutdown_producer().await;
            result
        }
    }
}

/// Asks on the terminal whether to replace `path`. Anything but `y` keeps it.
fn confirm_overwrite(path: &Path) -> bool {
    print!(
        "A schema file already exists at {}. Overwrite it? (y/n) ",
        path.display()
    );
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}

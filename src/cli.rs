//! Command line definitions for the `hermes` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value as Json};

/// Hermes - typed events between services
#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(version)]
#[command(about = "Derive event schemas and consume events from the event bus")]
pub struct Cli {
    /// Settings file (TOML); environment variables override it
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume one signal's events from a topic and emit them locally
    #[command(name = "consume_events")]
    ConsumeEvents {
        /// Topic to read, without the configured prefix
        #[arg(short, long)]
        topic: String,

        /// Consumer group
        #[arg(short, long = "group_id", alias = "group-id")]
        group_id: String,

        /// Event type of the signal carried on the topic
        #[arg(short, long)]
        signal: String,

        /// JSON object of options for the consumer implementation
        #[arg(long, value_parser = parse_extra)]
        extra: Option<Map<String, Json>>,
    },

    /// Write Avro schemas for signals
    #[command(name = "generate_schemas")]
    GenerateSchemas {
        /// Event types to generate
        #[arg(required_unless_present = "all")]
        event_types: Vec<String>,

        /// Generate every registered signal
        #[arg(long, default_value_t = false, conflicts_with = "event_types")]
        all: bool,

        /// Directory holding the `schemas/` folder
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

fn parse_extra(text: &str) -> Result<Map<String, Json>, String> {
    match serde_json::from_str::<Json>(text) {
        Ok(Json::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn consume_events_parses_underscored_flags() {
        let cli = Cli::try_parse_from([
            "hermes",
            "consume_events",
            "--topic",
            "xblock-published",
            "--group_id",
            "search",
            "--signal",
            "org.openedx.content_authoring.xblock.published.v1",
            "--extra",
            r#"{"buffer_size": 20}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::ConsumeEvents {
                group_id, extra, ..
            } => {
                assert_eq!(group_id, "search");
                assert_eq!(extra.unwrap()["buffer_size"], 20);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn extra_must_be_an_object() {
        let result = Cli::try_parse_from([
            "hermes", "consume_events", "--topic", "t", "--group_id", "g", "--signal", "s",
            "--extra", "[1]",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn generate_schemas_needs_types_or_all() {
        assert!(Cli::try_parse_from(["hermes", "generate_schemas"]).is_err());
        let cli = Cli::try_parse_from(["hermes", "generate_schemas", "--all", "--root", "/tmp/out"])
            .unwrap();
        assert!(matches!(cli.command, Commands::GenerateSchemas { all: true, .. }));
    }
}

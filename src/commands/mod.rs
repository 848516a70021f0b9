//! The work behind the `hermes` subcommands, callable without the binary.

mod consume_events;
mod generate_schemas;

pub use consume_events::{ConsumeRequest, consume_events};
pub use generate_schemas::{SchemaRequest, generate_schemas, schema_file_name};

use std::path::{Path, PathBuf};

use tracing::info;

use crate::catalog;
use crate::custom::CustomTypeRegistry;
use crate::error::Error;
use crate::event::SignalRegistry;
use crate::schema::derive_schema;

/// Which schemas to write, and where.
#[derive(Debug, Clone, Default)]
pub struct SchemaRequest {
    pub event_types: Vec<String>,
    pub all: bool,
    /// Files land in `<root>/schemas/`.
    pub root: PathBuf,
}

/// `org.openedx.x.v1` becomes `org+openedx+x+v1_schema.avsc`.
pub fn schema_file_name(event_type: &str) -> String {
    format!("{}_schema.avsc", event_type.replace('.', "+"))
}

/// Writes the canonical schema of each requested signal.
///
/// Signals in [`catalog::KNOWN_UNSERIALIZABLE_SIGNALS`] are skipped. When a
/// file already exists, `confirm_overwrite` decides whether to replace it.
/// Returns the files written.
///
/// # Errors
///
/// [`Error::UnknownSignal`] for an unregistered event type, before anything is
/// written; [`Error::InvalidConfig`] when neither event types nor `all` are
/// given.
pub fn generate_schemas(
    registry: &SignalRegistry,
    custom_types: &CustomTypeRegistry,
    request: &SchemaRequest,
    mut confirm_overwrite: impl FnMut(&Path) -> bool,
) -> Result<Vec<PathBuf>, Error> {
    let signals = if request.all {
        registry.iter().cloned().collect::<Vec<_>>()
    } else if request.event_types.is_empty() {
        return Err(Error::invalid_config(
            "name at least one event type or pass --all",
            Some("event_types"),
        ));
    } else {
        request
            .event_types
            .iter()
            .map(|event_type| registry.require(event_type).cloned())
            .collect::<Result<Vec<_>, _>>()?
    };

    let directory = request.root.join("schemas");
    let mut written = Vec::new();
    for signal in signals {
        let event_type = signal.event_type().as_ref();
        if catalog::is_unserializable(event_type) {
            info!(event_type = %event_type, "Skipping signal with no serializable schema");
            continue;
        }

        let schema = derive_schema(&signal, custom_types)?;
        let path = directory.join(schema_file_name(event_type));
        if path.exists() && !confirm_overwrite(&path) {
            info!(path = %path.display(), "Keeping existing schema file");
            continue;
        }
        std::fs::create_dir_all(&directory)?;
        std::fs::write(&path, schema.to_canonical_json()?)?;
        info!(event_type = %event_type, path = %path.display(), "Wrote schema");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, parse_schema};

    fn request(root: &Path, event_types: &[&str], all: bool) -> SchemaRequest {
        SchemaRequest {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            all,
            root: root.to_path_buf(),
        }
    }

    #[test]
    fn file_names_replace_dots() {
        assert_eq!(
            schema_file_name("org.openedx.learning.course.enrollment.created.v1"),
            "org+openedx+learning+course+enrollment+created+v1_schema.avsc"
        );
    }

    #[test]
    fn writes_parseable_canonical_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let registry = catalog::registry().unwrap();
        let written = generate_schemas(
            &registry,
            &CustomTypeRegistry::default(),
            &request(dir.path(), &[catalog::XBLOCK_PUBLISHED], false),
            |_| true,
        )
        .unwrap();

        assert_eq!(written.len(), 1);
        let text = std::fs::read_to_string(&written[0]).unwrap();
        let schema = parse_schema(&serde_json::from_str(&text).unwrap()).unwrap();
        let signal = registry.require(catalog::XBLOCK_PUBLISHED).unwrap();
        let derived: Schema = derive_schema(signal, &CustomTypeRegistry::default()).unwrap();
        assert_eq!(schema, derived);
    }

    #[test]
    fn all_skips_unserializable_signals() {
        let dir = tempfile::tempdir().unwrap();
        let registry = catalog::registry().unwrap();
        let written = generate_schemas(
            &registry,
            &CustomTypeRegistry::default(),
            &request(dir.path(), &[], true),
            |_| true,
        )
        .unwrap();

        assert_eq!(written.len(), registry.len() - catalog::KNOWN_UNSERIALIZABLE_SIGNALS.len());
        let skipped = dir
            .path()
            .join("schemas")
            .join(schema_file_name(catalog::COURSE_DISCUSSIONS_CHANGED));
        assert!(!skipped.exists());
    }

    #[test]
    fn existing_files_are_kept_unless_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = catalog::registry().unwrap();
        let req = request(dir.path(), &[catalog::XBLOCK_DELETED], false);
        let path = dir.path().join("schemas").join(schema_file_name(catalog::XBLOCK_DELETED));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "old").unwrap();

        let written =
            generate_schemas(&registry, &CustomTypeRegistry::default(), &req, |_| false).unwrap();
        assert!(written.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");

        let written =
            generate_schemas(&registry, &CustomTypeRegistry::default(), &req, |_| true).unwrap();
        assert_eq!(written, vec![path.clone()]);
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn unknown_types_and_empty_requests_fail() {
        let dir = tempfile::tempdir().unwrap();
        let registry = catalog::registry().unwrap();
        let custom = CustomTypeRegistry::default();

        let err = generate_schemas(&registry, &custom, &request(dir.path(), &["org.x.nope.v1"], false), |_| true)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSignal { .. }));
        let err = generate_schemas(&registry, &custom, &request(dir.path(), &[], false), |_| true)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}

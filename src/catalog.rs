//! Built-in signals.
//!
//! A small set of Open edX style events that services commonly exchange. Each
//! call to [`signals`] builds fresh definitions; the process-wide registry keeps
//! its own set, see [`crate::event::registry::global`].

use std::sync::Arc;

use crate::custom;
use crate::error::Error;
use crate::event::{EventSignal, SignalRegistry, SignalRegistryBuilder};
use crate::types::{DataType, RecordType};

pub const XBLOCK_PUBLISHED: &str = "org.openedx.content_authoring.xblock.published.v1";
pub const XBLOCK_DELETED: &str = "org.openedx.content_authoring.xblock.deleted.v1";
pub const COURSE_CATALOG_INFO_CHANGED: &str =
    "org.openedx.content_authoring.course.catalog_info.changed.v1";
pub const COURSE_ENROLLMENT_CREATED: &str = "org.openedx.learning.course.enrollment.created.v1";
pub const STUDENT_REGISTRATION_COMPLETED: &str =
    "org.openedx.learning.student.registration.completed.v1";
pub const COURSE_DISCUSSIONS_CHANGED: &str =
    "org.openedx.learning.discussions.configuration.changed.v1";

/// Event types whose data holds bare lists or maps, so no schema can be derived.
/// Schema generation and consumer startup skip them.
pub const KNOWN_UNSERIALIZABLE_SIGNALS: &[&str] = &[COURSE_DISCUSSIONS_CHANGED];

pub fn is_unserializable(event_type: &str) -> bool {
    KNOWN_UNSERIALIZABLE_SIGNALS.contains(&event_type)
}

pub fn xblock_data() -> RecordType {
    RecordType::builder("XBlockData")
        .field("usage_key", DataType::custom(custom::USAGE_KEY))
        .field("block_type", DataType::string())
        .nullable("version", DataType::long())
        .build()
}

pub fn user_personal_data() -> RecordType {
    RecordType::builder("UserPersonalData")
        .field("username", DataType::string())
        .field("email", DataType::string())
        .field("name", DataType::string())
        .build()
}

pub fn user_data() -> RecordType {
    RecordType::builder("UserData")
        .field("id", DataType::long())
        .field("is_active", DataType::bool())
        .field("pii", DataType::record(user_personal_data()))
        .build()
}

pub fn course_data() -> RecordType {
    RecordType::builder("CourseData")
        .field("course_key", DataType::custom(custom::COURSE_KEY))
        .nullable("display_name", DataType::string())
        .nullable("start", DataType::custom(custom::TIMESTAMP))
        .nullable("end", DataType::custom(custom::TIMESTAMP))
        .build()
}

pub fn course_enrollment_data() -> RecordType {
    let user = Arc::new(user_data());
    RecordType::builder("CourseEnrollmentData")
        .field("user", DataType::Record(Arc::clone(&user)))
        .field("course", DataType::record(course_data()))
        .field("mode", DataType::string())
        .field("is_active", DataType::bool())
        .field("creation_date", DataType::custom(custom::TIMESTAMP))
        .nullable("created_by", DataType::Record(user))
        .build()
}

pub fn course_schedule_data() -> RecordType {
    RecordType::builder("CourseScheduleData")
        .field("start", DataType::custom(custom::TIMESTAMP))
        .field("pacing", DataType::string())
        .nullable("end", DataType::custom(custom::TIMESTAMP))
        .nullable("enrollment_start", DataType::custom(custom::TIMESTAMP))
        .nullable("enrollment_end", DataType::custom(custom::TIMESTAMP))
        .build()
}

pub fn course_catalog_data() -> RecordType {
    RecordType::builder("CourseCatalogData")
        .field("course_key", DataType::custom(custom::COURSE_KEY))
        .field("name", DataType::string())
        .field("schedule_data", DataType::record(course_schedule_data()))
        .field("hidden", DataType::bool())
        .field("invitation_only", DataType::bool())
        .build()
}

pub fn course_discussion_configuration_data() -> RecordType {
    RecordType::builder("CourseDiscussionConfigurationData")
        .field("course_key", DataType::custom(custom::COURSE_KEY))
        .field("provider_type", DataType::string())
        .field("enable_in_context", DataType::bool())
        .field("enable_graded_units", DataType::bool())
        .field("unit_level_visibility", DataType::bool())
        .field("plugin_configuration", DataType::bare_map())
        .field("contexts", DataType::bare_list())
        .build()
}

/// Fresh definitions of every built-in signal.
pub fn signals() -> Result<Vec<Arc<EventSignal>>, Error> {
    Ok(vec![
        EventSignal::builder(XBLOCK_PUBLISHED)
            .init_data("xblock_info", DataType::record(xblock_data()))
            .build()?,
        EventSignal::builder(XBLOCK_DELETED)
            .init_data("xblock_info", DataType::record(xblock_data()))
            .build()?,
        EventSignal::builder(COURSE_CATALOG_INFO_CHANGED)
            .init_data("catalog_info", DataType::record(course_catalog_data()))
            .build()?,
        EventSignal::builder(COURSE_ENROLLMENT_CREATED)
            .init_data("enrollment", DataType::record(course_enrollment_data()))
            .build()?,
        EventSignal::builder(STUDENT_REGISTRATION_COMPLETED)
            .init_data("user", DataType::record(user_data()))
            .build()?,
        EventSignal::builder(COURSE_DISCUSSIONS_CHANGED)
            .init_data(
                "configuration",
                DataType::record(course_discussion_configuration_data()),
            )
            .build()?,
    ])
}

/// A registry builder seeded with the catalog, for applications to extend.
pub fn builder() -> Result<SignalRegistryBuilder, Error> {
    SignalRegistry::builder().register_all(signals()?)
}

pub fn registry() -> Result<SignalRegistry, Error> {
    Ok(builder()?.build())
}

use std::fmt;
use std::str::FromStr;

use super::{COURSE_KEY, CustomTypeId, LIBRARY_LOCATOR, USAGE_KEY};
use crate::error::Error;

/// The families of opaque keys understood by the default codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// `course-v1:{org}+{course}+{run}`
    Course,
    /// `block-v1:{org}+{course}+{run}+type@{type}+block@{id}` or
    /// `lb:{org}:{library}:{type}:{id}`
    Usage,
    /// `lib:{org}:{slug}` or `library-v1:{org}+{library}`
    Library,
}

impl KeyKind {
    pub fn type_id(self) -> CustomTypeId {
        match self {
            KeyKind::Course => COURSE_KEY,
            KeyKind::Usage => USAGE_KEY,
            KeyKind::Library => LIBRARY_LOCATOR,
        }
    }

    /// The kind matching a declared type id, or `None` for the family root.
    pub fn from_type_id(id: &CustomTypeId) -> Option<Self> {
        [KeyKind::Course, KeyKind::Usage, KeyKind::Library]
            .into_iter()
            .find(|kind| id.is_within(&kind.type_id()))
    }

    fn label(self) -> &'static str {
        match self {
            KeyKind::Course => "course",
            KeyKind::Usage => "usage",
            KeyKind::Library => "library",
        }
    }
}

/// A validated course, usage or library key, kept in its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpaqueKey {
    kind: KeyKind,
    canonical: String,
}

impl OpaqueKey {
    pub fn parse(kind: KeyKind, text: &str) -> Result<Self, Error> {
        let valid = match kind {
            KeyKind::Course => is_course_key(text),
            KeyKind::Usage => is_usage_key(text),
            KeyKind::Library => is_library_key(text),
        };
        if valid {
            Ok(Self {
                kind,
                canonical: text.to_string(),
            })
        } else {
            Err(Error::KeyFormat {
                family: kind.label().to_string(),
                value: text.to_string(),
            })
        }
    }

    pub fn course(text: &str) -> Result<Self, Error> {
        Self::parse(KeyKind::Course, text)
    }

    pub fn usage(text: &str) -> Result<Self, Error> {
        Self::parse(KeyKind::Usage, text)
    }

    pub fn library(text: &str) -> Result<Self, Error> {
        Self::parse(KeyKind::Library, text)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The course a `block-v1` usage key belongs to.
    pub fn course_key(&self) -> Option<OpaqueKey> {
        match self.kind {
            KeyKind::Course => Some(self.clone()),
            KeyKind::Usage => {
                let body = self.canonical.strip_prefix("block-v1:")?;
                let parts: Vec<_> = body.split('+').take(3).collect();
                OpaqueKey::course(&format!("course-v1:{}", parts.join("+"))).ok()
            }
            KeyKind::Library => None,
        }
    }
}

impl fmt::Display for OpaqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for OpaqueKey {
    type Err = Error;

    /// Parses a key of any family, detected by prefix.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let kind = if text.starts_with("course-v1:") {
            KeyKind::Course
        } else if text.starts_with("block-v1:") || text.starts_with("lb:") {
            KeyKind::Usage
        } else if text.starts_with("lib:") || text.starts_with("library-v1:") {
            KeyKind::Library
        } else {
            return Err(Error::KeyFormat {
                family: "opaque".to_string(),
                value: text.to_string(),
            });
        };
        Self::parse(kind, text)
    }
}

fn is_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%'))
}

fn split_exact<'a>(body: &'a str, separator: char, count: usize) -> Option<Vec<&'a str>> {
    let parts: Vec<_> = body.split(separator).collect();
    (parts.len() == count && parts.iter().all(|p| is_part(p))).then_some(parts)
}

fn is_course_key(text: &str) -> bool {
    text.strip_prefix("course-v1:")
        .and_then(|body| split_exact(body, '+', 3))
        .is_some()
}

fn is_usage_key(text: &str) -> bool {
    if let Some(body) = text.strip_prefix("block-v1:") {
        let parts: Vec<_> = body.split('+').collect();
        return match parts.as_slice() {
            [org, course, run, block_type, block_id] => {
                [org, course, run].iter().all(|p| is_part(p))
                    && block_type.strip_prefix("type@").is_some_and(is_part)
                    && block_id.strip_prefix("block@").is_some_and(is_part)
            }
            _ => false,
        };
    }
    text.strip_prefix("lb:")
        .and_then(|body| split_exact(body, ':', 4))
        .is_some()
}

fn is_library_key(text: &str) -> bool {
    if let Some(body) = text.strip_prefix("lib:") {
        return split_exact(body, ':', 2).is_some();
    }
    text.strip_prefix("library-v1:")
        .and_then(|body| split_exact(body, '+', 2))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_family() {
        assert!(OpaqueKey::course("course-v1:edX+DemoX+Demo_Course").is_ok());
        assert!(OpaqueKey::usage("block-v1:edX+DemoX+2024+type@html+block@a1b2").is_ok());
        assert!(OpaqueKey::usage("lb:edX:lib1:problem:p1").is_ok());
        assert!(OpaqueKey::library("lib:edX:lib1").is_ok());
        assert!(OpaqueKey::library("library-v1:edX+lib1").is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(OpaqueKey::course("course-v1:edX+DemoX").is_err());
        assert!(OpaqueKey::course("course-v1:edX+Demo X+run").is_err());
        assert!(OpaqueKey::usage("block-v1:edX+DemoX+2024+html+block@a1").is_err());
        assert!(OpaqueKey::library("lib:edX").is_err());
    }

    #[test]
    fn from_str_detects_family() {
        let key: OpaqueKey = "block-v1:edX+DemoX+2024+type@html+block@a1".parse().unwrap();
        assert_eq!(key.kind(), KeyKind::Usage);
        assert!("urn:thing".parse::<OpaqueKey>().is_err());
    }

    #[test]
    fn usage_keys_know_their_course() {
        let key = OpaqueKey::usage("block-v1:edX+DemoX+2024+type@html+block@a1").unwrap();
        assert_eq!(key.course_key().unwrap().as_str(), "course-v1:edX+DemoX+2024");
    }

    #[test]
    fn kind_from_type_id_matches_children_only() {
        assert_eq!(KeyKind::from_type_id(&USAGE_KEY), Some(KeyKind::Usage));
        assert_eq!(KeyKind::from_type_id(&super::super::OPAQUE_KEY), None);
    }
}

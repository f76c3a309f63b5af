//! Domain identifiers (strongly-typed IDs).
//!
//! Every id doubles as a file name (envelope files, task files), so ids are
//! validated on construction and on deserialization. Generated ids are ULID
//! based: the timestamp comes first, so they sort in creation order.
//!
//! `Id<T>` carries a zero-sized marker so an `EnvelopeId` can never be passed
//! where a `TaskId` is expected.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

/// Longest id accepted, in bytes.
pub const MAX_ID_LEN: usize = 200;

/// Marker trait supplying the prefix used for generated ids.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// An id that cannot double as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid id {value:?}: {reason}")]
pub struct IdError {
    pub value: String,
    pub reason: &'static str,
}

/// Validated, typed identifier. See [`EnvelopeId`], [`TaskId`], [`HolderId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Validate and wrap a caller-supplied id.
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value.len() > MAX_ID_LEN {
            Some("too long")
        } else if value.starts_with('.') {
            Some("must not start with '.'")
        } else if value.contains(['/', '\\', '\0']) {
            Some("must not contain path separators or NUL")
        } else if value.chars().any(char::is_control) {
            Some("must not contain control characters")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(IdError { value, reason }),
            None => Ok(Self {
                value,
                _marker: PhantomData,
            }),
        }
    }

    /// Build a generated id: `<prefix><ULID>`.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            value: format!("{}{}", T::prefix(), ulid),
            _marker: PhantomData,
        }
    }

    /// Wrap a literal known to pass `parse`.
    pub(crate) fn from_static(value: &'static str) -> Self {
        Self {
            value: value.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// Envelope marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Envelope {}

impl IdMarker for Envelope {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Lock holder marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Holder {}

impl IdMarker for Holder {
    fn prefix() -> &'static str {
        "holder-"
    }
}

/// Identifier of an Envelope; also its file name inside a bucket.
pub type EnvelopeId = Id<Envelope>;

/// Identifier of a Task tracked by the FSM.
pub type TaskId = Id<Task>;

/// Identifier of a Lock Token owner (one per dispatcher instance).
pub type HolderId = Id<Holder>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn generated_ids_carry_their_prefix() {
        let ulid = Ulid::new();
        assert!(EnvelopeId::from_ulid(ulid).as_str().starts_with("msg-"));
        assert!(TaskId::from_ulid(ulid).as_str().starts_with("task-"));
        assert!(HolderId::from_ulid(ulid).as_str().starts_with("holder-"));
    }

    #[test]
    fn generated_ids_sort_by_creation_time() {
        let id1 = EnvelopeId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = EnvelopeId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn caller_supplied_ids_are_kept_verbatim() {
        let id = EnvelopeId::parse("t1").unwrap();
        assert_eq!(id.as_str(), "t1");
        assert_eq!(id.to_string(), "t1");
    }

    #[rstest]
    #[case::empty("")]
    #[case::hidden(".pending")]
    #[case::slash("a/b")]
    #[case::backslash("a\\b")]
    #[case::nul("a\0b")]
    #[case::newline("a\nb")]
    fn unsafe_file_names_are_rejected(#[case] raw: &str) {
        assert!(EnvelopeId::parse(raw).is_err());
    }

    #[test]
    fn overlong_ids_are_rejected() {
        assert!(TaskId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(TaskId::parse("x".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn deserialization_validates() {
        let ok: TaskId = serde_json::from_str("\"build-42\"").unwrap();
        assert_eq!(ok.as_str(), "build-42");
        assert!(serde_json::from_str::<TaskId>("\"../etc\"").is_err());
    }
}

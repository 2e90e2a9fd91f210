//! Newtype domain identifiers.
//!
//! Every bridge concept that has an identity is a distinct newtype wrapping a
//! primitive, so an [`EventId`] can never be passed where a [`TaskId`] is
//! expected even though both end up as strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is blank.
            ///
            /// Surrounding whitespace is trimmed.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else if trimmed.len() == v.len() {
                    Some(Self(v))
                } else {
                    Some(Self(trimmed.to_string()))
                }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id! {
    /// The idempotency key of an [`crate::Event`].
    ///
    /// Supplied by the caller (envelope `id` or `Idempotency-Key` header) or
    /// derived from a content hash. Unique across the registry.
    EventId
}

string_id! {
    /// The caller-declared type of an event (e.g. `"message"`, `"workflow.completed"`).
    ///
    /// Used as the routing key when resolving a [`TargetEndpoint`].
    EventType
}

// ---------------------------------------------------------------------------

/// Identifies a single delivery task.
///
/// Generated fresh by the registry for every accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a new random task identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a task identifier from its hyphenated string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------

/// Absolute `http` or `https` URL that a task's payload is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetEndpoint(String);

impl TargetEndpoint {
    /// Creates a target endpoint, returning `None` unless `value` is an
    /// absolute `http://` or `https://` URL with a non-empty host.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        let rest = v
            .strip_prefix("http://")
            .or_else(|| v.strip_prefix("https://"))?;
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() || v.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self(v))
    }

    /// Returns the URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TargetEndpoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.clone()).ok_or_else(|| format!("not an absolute http(s) URL: '{value}'"))
    }
}

impl From<TargetEndpoint> for String {
    fn from(value: TargetEndpoint) -> Self {
        value.0
    }
}

impl std::fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

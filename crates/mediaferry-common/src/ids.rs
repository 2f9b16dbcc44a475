//! Typed ID wrappers for type safety across mediaferry.
//!
//! Stream and sticker ids are opaque strings handed in by callers; the
//! newtypes keep them from being mixed up with each other or with the
//! resource keys the range interceptor derives from request paths.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id! {
    /// Identifier of one playback stream session.
    StreamId
}

string_id! {
    /// Identifier of an animated sticker whose frames are being cached.
    StickerId
}

/// Normalized key used to coalesce pending range requests for one resource.
///
/// Derived from the last non-empty segment of a request path, with any
/// query string or fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a key from an already-normalized string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from a request path such as `/stream/doc_42?range=1`.
    ///
    /// Returns `None` when the path has no usable segment.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        path.split('/')
            .rev()
            .find(|segment| !segment.is_empty())
            .map(|segment| Self(segment.to_owned()))
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

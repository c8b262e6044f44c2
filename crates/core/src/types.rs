//! Identifier and handle types
//!
//! Engine-owned identifiers (`TimelineId`, `SnapshotId`) are UUID v4
//! newtypes. Provider-owned handles (`ForkRef`, `SnapshotRef`) are opaque
//! strings minted by the storage provider; the engine never interprets them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier using UUID v4
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from raw bytes
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Parse an identifier from its string representation
            ///
            /// Returns None if the string is not a valid UUID.
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Get the raw bytes of this identifier
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a timeline
    ///
    /// Ordering is the byte order of the underlying UUID. The engine relies on
    /// it to acquire multiple per-timeline locks in a fixed global order.
    TimelineId
);

uuid_id!(
    /// Unique identifier for a snapshot
    SnapshotId
);

macro_rules! provider_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wrap a provider-issued handle
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// The raw handle as issued by the provider
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

provider_handle!(
    /// Ownership token for a live provider-side fork
    ///
    /// A timeline record exclusively owns its `ForkRef`; only the fork manager
    /// creates or drops one.
    ForkRef
);

provider_handle!(
    /// Handle to an immutable provider-side snapshot
    SnapshotRef
);

/// A readable database state on the provider side
///
/// Forks can be created from any `DataRef`, and diffs are computed between
/// two of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataRef {
    /// Fresh, empty base state
    Base,
    /// Current contents of a live fork
    Fork(ForkRef),
    /// Contents captured by a snapshot
    Snapshot(SnapshotRef),
}

impl fmt::Display for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataRef::Base => f.write_str("base"),
            DataRef::Fork(fork) => write!(f, "fork:{}", fork),
            DataRef::Snapshot(snapshot) => write!(f, "snapshot:{}", snapshot),
        }
    }
}

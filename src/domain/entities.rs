//! Domain entities mirrored from the document store.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned revision of a document.
///
/// Revisions are strictly monotonic per key and are consumed by removals as
/// well as writes, so a delete is ordered against the writes around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A document as returned by the store: opaque payload plus its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub value: Bytes,
    pub version: Version,
}

impl Document {
    pub fn new(value: impl Into<Bytes>, version: Version) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Identity of a running service instance.
///
/// Stamped on every published change event so receivers can tell their own
/// echoes apart from writes made elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

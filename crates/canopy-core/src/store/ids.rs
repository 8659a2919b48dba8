use derive_more::Display;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

///
/// ElementId
///
/// Store-local identifier of a data element. Allocated sequentially by the
/// owning store; never reused within one store lifetime.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ElementId(pub u32);

impl ElementId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

///
/// PathId
///
/// Interned identifier of an attribute path. Shared across all stores that
/// hang off the same `PathAllocator`.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct PathId(pub u32);

impl PathId {
    /// The preallocated root path. Never released.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

///
/// IndexerId
///
/// Identifies one indexer instance (a source store or a merge target) within
/// an engine. Used for mapping registration and cycle detection.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct IndexerId(pub u32);

///
/// GroupId
///
/// Identifies a merge group within one merge indexer. Recorded on target
/// data elements so removals and identity updates can find their group.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct GroupId(pub u32);

///
/// IdentificationId
///
/// Identifies one identification (an identity assignment overlay) defined on
/// an indexer. Identification `None` everywhere means the base identity.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct IdentificationId(pub u32);

///
/// Identity
///
/// Opaque identity value of a data element. Defaults to the element's own id
/// lifted into identity space; identifications may override it per element.
///

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[display("#{_0:x}")]
pub struct Identity(pub u64);

impl Identity {
    /// The default identity of an element: its own id, tagged so it cannot
    /// collide with hashed value or label identities.
    #[must_use]
    pub const fn of_element(id: ElementId) -> Self {
        Self((1u64 << 32) | id.0 as u64)
    }

    /// Identity derived from an opaque label (tests and identification
    /// overlays).
    #[must_use]
    pub fn of_label(label: &str) -> Self {
        Self(xxh3_64(label.as_bytes()))
    }

    /// Identity derived from raw bytes (node value hashing).
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(xxh3_64(bytes))
    }
}

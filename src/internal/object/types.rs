//! Object type enumeration shared across the object and pack modules.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value, which is used
/// to identify the type of the object in pack entries.
///
/// * `Commit` (1): the snapshot of a project at a point in time.
/// * `Tree` (2): a directory listing of blobs and subtrees.
/// * `Blob` (3): raw file content.
/// * `Tag` (4): an annotated mark on a specific object.
/// * `OffsetDelta` (6): a delta whose base is referenced by in-pack offset.
/// * `HashDelta` (7): a delta whose base is referenced by absolute id.
///
/// Type code 5 is reserved by the pack format and always rejected.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
    Tag,
    OffsetDelta = 6,
    HashDelta = 7,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::OffsetDelta => write!(f, "OffsetDelta"),
            ObjectType::HashDelta => write!(f, "HashDelta"),
        }
    }
}

impl ObjectType {
    /// Canonical ASCII name used in the object frame (`"commit"`, `"tree"`, ...).
    ///
    /// Only base types have a frame name; delta kinds never appear in a frame.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => b"commit",
            ObjectType::Tree => b"tree",
            ObjectType::Blob => b"blob",
            ObjectType::Tag => b"tag",
            ObjectType::OffsetDelta | ObjectType::HashDelta => {
                unreachable!("delta kinds have no frame name")
            }
        }
    }

    /// Parses a string representation of a Git object type.
    pub fn from_string(s: &str) -> Result<ObjectType, GitError> {
        match s {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }

    /// Convert an object type to its 3-bit pack header code.
    pub fn to_u8(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
            ObjectType::OffsetDelta => 6,
            ObjectType::HashDelta => 7,
        }
    }

    /// Convert a 3-bit pack header code to an object type.
    pub fn from_u8(number: u8) -> Result<ObjectType, GitError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(GitError::InvalidObjectType(format!(
                "Invalid pack object type number: {number}"
            ))),
        }
    }

    /// Whether the type is a base object rather than a delta.
    pub fn is_base(&self) -> bool {
        !matches!(self, ObjectType::OffsetDelta | ObjectType::HashDelta)
    }
}

//! Lightweight representation of a decoded Git object coming out of a pack
//! stream, with helpers to convert to/from strongly typed objects.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{
    hash::ObjectHash,
    internal::object::{
        ObjectTrait, blob::Blob, commit::Commit, tag::Tag, tree::Tree, types::ObjectType,
    },
};

///
/// Git object data from pack file
///
#[derive(Eq, Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub hash: ObjectHash,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.obj_type == other.obj_type && self.hash == other.hash
    }
}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.obj_type.hash(state);
        self.hash.hash(state);
    }
}

impl Entry {
    /// Build an entry from a raw base object body, computing its id.
    pub fn from_raw(obj_type: ObjectType, data: Vec<u8>) -> Self {
        let hash = ObjectHash::from_type_and_data(obj_type, &data);
        Self {
            obj_type,
            data,
            hash,
        }
    }
}

impl From<Blob> for Entry {
    fn from(value: Blob) -> Self {
        Self {
            obj_type: ObjectType::Blob,
            hash: value.id,
            data: value.data,
        }
    }
}

impl From<Commit> for Entry {
    fn from(value: Commit) -> Self {
        Self {
            obj_type: ObjectType::Commit,
            data: value.to_data().expect("commit encoding is infallible"),
            hash: value.id,
        }
    }
}

impl From<Tree> for Entry {
    fn from(value: Tree) -> Self {
        Self {
            obj_type: ObjectType::Tree,
            data: value.to_data().expect("tree encoding is infallible"),
            hash: value.id,
        }
    }
}

impl From<Tag> for Entry {
    fn from(value: Tag) -> Self {
        Self {
            obj_type: ObjectType::Tag,
            data: value.to_data().expect("tag encoding is infallible"),
            hash: value.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Entry equality is (type, id); the body does not participate.
    #[test]
    fn test_entry_identity() {
        let a = Entry::from(Blob::from_content("same"));
        let b = Entry::from(Blob::from_content("same"));
        assert_eq!(a, b);

        let c = Entry::from_raw(ObjectType::Blob, b"other".to_vec());
        assert_ne!(a, c);
    }

    /// from_raw computes the framed hash.
    #[test]
    fn test_from_raw_hash() {
        let entry = Entry::from_raw(ObjectType::Blob, b"hello world\n".to_vec());
        assert_eq!(
            entry.hash.to_string(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }
}

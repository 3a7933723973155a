//! Object model definitions for Git blobs, trees, commits, and tags, plus the
//! trait that lets the pack and storage layers create strongly typed values
//! from raw bytes.
pub mod blob;
pub mod commit;
pub mod signature;
pub mod tag;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::GitError, hash::ObjectHash, internal::object::types::ObjectType};

/// **The Object Trait**
/// Defines the common interface for all Git object types, including blobs,
/// trees, commits, and tags.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from a byte slice.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError>
    where
        Self: Sized;

    /// Returns the type of the object.
    fn get_type(&self) -> ObjectType;

    fn get_size(&self) -> usize;

    fn to_data(&self) -> Result<Vec<u8>, GitError>;

    /// Computes the object hash from serialized data.
    ///
    /// Default implementation serializes the object and computes the hash from
    /// that data. Override only if you need custom hash computation or caching.
    fn object_hash(&self) -> Result<ObjectHash, GitError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(self.get_type(), &data))
    }
}

/// Integrity predicate for externally produced objects: the body must hash to
/// the id it was stored under.
pub fn verify_object(id: ObjectHash, obj_type: ObjectType, body: &[u8]) -> Result<(), GitError> {
    let computed = ObjectHash::from_type_and_data(obj_type, body);
    if computed != id {
        return Err(GitError::ObjectIntegrity {
            id: id.to_string(),
            computed: computed.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::blob::Blob;

    /// verify_object accepts matching bodies and rejects tampered ones.
    #[test]
    fn test_verify_object() {
        let blob = Blob::from_content("hello\n");
        assert!(verify_object(blob.id, ObjectType::Blob, &blob.data).is_ok());
        assert!(verify_object(blob.id, ObjectType::Blob, b"tampered").is_err());
    }
}

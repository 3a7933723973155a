//! SHA-1 object identities. Every object is addressed by the hash of its
//! framed form `"<type> <size>\0<body>"`; refs and the wire protocol carry the
//! 40-hex lowercase rendering.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::internal::object::types::ObjectType;

/// Byte length of an object id.
pub const HASH_SIZE: usize = 20;
/// Hex string length of an object id.
pub const HASH_HEX_LEN: usize = 40;
/// The all-zero id, used on the wire for "ref does not exist".
pub const ZERO_ID: &str = "0000000000000000000000000000000000000000";

/// Concrete object id: the SHA-1 of an object's framed encoding.
///
/// Supports conversion to/from hex strings, byte slices, and stream reading.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct ObjectHash(pub [u8; HASH_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parse 40-hex into `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err("Invalid hash length".to_string());
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&bytes);
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// Whether this is the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Compute the SHA-1 of raw data.
    pub fn new(data: &[u8]) -> ObjectHash {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        ObjectHash(bytes)
    }

    /// Hash an object body under its canonical frame `"<type> <size>\0<body>"`.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut hasher = Sha1::new();
        hasher.update(object_type.to_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\x00");
        hasher.update(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&hasher.finalize());
        ObjectHash(bytes)
    }

    /// Create `ObjectHash` from a raw 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, String> {
        if bytes.len() != HASH_SIZE {
            return Err(format!(
                "Invalid byte length: got {}, expected {}",
                bytes.len(),
                HASH_SIZE
            ));
        }
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Read 20 hash bytes from a stream.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut h = [0u8; HASH_SIZE];
        data.read_exact(&mut h)?;
        Ok(ObjectHash(h))
    }

    /// Return raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{ObjectHash, ZERO_ID};
    use crate::internal::object::types::ObjectType;

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_sha1_new() {
        let data = "Hello, world!".as_bytes();
        let sha1 = ObjectHash::new(data);
        let expected = "943a702d06f34599aee1f8da8ef9f7296031d699";
        assert_eq!(sha1.to_string(), expected);
    }

    /// Framed blob hashing matches `git hash-object`.
    #[test]
    fn test_framed_blob_hash() {
        // echo 'hello world' | git hash-object --stdin
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"hello world\n");
        assert_eq!(id.to_string(), "3b18e512dba79e4c8300dd08aeb37f8e728b8dad");
    }

    /// Construct from raw bytes and round-trip through hex.
    #[test]
    fn test_from_bytes() {
        let sha1 = ObjectHash::from_bytes(&[
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ])
        .unwrap();
        assert_eq!(sha1.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
        assert_eq!(
            ObjectHash::from_str("8ab686eafeb1f44702738c8b0f24f2567c36da6d").unwrap(),
            sha1
        );
    }

    /// Wrong-length input is rejected.
    #[test]
    fn test_invalid_length() {
        assert!(ObjectHash::from_bytes(&[0u8; 19]).is_err());
        assert!(ObjectHash::from_str("abcdef").is_err());
    }

    /// Read hash bytes from a stream.
    #[test]
    fn test_from_stream() {
        let source = [
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ];
        let mut reader = std::io::Cursor::new(source);
        let sha1 = ObjectHash::from_stream(&mut reader).unwrap();
        assert_eq!(sha1.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
    }

    /// The zero id renders as forty zeros and reports is_zero.
    #[test]
    fn test_zero_id() {
        let zero = ObjectHash::default();
        assert_eq!(zero.to_string(), ZERO_ID);
        assert!(zero.is_zero());
        assert!(!ObjectHash::new(b"x").is_zero());
    }
}

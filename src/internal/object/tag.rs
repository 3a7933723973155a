//! The Tag object is an annotated mark on another object, almost always a
//! commit: target id and type, tag name, tagger identity, and message.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::signature::Signature;
use crate::internal::object::types::ObjectType;

/// An annotated tag: headered text with `object`, `type`, `tag`, `tagger`
/// lines, then a blank line, then the message.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: ObjectHash,
    pub object_hash: ObjectHash,
    pub object_type: ObjectType,
    pub tag_name: String,
    pub tagger: Signature,
    pub message: String,
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "object {}", self.object_hash)?;
        writeln!(f, "type {}", self.object_type)?;
        writeln!(f, "tag {}", self.tag_name)?;
        writeln!(f, "tagger {}", self.tagger)?;
        writeln!(f, "{}", self.message)
    }
}

impl Tag {
    pub fn new(
        object_hash: ObjectHash,
        object_type: ObjectType,
        tag_name: String,
        tagger: Signature,
        message: String,
    ) -> Result<Tag, GitError> {
        let mut tag = Tag {
            id: ObjectHash::default(),
            object_hash,
            object_type,
            tag_name,
            tagger,
            message,
        };
        tag.id = ObjectHash::from_type_and_data(ObjectType::Tag, &tag.to_data()?);
        Ok(tag)
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let invalid = |what: &str| GitError::InvalidTagObject(what.to_string());

        let mut rest = data;
        let mut object_hash = None;
        let mut object_type = None;
        let mut tag_name = None;
        let mut tagger = None;

        // Header lines until the blank separator.
        loop {
            let line_end = rest.find_byte(0x0a).ok_or_else(|| invalid("no message"))?;
            let line = &rest[..line_end];
            rest = &rest[line_end + 1..];
            if line.is_empty() {
                break;
            }

            if let Some(v) = line.strip_prefix(b"object ") {
                object_hash = Some(
                    ObjectHash::from_str(
                        std::str::from_utf8(v).map_err(|_| invalid("object id not utf-8"))?,
                    )
                    .map_err(GitError::InvalidHashValue)?,
                );
            } else if let Some(v) = line.strip_prefix(b"type ") {
                object_type = Some(ObjectType::from_string(
                    std::str::from_utf8(v).map_err(|_| invalid("type not utf-8"))?,
                )?);
            } else if let Some(v) = line.strip_prefix(b"tag ") {
                tag_name = Some(String::from_utf8_lossy(v).to_string());
            } else if line.starts_with(b"tagger ") {
                tagger = Some(Signature::from_data(line.to_vec())?);
            }
            // Unknown headers (e.g. gpgsig continuation) are skipped.
        }

        Ok(Tag {
            id: hash,
            object_hash: object_hash.ok_or_else(|| invalid("missing object header"))?,
            object_type: object_type.ok_or_else(|| invalid("missing type header"))?,
            tag_name: tag_name.ok_or_else(|| invalid("missing tag header"))?,
            tagger: tagger.ok_or_else(|| invalid("missing tagger header"))?,
            message: String::from_utf8_lossy(rest).to_string(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn get_size(&self) -> usize {
        0
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        data.extend(b"object ");
        data.extend(self.object_hash.to_string().as_bytes());
        data.extend(&[0x0a]);
        data.extend(b"type ");
        data.extend(self.object_type.to_string().as_bytes());
        data.extend(&[0x0a]);
        data.extend(b"tag ");
        data.extend(self.tag_name.as_bytes());
        data.extend(&[0x0a]);
        data.extend(self.tagger.to_data()?);
        data.extend(&[0x0a]);
        data.extend(&[0x0a]);
        data.extend(self.message.as_bytes());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::signature::SignatureType;

    fn sample_tag() -> Tag {
        let tagger = Signature::from_data(
            b"tagger releaser <rel@example.com> 1712000000 +0000".to_vec(),
        )
        .unwrap();
        Tag::new(
            ObjectHash::new(b"some commit"),
            ObjectType::Commit,
            "v1.0".to_string(),
            tagger,
            "first release\n".to_string(),
        )
        .unwrap()
    }

    /// Tag body round-trips through parse and re-encode.
    #[test]
    fn test_round_trip() {
        let tag = sample_tag();
        let body = tag.to_data().unwrap();
        let parsed = Tag::from_bytes(&body, tag.id).unwrap();
        assert_eq!(parsed.tag_name, "v1.0");
        assert_eq!(parsed.object_type, ObjectType::Commit);
        assert_eq!(parsed.tagger.signature_type, SignatureType::Tagger);
        assert_eq!(parsed.message, "first release\n");
        assert_eq!(parsed.to_data().unwrap(), body);
        assert_eq!(parsed.object_hash().unwrap(), tag.id);
    }

    /// Tags missing mandatory headers are rejected.
    #[test]
    fn test_missing_headers() {
        let hash = ObjectHash::default();
        assert!(Tag::from_bytes(b"object deadbeef\n\nmsg", hash).is_err());
        assert!(Tag::from_bytes(b"tag v1\n\nmsg", hash).is_err());
    }
}

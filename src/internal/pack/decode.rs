//! Pack stream decoder: parses a contiguous v2 pack buffer into base objects,
//! resolving OFS_DELTA entries against earlier entries and REF_DELTA entries
//! against earlier entries or the backing store.

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt};
use sha1::{Digest, Sha1};

use crate::{
    delta::delta_decode,
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::{
        object::types::ObjectType,
        pack::{PACK_MAGIC, PACK_VERSION, entry::Entry},
        zlib::inflate_with_consumed,
    },
};

/// Resolves REF_DELTA bases that are not earlier entries of the same pack.
///
/// The store-backed implementation suspends on segment I/O; the decode loop
/// itself is pure computation between resolver calls.
#[async_trait]
pub trait DeltaBaseResolver: Send + Sync {
    /// Fetch `(type, body)` for a base object already in storage, or `None`
    /// when the store has never seen it.
    async fn resolve_base(
        &self,
        hash: &ObjectHash,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>;
}

/// Resolver for self-contained packs: every base must be an earlier entry.
pub struct NoExternalBases;

#[async_trait]
impl DeltaBaseResolver for NoExternalBases {
    async fn resolve_base(
        &self,
        _hash: &ObjectHash,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, GitError> {
        Ok(None)
    }
}

/// Outcome of decoding a pack: the base objects in pack order and the
/// verified trailer id.
#[derive(Debug)]
pub struct DecodedPack {
    pub entries: Vec<Entry>,
    pub signature: ObjectHash,
}

/// Decode a complete v2 pack held in memory.
///
/// Every failure mode is fatal for the enclosing push: bad magic, unsupported
/// version, entry count mismatch, zlib errors, unresolved delta bases, delta
/// size mismatches, reserved type codes, and trailer checksum mismatch.
pub async fn decode_pack(
    data: &[u8],
    resolver: &impl DeltaBaseResolver,
) -> Result<DecodedPack, GitError> {
    let object_count = check_header(data)?;

    if data.len() < 12 + HASH_SIZE {
        return Err(GitError::InvalidPackFile("pack truncated".to_string()));
    }
    let trailer_start = data.len() - HASH_SIZE;

    let mut entries: Vec<Entry> = Vec::with_capacity(object_count as usize);
    // Offset of each decoded entry, for OFS_DELTA back-references.
    let mut by_offset: HashMap<usize, usize> = HashMap::new();
    let mut pos = 12usize;

    for _ in 0..object_count {
        if pos >= trailer_start {
            return Err(GitError::InvalidPackFile(
                "entry count mismatch: stream ended early".to_string(),
            ));
        }
        let entry_offset = pos;
        let (type_code, size, header_len) = read_entry_header(&data[pos..trailer_start])?;
        pos += header_len;

        let obj_type = ObjectType::from_u8(type_code)?;
        let entry = match obj_type {
            ObjectType::Commit | ObjectType::Tree | ObjectType::Blob | ObjectType::Tag => {
                let (body, consumed) = inflate_with_consumed(&data[pos..trailer_start], size)?;
                pos += consumed;
                if body.len() != size {
                    return Err(GitError::InvalidPackFile(format!(
                        "entry size mismatch: header declared {size}, inflated {}",
                        body.len()
                    )));
                }
                Entry::from_raw(obj_type, body)
            }
            ObjectType::OffsetDelta => {
                let (distance, ofs_len) = read_offset_encoding(&data[pos..trailer_start])?;
                pos += ofs_len;
                let base_offset = entry_offset.checked_sub(distance).ok_or_else(|| {
                    GitError::UnresolvedDeltaBase(format!(
                        "offset {distance} reaches before the pack start"
                    ))
                })?;
                let base_idx = *by_offset.get(&base_offset).ok_or_else(|| {
                    GitError::UnresolvedDeltaBase(format!(
                        "no entry at pack offset {base_offset}"
                    ))
                })?;
                let (base_type, base_body) =
                    (entries[base_idx].obj_type, entries[base_idx].data.clone());

                let (delta, consumed) = inflate_with_consumed(&data[pos..trailer_start], size)?;
                pos += consumed;
                let body = delta_decode(&mut Cursor::new(delta), &base_body)?;
                Entry::from_raw(base_type, body)
            }
            ObjectType::HashDelta => {
                if pos + HASH_SIZE > trailer_start {
                    return Err(GitError::InvalidPackFile(
                        "truncated ref-delta base id".to_string(),
                    ));
                }
                let base_id = ObjectHash::from_bytes(&data[pos..pos + HASH_SIZE])
                    .map_err(GitError::InvalidHashValue)?;
                pos += HASH_SIZE;

                // Earlier pack entries win; otherwise ask the store.
                let in_pack = entries
                    .iter()
                    .find(|e| e.hash == base_id)
                    .map(|e| (e.obj_type, e.data.clone()));
                let (base_type, base_body) = match in_pack {
                    Some(found) => found,
                    None => resolver.resolve_base(&base_id).await?.ok_or_else(|| {
                        GitError::UnresolvedDeltaBase(format!("base object {base_id} not found"))
                    })?,
                };

                let (delta, consumed) = inflate_with_consumed(&data[pos..trailer_start], size)?;
                pos += consumed;
                let body = delta_decode(&mut Cursor::new(delta), &base_body)?;
                Entry::from_raw(base_type, body)
            }
        };

        by_offset.insert(entry_offset, entries.len());
        entries.push(entry);
    }

    if pos != trailer_start {
        return Err(GitError::InvalidPackFile(format!(
            "entry count mismatch: {} trailing bytes before checksum",
            trailer_start - pos
        )));
    }

    // Trailer: SHA-1 over all preceding bytes.
    let computed = ObjectHash::from_bytes(&Sha1::digest(&data[..trailer_start]))
        .map_err(GitError::InvalidHashValue)?;
    let expected = ObjectHash::from_bytes(&data[trailer_start..])
        .map_err(GitError::InvalidHashValue)?;
    if computed != expected {
        return Err(GitError::PackChecksumMismatch {
            expected: expected.to_string(),
            computed: computed.to_string(),
        });
    }

    tracing::debug!(
        objects = entries.len(),
        signature = %computed,
        "decoded pack stream"
    );

    Ok(DecodedPack {
        entries,
        signature: computed,
    })
}

/// Validate `PACK`, version 2, and return the declared object count.
fn check_header(data: &[u8]) -> Result<u32, GitError> {
    if data.len() < 12 {
        return Err(GitError::InvalidPackHeader("header truncated".to_string()));
    }
    if &data[0..4] != PACK_MAGIC {
        return Err(GitError::InvalidPackHeader(format!(
            "bad magic {:02x?}",
            &data[0..4]
        )));
    }
    let mut cursor = Cursor::new(&data[4..12]);
    let version = cursor
        .read_u32::<BigEndian>()
        .map_err(GitError::IOError)?;
    if version != PACK_VERSION {
        return Err(GitError::InvalidPackHeader(format!(
            "unsupported version {version}"
        )));
    }
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(GitError::IOError)?;
    Ok(count)
}

/// Read the Git variable-length type+size entry header.
///
/// First byte: `[msb | type:3 | size:4]`; each continuation byte contributes
/// 7 more size bits.
fn read_entry_header(data: &[u8]) -> Result<(u8, usize, usize), GitError> {
    let mut iter = data.iter();
    let first = *iter
        .next()
        .ok_or_else(|| GitError::InvalidPackFile("truncated entry header".to_string()))?;
    let type_code = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4u32;
    let mut len = 1usize;

    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *iter
            .next()
            .ok_or_else(|| GitError::InvalidPackFile("truncated entry header".to_string()))?;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        len += 1;
        if shift > usize::BITS {
            return Err(GitError::InvalidPackFile(
                "entry size varint overflows".to_string(),
            ));
        }
    }
    Ok((type_code, size, len))
}

/// Read the OFS_DELTA base-offset varint. Unlike the size encoding, each
/// continuation adds 1 before shifting 7 bits; this is not a standard LEB128.
fn read_offset_encoding(data: &[u8]) -> Result<(usize, usize), GitError> {
    let mut iter = data.iter();
    let mut byte = *iter
        .next()
        .ok_or_else(|| GitError::InvalidPackFile("truncated ofs-delta offset".to_string()))?;
    let mut value = (byte & 0x7f) as usize;
    let mut len = 1usize;
    while byte & 0x80 != 0 {
        byte = *iter
            .next()
            .ok_or_else(|| GitError::InvalidPackFile("truncated ofs-delta offset".to_string()))?;
        value = ((value + 1) << 7) | (byte & 0x7f) as usize;
        len += 1;
        if len > 10 {
            return Err(GitError::InvalidPackFile(
                "ofs-delta offset varint overflows".to_string(),
            ));
        }
    }
    Ok((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::write_size_encoding;
    use crate::internal::pack::tests::init_logger;
    use crate::internal::zlib::deflate;

    /// Append one non-delta entry (type+size header then zlib body).
    pub(crate) fn push_base_entry(pack: &mut Vec<u8>, obj_type: ObjectType, body: &[u8]) {
        push_entry_header(pack, obj_type.to_u8(), body.len());
        pack.extend(deflate(body).unwrap());
    }

    fn push_entry_header(pack: &mut Vec<u8>, type_code: u8, mut size: usize) {
        let mut byte = ((type_code & 0x07) << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size > 0 {
            pack.push(byte | 0x80);
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        pack.push(byte);
    }

    fn push_offset_encoding(pack: &mut Vec<u8>, mut value: usize) {
        let mut bytes = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            value -= 1;
            bytes.push((value & 0x7f) as u8 | 0x80);
            value >>= 7;
        }
        bytes.reverse();
        pack.extend(bytes);
    }

    pub(crate) fn start_pack(count: u32) -> Vec<u8> {
        let mut pack = Vec::new();
        pack.extend(PACK_MAGIC);
        pack.extend(PACK_VERSION.to_be_bytes());
        pack.extend(count.to_be_bytes());
        pack
    }

    pub(crate) fn finish_pack(mut pack: Vec<u8>) -> Vec<u8> {
        let digest = Sha1::digest(&pack);
        pack.extend(digest);
        pack
    }

    /// A pack of plain base entries decodes into entries with canonical ids.
    #[tokio::test]
    async fn test_decode_base_entries() {
        init_logger();
        let mut pack = start_pack(2);
        push_base_entry(&mut pack, ObjectType::Blob, b"hello world\n");
        push_base_entry(&mut pack, ObjectType::Blob, b"second blob");
        let pack = finish_pack(pack);

        let decoded = decode_pack(&pack, &NoExternalBases).await.unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(
            decoded.entries[0].hash.to_string(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
        assert_eq!(decoded.entries[1].data, b"second blob");
    }

    /// OFS_DELTA entries resolve against the earlier entry at the encoded
    /// offset: base "hello\n" plus a delta producing "hello world\n".
    #[tokio::test]
    async fn test_decode_ofs_delta() {
        let base = b"hello\n";
        let target = b"hello world\n";

        let mut pack = start_pack(2);
        let base_offset = pack.len();
        push_base_entry(&mut pack, ObjectType::Blob, base);

        // delta: copy 5 bytes ("hello"), insert " world\n"
        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, target.len());
        delta.push(0x80 | 0b0001_0000);
        delta.push(5);
        delta.push(7);
        delta.extend_from_slice(b" world\n");

        let delta_offset = pack.len();
        push_entry_header(&mut pack, 6, delta.len());
        push_offset_encoding(&mut pack, delta_offset - base_offset);
        pack.extend(deflate(&delta).unwrap());
        let pack = finish_pack(pack);

        let decoded = decode_pack(&pack, &NoExternalBases).await.unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].obj_type, ObjectType::Blob);
        assert_eq!(decoded.entries[1].data, target);
        assert_eq!(
            decoded.entries[1].hash,
            ObjectHash::from_type_and_data(ObjectType::Blob, target)
        );
    }

    /// REF_DELTA entries resolve against an earlier entry by id, and fall
    /// back to the resolver; missing bases abort.
    #[tokio::test]
    async fn test_decode_ref_delta() {
        let base = b"hello\n";
        let base_id = ObjectHash::from_type_and_data(ObjectType::Blob, base);

        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, 6);
        delta.push(0x80 | 0b0001_0000);
        delta.push(6);

        let mut pack = start_pack(2);
        push_base_entry(&mut pack, ObjectType::Blob, base);
        push_entry_header(&mut pack, 7, delta.len());
        pack.extend(base_id.as_ref());
        pack.extend(deflate(&delta).unwrap());
        let pack = finish_pack(pack);

        let decoded = decode_pack(&pack, &NoExternalBases).await.unwrap();
        assert_eq!(decoded.entries[1].data, base);

        // Same delta with an unknown base id fails.
        let mut pack = start_pack(1);
        push_entry_header(&mut pack, 7, delta.len());
        pack.extend(ObjectHash::new(b"missing").as_ref());
        pack.extend(deflate(&delta).unwrap());
        let pack = finish_pack(pack);
        let err = decode_pack(&pack, &NoExternalBases).await.unwrap_err();
        assert!(matches!(err, GitError::UnresolvedDeltaBase(_)));
    }

    /// Bad magic, bad version, and the reserved type code are all fatal.
    #[tokio::test]
    async fn test_decode_header_failures() {
        let err = decode_pack(b"JUNK", &NoExternalBases).await.unwrap_err();
        assert!(matches!(err, GitError::InvalidPackHeader(_)));

        let mut pack = Vec::new();
        pack.extend(PACK_MAGIC);
        pack.extend(3u32.to_be_bytes());
        pack.extend(0u32.to_be_bytes());
        let pack = finish_pack(pack);
        let err = decode_pack(&pack, &NoExternalBases).await.unwrap_err();
        assert!(matches!(err, GitError::InvalidPackHeader(_)));

        // Reserved type code 5.
        let mut pack = start_pack(1);
        push_entry_header(&mut pack, 5, 4);
        pack.extend(deflate(b"data").unwrap());
        let pack = finish_pack(pack);
        let err = decode_pack(&pack, &NoExternalBases).await.unwrap_err();
        assert!(matches!(err, GitError::InvalidObjectType(_)));
    }

    /// A corrupted trailer is detected.
    #[tokio::test]
    async fn test_decode_checksum_mismatch() {
        let mut pack = start_pack(1);
        push_base_entry(&mut pack, ObjectType::Blob, b"payload");
        let mut pack = finish_pack(pack);
        let len = pack.len();
        pack[len - 1] ^= 0xff;

        let err = decode_pack(&pack, &NoExternalBases).await.unwrap_err();
        assert!(matches!(err, GitError::PackChecksumMismatch { .. }));
    }

    /// Declaring more entries than the stream holds is an entry count error.
    #[tokio::test]
    async fn test_decode_count_mismatch() {
        let mut pack = start_pack(3);
        push_base_entry(&mut pack, ObjectType::Blob, b"only one");
        let pack = finish_pack(pack);

        let err = decode_pack(&pack, &NoExternalBases).await.unwrap_err();
        assert!(err.to_string().contains("entry count mismatch"));
    }
}

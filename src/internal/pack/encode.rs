//! Pack stream encoder. Output packs carry no deltas: every entry is written
//! as a plain type+size header followed by its zlib-deflated body, with the
//! mandatory trailer SHA-1 over all preceding bytes.

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::{
    errors::GitError,
    internal::{
        pack::{PACK_MAGIC, PACK_VERSION, entry::Entry},
        zlib::deflate,
    },
};

/// Streaming pack encoder feeding chunks into an mpsc channel, one chunk per
/// entry. The consumer side is typically wrapped into a `ReceiverStream` by
/// the protocol layer.
pub struct PackEncoder {
    object_number: usize,
    sender: mpsc::Sender<Vec<u8>>,
}

impl PackEncoder {
    pub fn new(object_number: usize, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            object_number,
            sender,
        }
    }

    /// Encode entries from the receiver until it closes, streaming pack bytes
    /// out. Fails if the entry count differs from the declared object number.
    pub async fn encode(mut self, mut rx: mpsc::Receiver<Entry>) -> Result<(), GitError> {
        let mut hasher = Sha1::new();
        let mut sent = 0usize;

        let header = pack_header(self.object_number as u32);
        hasher.update(&header);
        self.send(header).await?;

        while let Some(entry) = rx.recv().await {
            let chunk = encode_entry(&entry)?;
            hasher.update(&chunk);
            self.send(chunk).await?;
            sent += 1;
        }

        if sent != self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "declared {} objects but encoded {sent}",
                self.object_number
            )));
        }

        let trailer = hasher.finalize().to_vec();
        self.send(trailer).await?;
        Ok(())
    }

    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), GitError> {
        self.sender
            .send(chunk)
            .await
            .map_err(|_| GitError::PackEncodeError("pack consumer dropped".to_string()))
    }
}

/// Encode a whole pack into one buffer; the non-streaming path used by tests
/// and small fetches.
pub fn encode_pack_to_vec(entries: &[Entry]) -> Result<Vec<u8>, GitError> {
    let mut pack = pack_header(entries.len() as u32);
    for entry in entries {
        pack.extend(encode_entry(entry)?);
    }
    let digest = Sha1::digest(&pack);
    pack.extend_from_slice(&digest);
    Ok(pack)
}

fn pack_header(count: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(12);
    header.extend(PACK_MAGIC);
    header.extend(PACK_VERSION.to_be_bytes());
    header.extend(count.to_be_bytes());
    header
}

/// One entry: variable-length type+size header, then the deflated body.
fn encode_entry(entry: &Entry) -> Result<Vec<u8>, GitError> {
    if !entry.obj_type.is_base() {
        return Err(GitError::PackEncodeError(format!(
            "output packs carry no deltas, got {}",
            entry.obj_type
        )));
    }

    let mut out = Vec::new();
    let mut size = entry.data.len();
    let mut byte = ((entry.obj_type.to_u8() & 0x07) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);

    out.extend(deflate(&entry.data)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::{blob::Blob, tree::Tree};
    use crate::internal::pack::decode::{NoExternalBases, decode_pack};
    use crate::internal::object::types::ObjectType;

    /// Encoded packs decode back to the same objects with matching ids.
    #[tokio::test]
    async fn test_encode_decode_round_trip() {
        let blob = Blob::from_content("hello world\n");
        let tree = Tree::from_tree_items(vec![]).unwrap();
        let entries = vec![Entry::from(blob.clone()), Entry::from(tree.clone())];

        let pack = encode_pack_to_vec(&entries).unwrap();
        let decoded = decode_pack(&pack, &NoExternalBases).await.unwrap();

        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].hash, blob.id);
        assert_eq!(decoded.entries[1].hash, tree.id);
    }

    /// The streaming encoder produces the same bytes as the vec encoder.
    #[tokio::test]
    async fn test_streaming_matches_vec() {
        let entries = vec![
            Entry::from(Blob::from_content("alpha")),
            Entry::from(Blob::from_content("beta")),
        ];
        let expected = encode_pack_to_vec(&entries).unwrap();

        let (pack_tx, mut pack_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(16);
        let encoder = PackEncoder::new(entries.len(), pack_tx);
        let task = tokio::spawn(async move { encoder.encode(entry_rx).await });
        for entry in entries {
            entry_tx.send(entry).await.unwrap();
        }
        drop(entry_tx);

        let mut streamed = Vec::new();
        while let Some(chunk) = pack_rx.recv().await {
            streamed.extend(chunk);
        }
        task.await.unwrap().unwrap();
        assert_eq!(streamed, expected);
    }

    /// An entry of the wrong arity fails the declared count check.
    #[tokio::test]
    async fn test_count_mismatch() {
        let (pack_tx, mut pack_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel::<Entry>(16);
        let encoder = PackEncoder::new(2, pack_tx);
        drop(entry_tx);
        let drain = tokio::spawn(async move { while pack_rx.recv().await.is_some() {} });
        let err = encoder.encode(entry_rx).await.unwrap_err();
        assert!(matches!(err, GitError::PackEncodeError(_)));
        drain.await.unwrap();
    }

    /// Delta entries are refused by the encoder.
    #[test]
    fn test_no_delta_output() {
        let mut entry = Entry::from(Blob::from_content("x"));
        entry.obj_type = ObjectType::OffsetDelta;
        assert!(encode_pack_to_vec(&[entry]).is_err());
    }
}

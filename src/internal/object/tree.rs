//! The Tree object represents one directory level: a sorted list of
//! `"<mode> <name>\0<20-byte-id>"` entries pointing at blobs and subtrees.
//! Names are raw bytes; nothing here assumes UTF-8.

use std::{cmp::Ordering, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::object::{ObjectTrait, types::ObjectType},
};

/// File mode of a tree entry.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TreeItemMode {
    Blob,
    BlobExecutable,
    Link,
    Tree,
    Commit,
}

impl Display for TreeItemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let _print = match self {
            TreeItemMode::Blob => "100644",
            TreeItemMode::BlobExecutable => "100755",
            TreeItemMode::Link => "120000",
            TreeItemMode::Tree => "40000",
            TreeItemMode::Commit => "160000",
        };
        write!(f, "{_print}")
    }
}

impl TreeItemMode {
    /// Parse the octal mode bytes as they appear in a tree body.
    pub fn from_bytes(mode: &[u8]) -> Result<TreeItemMode, GitError> {
        Ok(match mode {
            b"100644" | b"100664" => TreeItemMode::Blob,
            b"100755" => TreeItemMode::BlobExecutable,
            b"120000" => TreeItemMode::Link,
            b"40000" | b"040000" => TreeItemMode::Tree,
            b"160000" => TreeItemMode::Commit,
            _ => {
                return Err(GitError::InvalidTreeItem(
                    String::from_utf8_lossy(mode).to_string(),
                ));
            }
        })
    }

    /// Canonical bytes written back into a tree body.
    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Tree => b"40000",
            TreeItemMode::Commit => b"160000",
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, TreeItemMode::Tree)
    }
}

/// One entry of a tree: mode, target id, and raw name bytes.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub id: ObjectHash,
    pub name: Vec<u8>,
}

impl TreeItem {
    pub fn new(mode: TreeItemMode, id: ObjectHash, name: impl Into<Vec<u8>>) -> TreeItem {
        TreeItem {
            mode,
            id,
            name: name.into(),
        }
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).to_string()
    }

    /// Collation key: directory names compare as if they carried a trailing
    /// slash, which is how git orders `foo` vs `foo.c` vs `foo/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.clone();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

impl Display for TreeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} {}", self.mode, self.id, self.name_lossy())
    }
}

/// A full directory listing, addressed by the hash of its canonical body.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectHash,
    pub tree_items: Vec<TreeItem>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Type: Tree: {}", self.id)?;
        for item in &self.tree_items {
            writeln!(f, "{item}")?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from items, sorting them into canonical order and
    /// computing the id.
    pub fn from_tree_items(mut tree_items: Vec<TreeItem>) -> Result<Tree, GitError> {
        tree_items.sort_by(|a, b| {
            let (ka, kb) = (a.sort_key(), b.sort_key());
            match ka.cmp(&kb) {
                Ordering::Equal => a.id.cmp(&b.id),
                other => other,
            }
        });
        let mut tree = Tree {
            id: ObjectHash::default(),
            tree_items,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }
}

impl ObjectTrait for Tree {
    /// Split the body on mode/space/name/NUL/id boundaries. The name is kept
    /// as raw bytes.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut tree_items = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let space = memchr::memchr(b' ', &data[pos..])
                .ok_or_else(|| GitError::InvalidTreeObject("missing mode delimiter".to_string()))?
                + pos;
            let mode = TreeItemMode::from_bytes(&data[pos..space])?;

            let nul = memchr::memchr(b'\x00', &data[space + 1..])
                .ok_or_else(|| GitError::InvalidTreeObject("missing name delimiter".to_string()))?
                + space
                + 1;
            let name = data[space + 1..nul].to_vec();

            let id_end = nul + 1 + HASH_SIZE;
            if id_end > data.len() {
                return Err(GitError::InvalidTreeObject(
                    "truncated entry id".to_string(),
                ));
            }
            let id = ObjectHash::from_bytes(&data[nul + 1..id_end])
                .map_err(GitError::InvalidHashValue)?;

            tree_items.push(TreeItem { mode, id, name });
            pos = id_end;
        }

        Ok(Tree {
            id: hash,
            tree_items,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn get_size(&self) -> usize {
        self.tree_items.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        for item in &self.tree_items {
            data.extend(item.mode.to_bytes());
            data.extend(b" ");
            data.extend(&item.name);
            data.extend(b"\x00");
            data.extend(item.id.as_ref());
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::blob::Blob;

    fn blob_id(content: &str) -> ObjectHash {
        Blob::from_content(content).id
    }

    /// Tree body round-trips byte-exactly through parse and re-encode.
    #[test]
    fn test_round_trip() {
        let tree = Tree::from_tree_items(vec![
            TreeItem::new(TreeItemMode::Blob, blob_id("a"), "hello.txt"),
            TreeItem::new(TreeItemMode::Tree, blob_id("b"), "src"),
        ])
        .unwrap();

        let body = tree.to_data().unwrap();
        let parsed = Tree::from_bytes(&body, tree.id).unwrap();
        assert_eq!(parsed.tree_items, tree.tree_items);
        assert_eq!(parsed.to_data().unwrap(), body);
        assert_eq!(parsed.object_hash().unwrap(), tree.id);
    }

    /// Directory names collate with a trailing slash: `foo.c` sorts before
    /// the directory `foo`, which sorts before `foo0`.
    #[test]
    fn test_directory_collation() {
        let tree = Tree::from_tree_items(vec![
            TreeItem::new(TreeItemMode::Blob, blob_id("1"), "foo0"),
            TreeItem::new(TreeItemMode::Tree, blob_id("2"), "foo"),
            TreeItem::new(TreeItemMode::Blob, blob_id("3"), "foo.c"),
        ])
        .unwrap();

        let names: Vec<String> = tree.tree_items.iter().map(|i| i.name_lossy()).collect();
        assert_eq!(names, vec!["foo.c", "foo", "foo0"]);
    }

    /// Names that are not valid UTF-8 survive the round trip.
    #[test]
    fn test_non_utf8_name() {
        let name: Vec<u8> = vec![0x66, 0x6f, 0xff, 0xfe];
        let tree = Tree::from_tree_items(vec![TreeItem::new(
            TreeItemMode::Blob,
            blob_id("x"),
            name.clone(),
        )])
        .unwrap();
        let parsed = Tree::from_bytes(&tree.to_data().unwrap(), tree.id).unwrap();
        assert_eq!(parsed.tree_items[0].name, name);
    }

    /// An empty tree hashes to git's well-known empty tree id.
    #[test]
    fn test_empty_tree_id() {
        let tree = Tree::from_tree_items(vec![]).unwrap();
        assert_eq!(
            tree.id.to_string(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    /// Truncated bodies produce errors instead of panics.
    #[test]
    fn test_truncated_body() {
        let tree = Tree::from_tree_items(vec![TreeItem::new(
            TreeItemMode::Blob,
            blob_id("x"),
            "file",
        )])
        .unwrap();
        let body = tree.to_data().unwrap();
        assert!(Tree::from_bytes(&body[..body.len() - 4], tree.id).is_err());
        assert!(Tree::from_bytes(b"999 bad", tree.id).is_err());
    }
}

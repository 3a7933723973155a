//! The Commit object records a snapshot of the project: the root tree, the
//! parent commits it descends from, author and committer identities, and the
//! message. The parent links are what turn individual snapshots into history.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::signature::{Signature, SignatureType};
use crate::internal::object::types::ObjectType;

/// The `Commit` struct is used to represent a commit object.
///
/// - The tree id points to the top level tree for this commit, which reflects
///   the complete state of the repository at the time of the commit.
/// - The parent commit ids allow walking the full history; a root commit has
///   none, a merge commit has several.
/// - The author and committer fields contain name, email, timestamp and
///   timezone.
/// - The message may include a GPG signature block before the text.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_commit_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Result<Commit, GitError> {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data()?);
        Ok(commit)
    }

    /// Convenience constructor with generated signatures; used by tests and
    /// restore tooling.
    pub fn from_tree_id(
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Result<Commit, GitError> {
        let author = Signature::new(
            SignatureType::Author,
            "stratum".to_string(),
            "stratum@localhost".to_string(),
        );
        let committer = Signature::new(
            SignatureType::Committer,
            "stratum".to_string(),
            "stratum@localhost".to_string(),
        );
        Commit::new(author, committer, tree_id, parent_commit_ids, message)
    }

    /// First meaningful line of the message, skipping a PGP signature block
    /// when one is present.
    pub fn format_message(&self) -> String {
        if let Some(pos) = self
            .message
            .lines()
            .position(|line| line.contains("-----END PGP SIGNATURE-----"))
        {
            return self
                .message
                .lines()
                .skip(pos + 1)
                .find(|line| !line.trim().is_empty())
                .map(|line| line.to_owned())
                .unwrap_or_else(|| self.message.clone());
        }

        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_owned())
            .unwrap_or_else(|| self.message.clone())
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let invalid = |what: &str| GitError::InvalidCommitObject(what.to_string());

        let mut commit = data;
        // The tree line is mandatory and always first.
        let tree_end = commit.find_byte(0x0a).ok_or_else(|| invalid("no tree line"))?;
        if !commit.starts_with(b"tree ") {
            return Err(invalid("missing tree header"));
        }
        let tree_id = ObjectHash::from_str(
            std::str::from_utf8(&commit[5..tree_end])
                .map_err(|_| invalid("tree id not utf-8"))?,
        )
        .map_err(GitError::InvalidHashValue)?;
        let binding = commit[tree_end + 1..].to_vec();
        commit = &binding;

        // All lines starting with "parent " up to the author line.
        let author_begin = commit.find("author").ok_or_else(|| invalid("no author"))?;
        let parent_commit_ids = commit[..author_begin]
            .find_iter("parent")
            .map(|parent| {
                let parent_end = commit[parent..]
                    .find_byte(0x0a)
                    .ok_or_else(|| invalid("unterminated parent line"))?;
                // 7 is the length of "parent "
                ObjectHash::from_str(
                    std::str::from_utf8(&commit[parent + 7..parent + parent_end])
                        .map_err(|_| invalid("parent id not utf-8"))?,
                )
                .map_err(GitError::InvalidHashValue)
            })
            .collect::<Result<Vec<ObjectHash>, GitError>>()?;
        let binding = commit[author_begin..].to_vec();
        commit = &binding;

        // Author then committer, one line each.
        let author_end = commit.find_byte(0x0a).ok_or_else(|| invalid("unterminated author"))?;
        let author = Signature::from_data(commit[..author_end].to_vec())?;
        let binding = commit[author_end + 1..].to_vec();
        commit = &binding;

        let committer_end = commit
            .find_byte(0x0a)
            .ok_or_else(|| invalid("unterminated committer"))?;
        let committer = Signature::from_data(commit[..committer_end].to_vec())?;

        // Everything after the committer line (including any gpgsig block and
        // the blank separator) is kept verbatim as the message.
        let message = String::from_utf8_lossy(&commit[committer_end + 1..]).to_string();

        Ok(Commit {
            id: hash,
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn get_size(&self) -> usize {
        0
    }

    /// [Git-Internals-Git-Objects](https://git-scm.com/book/en/v2/Git-Internals-Git-Objects)
    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.extend(&[0x0a]);

        for parent_tree_id in &self.parent_commit_ids {
            data.extend(b"parent ");
            data.extend(parent_tree_id.to_string().as_bytes());
            data.extend(&[0x0a]);
        }

        data.extend(self.author.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.committer.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn basic_commit() -> Commit {
        let raw_commit = br#"tree 341e54913a3a43069f2927cc0f703e5a9f730df1
parent 57d7685c60213a9da465cf900f31933be3a7ee39
author dev one <dev.one@example.com> 1757467768 +0800
committer dev one <dev.one@example.com> 1757491219 +0800

test parse commit from bytes
"#;
        let hash = ObjectHash::from_type_and_data(ObjectType::Commit, raw_commit);
        Commit::from_bytes(raw_commit, hash).unwrap()
    }

    /// Headers parse into their typed fields.
    #[test]
    fn test_from_bytes() {
        let commit = basic_commit();
        assert_eq!(
            commit.tree_id,
            ObjectHash::from_str("341e54913a3a43069f2927cc0f703e5a9f730df1").unwrap()
        );
        assert_eq!(commit.parent_commit_ids.len(), 1);
        assert_eq!(commit.author.name, "dev one");
        assert_eq!(commit.author.email, "dev.one@example.com");
        assert_eq!(commit.committer.timestamp, 1757491219);
        assert!(commit.message.contains("test parse commit from bytes"));
    }

    /// Encoding a parsed commit reproduces the original bytes and id.
    #[test]
    fn test_round_trip() {
        let commit = basic_commit();
        let encoded = commit.to_data().unwrap();
        let reparsed = Commit::from_bytes(&encoded, commit.id).unwrap();
        assert_eq!(reparsed.to_data().unwrap(), encoded);
        assert_eq!(reparsed.object_hash().unwrap(), commit.id);
    }

    /// A root commit has no parent lines.
    #[test]
    fn test_root_commit() {
        let tree_id = ObjectHash::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        let commit = Commit::from_tree_id(tree_id, vec![], "\ninitial\n").unwrap();
        assert!(commit.parent_commit_ids.is_empty());
        let reparsed = Commit::from_bytes(&commit.to_data().unwrap(), commit.id).unwrap();
        assert_eq!(reparsed.tree_id, tree_id);
        assert_eq!(reparsed.format_message(), "initial");
    }

    /// A merge commit carries both parents in order.
    #[test]
    fn test_merge_commit_parents() {
        let tree_id = ObjectHash::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        let p1 = ObjectHash::new(b"p1");
        let p2 = ObjectHash::new(b"p2");
        let commit = Commit::from_tree_id(tree_id, vec![p1, p2], "\nmerge\n").unwrap();
        let reparsed = Commit::from_bytes(&commit.to_data().unwrap(), commit.id).unwrap();
        assert_eq!(reparsed.parent_commit_ids, vec![p1, p2]);
    }

    /// Malformed bodies are rejected.
    #[test]
    fn test_invalid_commit() {
        let hash = ObjectHash::default();
        assert!(Commit::from_bytes(b"not a commit", hash).is_err());
        assert!(Commit::from_bytes(b"tree deadbeef\n", hash).is_err());
    }
}

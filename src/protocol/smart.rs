//! The smart protocol state machine: ref advertisement, want/have
//! negotiation feeding the pack encoder, and receive-pack ingestion feeding
//! the push transaction.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    types::{
        COMMON_CAP_LIST, Capability, LF, NUL, PKT_LINE_END_MARKER, ProtocolError, RECEIVE_CAP_LIST,
        RefCommand, SP, ServiceType, UPLOAD_CAP_LIST,
    },
    utils::{add_pkt_line_string, build_advertisement, read_pkt_line, read_until_white_space},
};
use crate::{
    cas::CasStore,
    config::StoreConfig,
    errors::GitError,
    hash::{ObjectHash, ZERO_ID},
    internal::{
        object::{ObjectTrait, commit::Commit, tag::Tag, tree::Tree, types::ObjectType},
        pack::{
            decode::decode_pack,
            encode::PackEncoder,
            entry::Entry,
        },
    },
    refs::{log::RefLog, protection::ProtectionStore, store::RefStore},
    scratchpad::Scratchpad,
    transaction::{PushCommand, PushTransaction},
};

/// Smart protocol handler for one repository.
///
/// Owns no state of its own beyond negotiated capabilities; every operation
/// reads and writes through the storage components.
pub struct SmartProtocol {
    cas: Arc<CasStore>,
    refs: Arc<RefStore>,
    ref_log: Arc<RefLog>,
    protection: Arc<ProtectionStore>,
    scratchpad: Scratchpad,
    config: StoreConfig,
    pub capabilities: Vec<Capability>,
}

impl SmartProtocol {
    pub fn new(
        cas: Arc<CasStore>,
        refs: Arc<RefStore>,
        ref_log: Arc<RefLog>,
        protection: Arc<ProtectionStore>,
        scratchpad: Scratchpad,
        config: StoreConfig,
    ) -> Self {
        Self {
            cas,
            refs,
            ref_log,
            protection,
            scratchpad,
            config,
            capabilities: Vec::new(),
        }
    }

    /// Build the packet-line framed ref advertisement for `info/refs`.
    ///
    /// The first ref carries the capability list behind a NUL; an empty repo
    /// advertises `capabilities^{}` against the zero id.
    pub async fn git_info_refs(
        &self,
        service_type: ServiceType,
    ) -> Result<BytesMut, ProtocolError> {
        let refs = self.refs.list(Some("refs/")).await?;
        let head = self.refs.resolve("HEAD").await?;

        let cap_list = match service_type {
            ServiceType::UploadPack => format!("{UPLOAD_CAP_LIST}{COMMON_CAP_LIST}"),
            ServiceType::ReceivePack => format!("{RECEIVE_CAP_LIST}{COMMON_CAP_LIST}"),
        };

        let mut ref_list = Vec::new();
        match head {
            Some(head_sha) => {
                ref_list.push(format!("{head_sha}{SP}HEAD{NUL}{cap_list}{LF}"));
            }
            None => {
                ref_list.push(format!(
                    "{ZERO_ID}{SP}capabilities^{{}}{NUL}{cap_list}{LF}"
                ));
            }
        }
        for r in refs {
            if r.symbolic {
                continue;
            }
            ref_list.push(format!("{}{}{}{}", r.target, SP, r.name, LF));
        }

        let reply = build_advertisement(&ref_list, &service_type.to_string());
        tracing::debug!(service = %service_type, lines = reply.len(), "built ref advertisement");
        Ok(reply)
    }

    /// Handle a `git-upload-pack` request body: read want/have lines, then
    /// stream back the negotiation result and a pack of the missing objects.
    pub async fn git_upload_pack(
        &mut self,
        upload_request: Bytes,
    ) -> Result<(ReceiverStream<Vec<u8>>, BytesMut), ProtocolError> {
        self.capabilities.clear();
        let mut upload_request = upload_request;
        let mut want: Vec<String> = Vec::new();
        let mut have: Vec<String> = Vec::new();

        let mut read_first_line = false;
        loop {
            let (bytes_take, pkt_line) = read_pkt_line(&mut upload_request);
            if bytes_take == 0 {
                break;
            }
            // A flush only separates the want section from the have section.
            if pkt_line.is_empty() {
                continue;
            }

            let mut pkt_line = pkt_line;
            let command = read_until_white_space(&mut pkt_line);
            match command.as_str() {
                "want" => {
                    want.push(read_until_white_space(&mut pkt_line));
                    if !read_first_line {
                        let cap_str = String::from_utf8_lossy(&pkt_line).to_string();
                        self.parse_capabilities(&cap_str);
                        read_first_line = true;
                    }
                }
                "have" => {
                    have.push(read_until_white_space(&mut pkt_line));
                }
                "done" => break,
                _ => {
                    tracing::warn!("unknown upload-pack command: {}", command);
                }
            }
        }

        let wants = parse_ids(&want)?;
        let haves = parse_ids(&have).unwrap_or_default();

        // Unknown wants fail the request; haves missing from the store are
        // silently dropped from negotiation.
        for id in &wants {
            if !self.cas.has(id).await? {
                return Err(ProtocolError::ObjectNotFound(id.to_string()));
            }
        }
        let mut common: Vec<ObjectHash> = Vec::new();
        for id in &haves {
            if self.cas.has(id).await? {
                common.push(*id);
            }
        }

        let mut protocol_buf = BytesMut::new();
        if common.is_empty() {
            add_pkt_line_string(&mut protocol_buf, String::from("NAK\n"));
        } else {
            for id in &common {
                add_pkt_line_string(&mut protocol_buf, format!("ACK {id} common\n"));
            }
            add_pkt_line_string(
                &mut protocol_buf,
                format!("ACK {} ready\n", common[common.len() - 1]),
            );
        }

        let entries = self.collect_objects(&wants, &common).await?;
        let (pack_tx, pack_rx) = mpsc::channel(1024);
        let encoder = PackEncoder::new(entries.len(), pack_tx);
        tokio::spawn(async move {
            let (entry_tx, entry_rx) = mpsc::channel(64);
            let feed = tokio::spawn(async move {
                for entry in entries {
                    if entry_tx.send(entry).await.is_err() {
                        break;
                    }
                }
            });
            if let Err(e) = encoder.encode(entry_rx).await {
                tracing::error!(error = %e, "pack encoding failed");
            }
            let _ = feed.await;
        });

        Ok((ReceiverStream::new(pack_rx), protocol_buf))
    }

    /// Handle a `git-receive-pack` request body: command list, optional pack
    /// data, then the per-ref status report.
    pub async fn git_receive_pack(&mut self, body: Bytes) -> Result<Bytes, ProtocolError> {
        self.capabilities.clear();
        let mut protocol_bytes = body;
        let mut command_list: Vec<RefCommand> = Vec::new();
        let mut first_line = true;
        let mut saw_flush = false;

        loop {
            let (bytes_take, pkt_line) = read_pkt_line(&mut protocol_bytes);
            if bytes_take == 0 {
                if protocol_bytes.is_empty() {
                    break;
                }
                return Err(ProtocolError::invalid_request(
                    "Invalid pkt-line in receive-pack request",
                ));
            }
            if pkt_line.is_empty() {
                saw_flush = true;
                break;
            }

            if first_line {
                if let Some(pos) = pkt_line.iter().position(|b| *b == b'\0') {
                    let caps = String::from_utf8_lossy(&pkt_line[(pos + 1)..]).to_string();
                    self.parse_capabilities(&caps);
                }
                first_line = false;
            }

            let mut line = pkt_line.clone();
            let old_id = read_until_white_space(&mut line);
            let new_id = read_until_white_space(&mut line);
            let ref_name = read_until_white_space(&mut line);
            command_list.push(RefCommand::new(old_id, new_id, ref_name));
        }

        if !saw_flush {
            return Err(ProtocolError::invalid_request(
                "Missing flush before pack data",
            ));
        }

        // Remaining bytes (if any) are pack data.
        let mut push = PushTransaction::new(
            self.cas.clone(),
            self.refs.clone(),
            self.ref_log.clone(),
            self.scratchpad.clone(),
            self.protection.rules().await?,
            self.config.buffer.clone(),
        );

        let mut report_status = BytesMut::new();
        if !protocol_bytes.is_empty() {
            let decoded = match decode_pack(&protocol_bytes, self.cas.as_ref()).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!(error = %e, "pack ingestion failed");
                    add_pkt_line_string(&mut report_status, format!("unpack {e}\n"));
                    for command in &command_list {
                        add_pkt_line_string(
                            &mut report_status,
                            format!("ng {} unpack failed\n", command.ref_name),
                        );
                    }
                    report_status.put(&PKT_LINE_END_MARKER[..]);
                    return Ok(report_status.freeze());
                }
            };
            for entry in decoded.entries {
                push.buffer(entry.obj_type, entry.data)
                    .map_err(ProtocolError::from)?;
            }
        }

        let commands: Vec<PushCommand> = command_list
            .iter()
            .map(|c| PushCommand {
                ref_name: c.ref_name.clone(),
                expected_old: c.old_hash.clone(),
                new: c.new_hash.clone(),
                is_force_push: false,
            })
            .collect();
        let outcome = push.execute(commands).await?;

        add_pkt_line_string(&mut report_status, "unpack ok\n".to_owned());
        for (command, result) in command_list.iter_mut().zip(&outcome.results) {
            if result.ok {
                command.success();
            } else {
                command.failed(
                    result
                        .reason
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            add_pkt_line_string(&mut report_status, format!("{}\n", command.get_status()));
        }

        // Bootstrap HEAD: the first branch pushed into an empty repo becomes
        // the default branch.
        if outcome.success
            && self.refs.read("HEAD").await?.is_none()
            && let Some(first_branch) = command_list
                .iter()
                .find(|c| c.ref_name.starts_with("refs/heads/") && !c.is_delete())
        {
            self.refs
                .write_symbolic("HEAD", &first_branch.ref_name)
                .await?;
        }

        report_status.put(&PKT_LINE_END_MARKER[..]);
        Ok(report_status.freeze())
    }

    /// Record the capabilities a client declared.
    pub fn parse_capabilities(&mut self, cap_str: &str) {
        for cap in cap_str.split_whitespace() {
            if let Ok(capability) = cap.parse::<Capability>() {
                self.capabilities.push(capability);
            }
        }
    }

    /// Gather every object needed to serve `wants`, skipping everything
    /// reachable from `haves`: commits by graph walk, then trees and blobs
    /// by tree recursion, annotated tags peeled.
    async fn collect_objects(
        &self,
        wants: &[ObjectHash],
        haves: &[ObjectHash],
    ) -> Result<Vec<Entry>, GitError> {
        // Closure of the client side first, so shared history is excluded.
        let mut have_commits = HashSet::new();
        let mut have_trees = HashSet::new();
        let mut have_blobs = HashSet::new();
        for id in haves {
            self.walk_commits(*id, &mut have_commits, &HashSet::new())
                .await?;
        }
        for commit_id in have_commits.clone() {
            let commit = self.read_commit(&commit_id).await?;
            self.walk_tree(commit.tree_id, &mut have_trees, &mut have_blobs, None)
                .await?;
        }

        let mut entries = Vec::new();
        let mut commits = HashSet::new();
        let mut trees = have_trees.clone();
        let mut blobs = have_blobs.clone();

        for want in wants {
            let (obj_type, body) = self
                .cas
                .get(want)
                .await?
                .ok_or_else(|| GitError::ObjectNotFound(want.to_string()))?;
            let commit_id = match obj_type {
                ObjectType::Commit => *want,
                ObjectType::Tag => {
                    let tag = Tag::from_bytes(&body, *want)?;
                    entries.push(Entry::from(tag.clone()));
                    tag.object_hash
                }
                other => {
                    return Err(GitError::CustomError(format!(
                        "want {want} is a {other}, not a commit or tag"
                    )));
                }
            };

            let mut reached = HashSet::new();
            self.walk_commits(commit_id, &mut reached, &have_commits)
                .await?;
            for id in reached {
                if !commits.insert(id) {
                    continue;
                }
                let commit = self.read_commit(&id).await?;
                self.walk_tree(commit.tree_id, &mut trees, &mut blobs, Some(&mut entries))
                    .await?;
                entries.push(Entry::from(commit));
            }
        }
        Ok(entries)
    }

    async fn read_commit(&self, id: &ObjectHash) -> Result<Commit, GitError> {
        let (obj_type, body) = self
            .cas
            .get(id)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(id.to_string()))?;
        if obj_type != ObjectType::Commit {
            return Err(GitError::InvalidCommitObject(format!(
                "{id} is a {obj_type}"
            )));
        }
        Commit::from_bytes(&body, *id)
    }

    /// Ancestor walk from `start`, stopping at anything in `stop`.
    async fn walk_commits(
        &self,
        start: ObjectHash,
        out: &mut HashSet<ObjectHash>,
        stop: &HashSet<ObjectHash>,
    ) -> Result<(), GitError> {
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if stop.contains(&id) || out.contains(&id) {
                continue;
            }
            // A have the store never saw is ignored, per negotiation rules.
            let Some((obj_type, body)) = self.cas.get(&id).await? else {
                continue;
            };
            if obj_type != ObjectType::Commit {
                continue;
            }
            let commit = Commit::from_bytes(&body, id)?;
            out.insert(id);
            for parent in commit.parent_commit_ids {
                queue.push_back(parent);
            }
        }
        Ok(())
    }

    /// Recursive tree walk collecting unvisited trees and blobs. When
    /// `entries` is given, the objects are appended for packing.
    async fn walk_tree(
        &self,
        tree_id: ObjectHash,
        trees: &mut HashSet<ObjectHash>,
        blobs: &mut HashSet<ObjectHash>,
        mut entries: Option<&mut Vec<Entry>>,
    ) -> Result<(), GitError> {
        if !trees.insert(tree_id) {
            return Ok(());
        }
        let (obj_type, body) = self
            .cas
            .get(&tree_id)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(tree_id.to_string()))?;
        if obj_type != ObjectType::Tree {
            return Err(GitError::InvalidTreeObject(format!(
                "{tree_id} is a {obj_type}"
            )));
        }
        let tree = Tree::from_bytes(&body, tree_id)?;
        if let Some(out) = entries.as_mut() {
            out.push(Entry::from(tree.clone()));
        }

        let mut subtrees = Vec::new();
        for item in &tree.tree_items {
            if item.mode.is_tree() {
                subtrees.push(item.id);
            } else if blobs.insert(item.id)
                && let Some(out) = entries.as_mut()
            {
                let (blob_type, blob_body) = self
                    .cas
                    .get(&item.id)
                    .await?
                    .ok_or_else(|| GitError::ObjectNotFound(item.id.to_string()))?;
                out.push(Entry::from_raw(blob_type, blob_body));
            }
        }
        for subtree in subtrees {
            Box::pin(self.walk_tree(subtree, trees, blobs, entries.as_mut().map(|e| &mut **e)))
                .await?;
        }
        Ok(())
    }
}

fn parse_ids(raw: &[String]) -> Result<Vec<ObjectHash>, ProtocolError> {
    raw.iter()
        .map(|s| {
            ObjectHash::from_str(s)
                .map_err(|_| ProtocolError::invalid_request(&format!("bad object id {s}")))
        })
        .collect()
}

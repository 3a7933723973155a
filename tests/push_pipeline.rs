//! End-to-end pipeline tests: push through the smart protocol into the
//! storage engine, fetch back out, and crash-recover in between.

use std::str::FromStr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use git_stratum::bucket::memory::MemBucket;
use git_stratum::config::StoreConfig;
use git_stratum::coordinator::Coordinator;
use git_stratum::hash::{ObjectHash, ZERO_ID};
use git_stratum::internal::object::blob::Blob;
use git_stratum::internal::object::commit::Commit;
use git_stratum::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use git_stratum::internal::object::types::ObjectType;
use git_stratum::internal::object::ObjectTrait;
use git_stratum::internal::pack::decode::{NoExternalBases, decode_pack};
use git_stratum::internal::pack::encode::encode_pack_to_vec;
use git_stratum::internal::pack::entry::Entry;
use git_stratum::protocol::types::{PKT_LINE_END_MARKER, ServiceType};
use git_stratum::protocol::utils::{add_pkt_line_string, read_pkt_line};
use git_stratum::refs::protection::ProtectionRule;
use git_stratum::scratchpad::Scratchpad;

async fn coordinator_with(bucket: Arc<MemBucket>, scratchpad: Scratchpad) -> Arc<Coordinator> {
    Coordinator::initialize("acme/repo", bucket, scratchpad, StoreConfig::default())
        .await
        .unwrap()
}

async fn coordinator() -> Arc<Coordinator> {
    coordinator_with(
        Arc::new(MemBucket::new()),
        Scratchpad::in_memory().await.unwrap(),
    )
    .await
}

/// Commit C0 over empty tree T0, the two-object graph of the create-branch
/// scenario.
fn initial_graph() -> (Commit, Tree) {
    let tree = Tree::from_tree_items(vec![]).unwrap();
    let commit = Commit::from_tree_id(tree.id, vec![], "\ninitial\n").unwrap();
    (commit, tree)
}

fn receive_request(entries: &[Entry], commands: &[(String, String, String)]) -> Bytes {
    let mut request = BytesMut::new();
    let mut first = true;
    for (old, new, ref_name) in commands {
        let line = if first {
            first = false;
            format!("{old} {new} {ref_name}\0report-status\n")
        } else {
            format!("{old} {new} {ref_name}\n")
        };
        add_pkt_line_string(&mut request, line);
    }
    request.put(&PKT_LINE_END_MARKER[..]);
    if !entries.is_empty() {
        request.extend_from_slice(&encode_pack_to_vec(entries).unwrap());
    }
    request.freeze()
}

fn read_status_lines(mut report: Bytes) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let (consumed, line) = read_pkt_line(&mut report);
        if consumed <= 4 {
            break;
        }
        lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    lines
}

/// Create-branch scenario: an empty repo accepts `{C0, T0}` with a
/// create command; both objects land in the CAS, the ref and the log agree.
#[tokio::test]
async fn create_branch_in_empty_repo() {
    let coordinator = coordinator().await;
    let (commit, tree) = initial_graph();

    let request = receive_request(
        &[Entry::from(commit.clone()), Entry::from(tree.clone())],
        &[(
            ZERO_ID.to_string(),
            commit.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    let report = coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();
    assert_eq!(
        read_status_lines(report),
        vec!["unpack ok", "ok refs/heads/main"]
    );

    assert!(coordinator.cas().has(&commit.id).await.unwrap());
    assert!(coordinator.cas().has(&tree.id).await.unwrap());
    assert_eq!(
        coordinator
            .refs()
            .read("refs/heads/main")
            .await
            .unwrap()
            .unwrap()
            .target,
        commit.id.to_string()
    );

    let entries = coordinator.ref_log().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, 1);
    assert_eq!(entries[0].ref_name, "refs/heads/main");
    assert_eq!(entries[0].old_sha, "");
    assert_eq!(entries[0].new_sha, commit.id.to_string());
}

/// Fast-forward scenario: pushing C1 on top moves the ref and appends
/// version 2 with the old and new ids.
#[tokio::test]
async fn fast_forward_push() {
    let coordinator = coordinator().await;
    let (c0, tree) = initial_graph();

    let request = receive_request(
        &[Entry::from(c0.clone()), Entry::from(tree.clone())],
        &[(
            ZERO_ID.to_string(),
            c0.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    let c1 = Commit::from_tree_id(tree.id, vec![c0.id], "\nsecond\n").unwrap();
    let request = receive_request(
        &[Entry::from(c1.clone())],
        &[(
            c0.id.to_string(),
            c1.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    let report = coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();
    assert_eq!(
        read_status_lines(report),
        vec!["unpack ok", "ok refs/heads/main"]
    );

    let ids = coordinator.cas().list_object_ids().await.unwrap();
    assert_eq!(ids.len(), 3);
    let entries = coordinator.ref_log().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].version, 2);
    assert_eq!(entries[1].old_sha, c0.id.to_string());
    assert_eq!(entries[1].new_sha, c1.id.to_string());
}

/// Conflicting concurrent pushes: the second push against the same
/// expected_old fails with the lock reason, adds no log entry, and leaves
/// its objects behind as orphans.
#[tokio::test]
async fn conflicting_concurrent_pushes() {
    let coordinator = coordinator().await;
    let (c0, tree) = initial_graph();

    let request = receive_request(
        &[Entry::from(c0.clone()), Entry::from(tree.clone())],
        &[(
            ZERO_ID.to_string(),
            c0.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    let winner = Commit::from_tree_id(tree.id, vec![c0.id], "\nwinner\n").unwrap();
    let loser = Commit::from_tree_id(tree.id, vec![c0.id], "\nloser\n").unwrap();

    let request = receive_request(
        &[Entry::from(winner.clone())],
        &[(
            c0.id.to_string(),
            winner.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    let request = receive_request(
        &[Entry::from(loser.clone())],
        &[(
            c0.id.to_string(),
            loser.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    let report = coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();
    assert_eq!(
        read_status_lines(report),
        vec![
            "unpack ok",
            "ng refs/heads/main lock failed: ref has been updated"
        ]
    );

    assert_eq!(
        coordinator
            .refs()
            .read("refs/heads/main")
            .await
            .unwrap()
            .unwrap()
            .target,
        winner.id.to_string()
    );
    assert_eq!(coordinator.ref_log().entries().len(), 2);
    // The loser's commit stays in the CAS and shows up as an orphan.
    assert!(coordinator.cas().has(&loser.id).await.unwrap());
    assert!(
        coordinator
            .orphan_candidates()
            .await
            .unwrap()
            .contains(&loser.id)
    );
}

/// Force-push denial: the rule pattern appears in the reason and the ref is
/// untouched.
#[tokio::test]
async fn force_push_denied_by_rule() {
    let coordinator = coordinator().await;
    let (c0, tree) = initial_graph();

    let request = receive_request(
        &[Entry::from(c0.clone()), Entry::from(tree.clone())],
        &[(
            ZERO_ID.to_string(),
            c0.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    coordinator
        .protection()
        .add_rule(&ProtectionRule {
            pattern: "refs/heads/main".to_string(),
            required_reviews: 0,
            prevent_force_push: true,
            prevent_deletion: true,
            enabled: true,
        })
        .await
        .unwrap();

    // Deletion is also covered by the rule and goes through the same path.
    let request = receive_request(
        &[],
        &[(
            c0.id.to_string(),
            ZERO_ID.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    let report = coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();
    let lines = read_status_lines(report);
    assert_eq!(lines[0], "unpack ok");
    assert!(lines[1].starts_with("ng refs/heads/main"));
    assert!(lines[1].contains("refs/heads/main"));
    assert_eq!(
        coordinator
            .refs()
            .read("refs/heads/main")
            .await
            .unwrap()
            .unwrap()
            .target,
        c0.id.to_string()
    );
}

/// OFS_DELTA scenario: a pack with base blob "hello\n" and a delta producing
/// "hello world\n" ingests both blobs with correct canonical ids.
#[tokio::test]
async fn ofs_delta_pack_ingestion() {
    use flate2::{Compression, write::ZlibEncoder};
    use sha1::{Digest, Sha1};
    use std::io::Write;

    let base = b"hello\n";
    let target = b"hello world\n";

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    // Hand-rolled v2 pack: base blob entry + OFS_DELTA entry.
    let mut pack = Vec::new();
    pack.extend(b"PACK");
    pack.extend(2u32.to_be_bytes());
    pack.extend(2u32.to_be_bytes());

    let base_offset = pack.len();
    pack.push((3 << 4) | (base.len() as u8 & 0x0f)); // blob, size 6
    pack.extend(zlib(base));

    // delta: base size 6, result size 12, copy "hello", insert " world\n"
    let mut delta = Vec::new();
    delta.push(base.len() as u8);
    delta.push(target.len() as u8);
    delta.push(0x80 | 0x10); // copy, one size byte
    delta.push(5);
    delta.push(7);
    delta.extend_from_slice(b" world\n");

    let delta_offset = pack.len();
    pack.push((6 << 4) | (delta.len() as u8 & 0x0f));
    pack.push((delta_offset - base_offset) as u8); // single-byte back offset
    pack.extend(zlib(&delta));

    let digest = Sha1::digest(&pack);
    pack.extend_from_slice(&digest);

    let decoded = decode_pack(&pack, &NoExternalBases).await.unwrap();
    assert_eq!(decoded.entries.len(), 2);
    assert_eq!(decoded.entries[1].data, target);

    // Ingest through the store and confirm byte-exact retrieval under the
    // canonical ids.
    let coordinator = coordinator().await;
    for entry in &decoded.entries {
        coordinator
            .cas()
            .put(entry.obj_type, entry.data.clone())
            .await
            .unwrap();
    }
    coordinator.cas().flush().await.unwrap();

    let base_id = ObjectHash::from_type_and_data(ObjectType::Blob, base);
    let target_id = ObjectHash::from_type_and_data(ObjectType::Blob, target);
    assert_eq!(
        coordinator.cas().get(&base_id).await.unwrap().unwrap().1,
        base
    );
    assert_eq!(
        coordinator.cas().get(&target_id).await.unwrap().unwrap().1,
        target
    );
}

/// Crash between flush ack and ref commit: after restart the WAL replay is a
/// no-op, the CAS still holds the objects, the ref table is unchanged, and
/// the flushed objects are exactly the orphan set.
#[tokio::test]
async fn crash_after_flush_before_commit() {
    let scratchpad = Scratchpad::in_memory().await.unwrap();
    let bucket = Arc::new(MemBucket::new());
    let coordinator = coordinator_with(bucket.clone(), scratchpad.clone()).await;

    let (commit, tree) = initial_graph();
    // The push got as far as flushing its objects...
    coordinator
        .cas()
        .put(ObjectType::Commit, commit.to_data().unwrap())
        .await
        .unwrap();
    coordinator
        .cas()
        .put(ObjectType::Tree, tree.to_data().unwrap())
        .await
        .unwrap();
    coordinator.cas().flush().await.unwrap();
    // ...and the process dies before the ref batch commits.
    drop(coordinator);

    let restarted = coordinator_with(bucket, scratchpad).await;
    // WAL replay found nothing (the flush cleaned it); no new segment was
    // created on recovery.
    assert_eq!(restarted.cas().segment_count().await, 1);
    // Objects are durable, the ref table is untouched.
    assert!(restarted.cas().has(&commit.id).await.unwrap());
    assert!(restarted.cas().has(&tree.id).await.unwrap());
    assert!(restarted.refs().read("refs/heads/main").await.unwrap().is_none());
    assert_eq!(restarted.ref_log().head_version(), 0);

    // The orphan set is exactly the flushed objects.
    let mut orphans = restarted.orphan_candidates().await.unwrap();
    orphans.sort();
    let mut expected = vec![commit.id, tree.id];
    expected.sort();
    assert_eq!(orphans, expected);
}

/// Push then clone: a fresh client fetching the advertised tip gets a pack
/// whose objects decode to the pushed graph (pack round-trip, property 2).
#[tokio::test]
async fn push_then_full_clone() {
    let coordinator = coordinator().await;

    let blob = Blob::from_content("fn main() {}\n");
    let tree = Tree::from_tree_items(vec![TreeItem::new(
        TreeItemMode::Blob,
        blob.id,
        "main.rs",
    )])
    .unwrap();
    let commit = Commit::from_tree_id(tree.id, vec![], "\nadd main\n").unwrap();

    let request = receive_request(
        &[
            Entry::from(commit.clone()),
            Entry::from(tree.clone()),
            Entry::from(blob.clone()),
        ],
        &[(
            ZERO_ID.to_string(),
            commit.id.to_string(),
            "refs/heads/main".to_string(),
        )],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    // Advertisement carries HEAD and the branch at the pushed tip.
    let adv = coordinator
        .smart_protocol()
        .git_info_refs(ServiceType::UploadPack)
        .await
        .unwrap();
    let adv = String::from_utf8_lossy(&adv).to_string();
    assert!(adv.contains(&format!("{} HEAD", commit.id)));
    assert!(adv.contains(&format!("{} refs/heads/main", commit.id)));

    // want the tip, no haves.
    let mut body = BytesMut::new();
    add_pkt_line_string(&mut body, format!("want {}\n", commit.id));
    body.put(&PKT_LINE_END_MARKER[..]);
    add_pkt_line_string(&mut body, "done\n".to_string());

    let (stream, _negotiation) = coordinator
        .smart_protocol()
        .git_upload_pack(body.freeze())
        .await
        .unwrap();
    let mut pack_bytes = Vec::new();
    let mut stream = stream;
    while let Some(chunk) = tokio_stream::StreamExt::next(&mut stream).await {
        pack_bytes.extend(chunk);
    }

    let decoded = decode_pack(&pack_bytes, &NoExternalBases).await.unwrap();
    let ids: Vec<ObjectHash> = decoded.entries.iter().map(|e| e.hash).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&commit.id));
    assert!(ids.contains(&tree.id));
    assert!(ids.contains(&blob.id));
}

/// The ref table equals the fold of the ref log after a series of pushes
/// (property 6).
#[tokio::test]
async fn ref_table_equals_log_fold() {
    let coordinator = coordinator().await;
    let (c0, tree) = initial_graph();

    for (i, branch) in ["main", "dev", "feature"].iter().enumerate() {
        let commit = if i == 0 {
            c0.clone()
        } else {
            Commit::from_tree_id(tree.id, vec![c0.id], &format!("\nbranch {branch}\n")).unwrap()
        };
        let request = receive_request(
            &[Entry::from(commit.clone()), Entry::from(tree.clone())],
            &[(
                ZERO_ID.to_string(),
                commit.id.to_string(),
                format!("refs/heads/{branch}"),
            )],
        );
        coordinator
            .smart_protocol()
            .git_receive_pack(request)
            .await
            .unwrap();
    }

    // Delete one branch.
    let dev_sha = coordinator
        .refs()
        .read("refs/heads/dev")
        .await
        .unwrap()
        .unwrap()
        .target;
    let request = receive_request(
        &[],
        &[(dev_sha, ZERO_ID.to_string(), "refs/heads/dev".to_string())],
    );
    coordinator
        .smart_protocol()
        .git_receive_pack(request)
        .await
        .unwrap();

    let fold = coordinator.ref_log().state();
    let table = coordinator.refs().list(Some("refs/")).await.unwrap();
    assert_eq!(fold.len(), table.len());
    for record in table {
        assert_eq!(fold[&record.name].sha, record.target);
    }
    assert!(!fold.contains_key("refs/heads/dev"));
}

/// Stale ids parse-fail cleanly at the protocol boundary.
#[tokio::test]
async fn malformed_want_is_rejected() {
    let coordinator = coordinator().await;
    let mut body = BytesMut::new();
    add_pkt_line_string(&mut body, "want not-a-sha\n".to_string());
    body.put(&PKT_LINE_END_MARKER[..]);
    add_pkt_line_string(&mut body, "done\n".to_string());

    assert!(
        coordinator
            .smart_protocol()
            .git_upload_pack(body.freeze())
            .await
            .is_err()
    );
    assert!(ObjectHash::from_str("not-a-sha").is_err());
}

//! The ref log: an append-only transaction log of ref updates with a
//! per-repo monotonically increasing version, periodic replay checkpoints,
//! and a Parquet tail persisted to the bucket. The ref table is a fold of
//! this log; the log is the ordering authority.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use parquet::{
    basic::{Compression, ConvertedType, Repetition, Type as PhysicalType},
    data_type::{ByteArray, ByteArrayType, Int64Type},
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
        writer::SerializedFileWriter,
    },
    record::RowAccessor,
    schema::types::Type as SchemaType,
};

use crate::{
    bucket::{Bucket, RepoPaths},
    config::RefLogConfig,
    errors::GitError,
    scratchpad::now_secs,
};

/// One logged ref update. `old_sha = ""` encodes creation, `new_sha = ""`
/// encodes deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefLogEntry {
    pub version: u64,
    pub ref_name: String,
    pub old_sha: String,
    pub new_sha: String,
    pub timestamp: i64,
}

/// Materialized value of one ref at some version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSnapshotEntry {
    pub sha: String,
    pub version: u64,
}

struct LogInner {
    entries: Vec<RefLogEntry>,
    /// Replay checkpoints: `(version, state at that version)`.
    checkpoints: Vec<(u64, HashMap<String, RefSnapshotEntry>)>,
    next_version: u64,
    /// Highest version already written to the bucket tail.
    persisted_through: u64,
}

/// Append-only ref log with in-memory entries and a bucket-persisted tail.
pub struct RefLog {
    bucket: Arc<dyn Bucket>,
    paths: RepoPaths,
    config: RefLogConfig,
    inner: Mutex<LogInner>,
}

impl RefLog {
    /// Load the persisted tail files and rebuild the in-memory log.
    pub async fn load(
        bucket: Arc<dyn Bucket>,
        paths: RepoPaths,
        config: RefLogConfig,
    ) -> Result<Self, GitError> {
        let mut keys = bucket.list(&paths.ref_log_prefix()).await?;
        keys.sort();

        let mut entries = Vec::new();
        for key in keys {
            if let Some(bytes) = bucket.get(&key).await? {
                entries.extend(read_log_rows(&bytes)?);
            }
        }
        entries.sort_by_key(|e| e.version);
        entries.dedup_by_key(|e| e.version);

        let next_version = entries.last().map(|e| e.version + 1).unwrap_or(1);
        let persisted_through = entries.last().map(|e| e.version).unwrap_or(0);

        let log = Self {
            bucket,
            paths,
            config,
            inner: Mutex::new(LogInner {
                entries,
                checkpoints: Vec::new(),
                next_version,
                persisted_through,
            }),
        };
        log.rebuild_checkpoints();
        Ok(log)
    }

    fn rebuild_checkpoints(&self) {
        let mut inner = self.inner.lock().expect("ref log lock poisoned");
        let interval = self.config.checkpoint_interval.max(1);
        let mut state: HashMap<String, RefSnapshotEntry> = HashMap::new();
        let mut checkpoints = Vec::new();
        for entry in &inner.entries {
            apply_entry(&mut state, entry);
            if entry.version % interval == 0 {
                checkpoints.push((entry.version, state.clone()));
            }
        }
        inner.checkpoints = checkpoints;
    }

    /// Append one update, assigning the next version. Returns the entry.
    pub fn append(&self, ref_name: &str, old_sha: &str, new_sha: &str) -> RefLogEntry {
        let mut inner = self.inner.lock().expect("ref log lock poisoned");
        let entry = RefLogEntry {
            version: inner.next_version,
            ref_name: ref_name.to_string(),
            old_sha: old_sha.to_string(),
            new_sha: new_sha.to_string(),
            timestamp: now_secs(),
        };
        inner.next_version += 1;
        inner.entries.push(entry.clone());

        let interval = self.config.checkpoint_interval.max(1);
        if entry.version % interval == 0 {
            let state = replay_entries(&inner.entries, entry.version);
            inner.checkpoints.push((entry.version, state));
        }
        entry
    }

    /// Highest assigned version; 0 when the log is empty.
    pub fn head_version(&self) -> u64 {
        self.inner.lock().expect("ref log lock poisoned").next_version - 1
    }

    pub fn entries(&self) -> Vec<RefLogEntry> {
        self.inner.lock().expect("ref log lock poisoned").entries.clone()
    }

    /// Materialize `{name -> {sha, version}}` at `at_version` by forward
    /// replay from the nearest checkpoint, honoring deletions.
    pub fn snapshot(&self, at_version: u64) -> HashMap<String, RefSnapshotEntry> {
        let inner = self.inner.lock().expect("ref log lock poisoned");

        let base = inner
            .checkpoints
            .iter()
            .rev()
            .find(|(v, _)| *v <= at_version);
        let (mut state, from_version) = match base {
            Some((v, state)) => (state.clone(), *v),
            None => (HashMap::new(), 0),
        };

        for entry in &inner.entries {
            if entry.version <= from_version || entry.version > at_version {
                continue;
            }
            apply_entry(&mut state, entry);
        }
        state
    }

    /// Current materialized state.
    pub fn state(&self) -> HashMap<String, RefSnapshotEntry> {
        self.snapshot(u64::MAX)
    }

    /// Persist any entries past the durable tail into a new Parquet file.
    /// Called after each committed ref batch and on shutdown.
    pub async fn persist_tail(&self) -> Result<(), GitError> {
        let (tail, through) = {
            let inner = self.inner.lock().expect("ref log lock poisoned");
            let tail: Vec<RefLogEntry> = inner
                .entries
                .iter()
                .filter(|e| e.version > inner.persisted_through)
                .cloned()
                .collect();
            let through = tail.last().map(|e| e.version);
            (tail, through)
        };
        let Some(through) = through else {
            return Ok(());
        };

        let bytes = write_log_rows(&tail)?;
        let key = self.paths.ref_log_key(through);
        self.bucket.put(&key, bytes).await?;

        let mut inner = self.inner.lock().expect("ref log lock poisoned");
        if inner.persisted_through < through {
            inner.persisted_through = through;
        }
        Ok(())
    }
}

fn apply_entry(state: &mut HashMap<String, RefSnapshotEntry>, entry: &RefLogEntry) {
    if entry.new_sha.is_empty() {
        state.remove(&entry.ref_name);
    } else {
        state.insert(
            entry.ref_name.clone(),
            RefSnapshotEntry {
                sha: entry.new_sha.clone(),
                version: entry.version,
            },
        );
    }
}

fn replay_entries(entries: &[RefLogEntry], at_version: u64) -> HashMap<String, RefSnapshotEntry> {
    let mut state = HashMap::new();
    for entry in entries {
        if entry.version > at_version {
            break;
        }
        apply_entry(&mut state, entry);
    }
    state
}

/// State of a branch fork: the parent log replayed to `base_version`, then
/// the branch log replayed on top.
pub fn fork_state(
    parent: &RefLog,
    base_version: u64,
    branch: &RefLog,
) -> HashMap<String, RefSnapshotEntry> {
    let mut state = parent.snapshot(base_version);
    for entry in branch.entries() {
        apply_entry(&mut state, &entry);
    }
    state
}

fn log_schema() -> Arc<SchemaType> {
    let version = SchemaType::primitive_type_builder("version", PhysicalType::INT64)
        .with_repetition(Repetition::REQUIRED)
        .build()
        .expect("static schema");
    let ref_name = SchemaType::primitive_type_builder("ref_name", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    let old_sha = SchemaType::primitive_type_builder("old_sha", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    let new_sha = SchemaType::primitive_type_builder("new_sha", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    let timestamp = SchemaType::primitive_type_builder("timestamp", PhysicalType::INT64)
        .with_repetition(Repetition::REQUIRED)
        .build()
        .expect("static schema");
    Arc::new(
        SchemaType::group_type_builder("ref_log")
            .with_fields(vec![
                Arc::new(version),
                Arc::new(ref_name),
                Arc::new(old_sha),
                Arc::new(new_sha),
                Arc::new(timestamp),
            ])
            .build()
            .expect("static schema"),
    )
}

fn write_log_rows(entries: &[RefLogEntry]) -> Result<Bytes, GitError> {
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let mut buf: Vec<u8> = Vec::new();
    let mut writer = SerializedFileWriter::new(&mut buf, log_schema(), props)?;
    let mut rg = writer.next_row_group()?;

    let versions: Vec<i64> = entries.iter().map(|e| e.version as i64).collect();
    let mut col = rg.next_column()?.expect("version column");
    col.typed::<Int64Type>().write_batch(&versions, None, None)?;
    col.close()?;

    for field in [
        entries
            .iter()
            .map(|e| ByteArray::from(e.ref_name.as_str()))
            .collect::<Vec<_>>(),
        entries
            .iter()
            .map(|e| ByteArray::from(e.old_sha.as_str()))
            .collect::<Vec<_>>(),
        entries
            .iter()
            .map(|e| ByteArray::from(e.new_sha.as_str()))
            .collect::<Vec<_>>(),
    ] {
        let mut col = rg.next_column()?.expect("string column");
        col.typed::<ByteArrayType>().write_batch(&field, None, None)?;
        col.close()?;
    }

    let timestamps: Vec<i64> = entries.iter().map(|e| e.timestamp).collect();
    let mut col = rg.next_column()?.expect("timestamp column");
    col.typed::<Int64Type>()
        .write_batch(&timestamps, None, None)?;
    col.close()?;

    rg.close()?;
    writer.close()?;
    Ok(Bytes::from(buf))
}

fn read_log_rows(bytes: &Bytes) -> Result<Vec<RefLogEntry>, GitError> {
    let reader = SerializedFileReader::new(bytes.clone())?;
    let mut entries = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        entries.push(RefLogEntry {
            version: row.get_long(0)?.max(0) as u64,
            ref_name: row.get_string(1)?.clone(),
            old_sha: row.get_string(2)?.clone(),
            new_sha: row.get_string(3)?.clone(),
            timestamp: row.get_long(4)?,
        });
    }
    Ok(entries)
}

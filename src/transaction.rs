//! The push transaction: buffer objects, flush them to the CAS, then apply a
//! batch of ref updates atomically. Either every command lands (objects
//! durable, table updated, log appended) or the ref state is byte-identical
//! to before; flushed objects may remain behind as safe orphans.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    cas::CasStore,
    config::BufferConfig,
    errors::GitError,
    hash::{ObjectHash, ZERO_ID},
    internal::object::types::ObjectType,
    refs::{
        log::RefLog,
        protection::{self, ProtectionRule, RefUpdate},
        store::{RefStore, apply_ref_update, expects_absent, read_ref_in},
    },
    scratchpad::{Scratchpad, now_secs},
};

/// Push transaction phases; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    Idle,
    Buffering,
    Flushing,
    UpdatingRefs,
    Completed,
    Failed,
}

/// One ref command of the batch.
#[derive(Debug, Clone)]
pub struct PushCommand {
    pub ref_name: String,
    /// 40-hex sha, or empty / the zero id for "must not exist".
    pub expected_old: String,
    /// 40-hex sha, or the zero id for deletion.
    pub new: String,
    /// Set only when the pusher advertised the force flag.
    pub is_force_push: bool,
}

impl PushCommand {
    pub fn is_delete(&self) -> bool {
        self.new == ZERO_ID
    }

    fn expects_absent(&self) -> bool {
        expects_absent(Some(self.expected_old.as_str()))
    }
}

/// Per-command outcome, mapping 1:1 onto the wire status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub ref_name: String,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Outcome of `execute`.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub success: bool,
    pub results: Vec<CommandResult>,
    /// Objects flushed by this push that no command ended up referencing;
    /// reclaimable by GC, never deleted synchronously.
    pub orphans: Vec<ObjectHash>,
}

/// Buffer -> flush -> CAS-ref-batch saga for one push.
pub struct PushTransaction {
    cas: Arc<CasStore>,
    refs: Arc<RefStore>,
    ref_log: Arc<RefLog>,
    scratchpad: Scratchpad,
    rules: Vec<ProtectionRule>,
    limits: BufferConfig,
    phase: PushPhase,
    buffered: HashMap<ObjectHash, (ObjectType, Vec<u8>)>,
    buffered_bytes: usize,
    orphan_tx: Option<mpsc::UnboundedSender<Vec<ObjectHash>>>,
}

impl PushTransaction {
    pub fn new(
        cas: Arc<CasStore>,
        refs: Arc<RefStore>,
        ref_log: Arc<RefLog>,
        scratchpad: Scratchpad,
        rules: Vec<ProtectionRule>,
        limits: BufferConfig,
    ) -> Self {
        Self {
            cas,
            refs,
            ref_log,
            scratchpad,
            rules,
            limits,
            phase: PushPhase::Idle,
            buffered: HashMap::new(),
            buffered_bytes: 0,
            orphan_tx: None,
        }
    }

    /// Wire up the orphan-cleanup sink.
    pub fn set_orphan_sink(&mut self, tx: mpsc::UnboundedSender<Vec<ObjectHash>>) {
        self.orphan_tx = Some(tx);
    }

    pub fn phase(&self) -> PushPhase {
        self.phase
    }

    /// Stage one object for this push. Dedups by id; enforces the buffer
    /// caps with a typed overflow error.
    pub fn buffer(&mut self, obj_type: ObjectType, body: Vec<u8>) -> Result<ObjectHash, GitError> {
        match self.phase {
            PushPhase::Idle => self.phase = PushPhase::Buffering,
            PushPhase::Buffering => {}
            other => {
                return Err(GitError::InvariantViolation(format!(
                    "buffer() called in phase {other:?}"
                )));
            }
        }

        let id = ObjectHash::from_type_and_data(obj_type, &body);
        if self.buffered.contains_key(&id) {
            return Ok(id);
        }

        if self.buffered.len() + 1 > self.limits.max_buffer_objects {
            return Err(GitError::BufferOverflow(format!(
                "push exceeds {} objects",
                self.limits.max_buffer_objects
            )));
        }
        if self.buffered_bytes + body.len() > self.limits.max_buffer_bytes {
            return Err(GitError::BufferOverflow(format!(
                "push exceeds {} buffered bytes",
                self.limits.max_buffer_bytes
            )));
        }

        self.buffered_bytes += body.len();
        self.buffered.insert(id, (obj_type, body));
        Ok(id)
    }

    /// Run the saga: flush buffered objects, pre-validate every command,
    /// then apply the whole batch in one scratchpad transaction.
    pub async fn execute(&mut self, commands: Vec<PushCommand>) -> Result<PushOutcome, GitError> {
        match self.phase {
            PushPhase::Idle | PushPhase::Buffering => {}
            other => {
                return Err(GitError::InvariantViolation(format!(
                    "execute() called in phase {other:?}"
                )));
            }
        }

        // Branch protection needs only the commands: evaluate it before any
        // object is flushed, so a denied push leaves no trace in the CAS or
        // the exact cache.
        for (idx, command) in commands.iter().enumerate() {
            let verdict = protection::check(
                &RefUpdate {
                    ref_name: &command.ref_name,
                    new_sha: &command.new,
                    is_force_push: command.is_force_push,
                },
                &self.rules,
            );
            if !verdict.allowed {
                self.phase = PushPhase::Failed;
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "protected branch".to_string());
                return Ok(self.all_failed(
                    &commands,
                    Some((idx, reason)),
                    "atomic push failed: protected branch",
                    Vec::new(),
                ));
            }
        }

        // Flush. A hard failure aborts with every command failed and no ref
        // changes.
        self.phase = PushPhase::Flushing;
        let newly_flushed = match self.flush_buffered().await {
            Ok(flushed) => flushed,
            Err(e) => {
                self.phase = PushPhase::Failed;
                tracing::error!(error = %e, "push flush failed");
                return Ok(self.all_failed(
                    &commands,
                    None,
                    &format!("atomic push failed: {e}"),
                    Vec::new(),
                ));
            }
        };

        // Pre-validate: every non-delete target must exist in the CAS,
        // including the just-flushed generation.
        for (idx, command) in commands.iter().enumerate() {
            if command.is_delete() {
                continue;
            }
            let new_id: ObjectHash = command
                .new
                .parse()
                .map_err(GitError::InvalidHashValue)?;
            if !self.cas.has(&new_id).await? {
                self.phase = PushPhase::Failed;
                return Ok(self.all_failed(
                    &commands,
                    Some((idx, format!("missing object {}", command.new))),
                    "atomic push failed: missing target object",
                    newly_flushed,
                ));
            }
        }

        // Step 3: the atomic ref batch, one scratchpad transaction.
        self.phase = PushPhase::UpdatingRefs;
        let txn = self.scratchpad.begin().await?;

        let mut lock_errors: Vec<(usize, String)> = Vec::new();
        let mut currents: Vec<Option<String>> = Vec::with_capacity(commands.len());
        for (idx, command) in commands.iter().enumerate() {
            let current = read_ref_in(&txn, &command.ref_name).await?;
            match (&current, command.expects_absent()) {
                (Some(_), true) => {
                    lock_errors.push((idx, "lock failed: ref already exists".to_string()));
                }
                (None, true) => {}
                (current, false) => {
                    if current.as_deref() != Some(command.expected_old.as_str()) {
                        lock_errors.push((idx, "lock failed: ref has been updated".to_string()));
                    }
                }
            }
            currents.push(current);
        }

        if !lock_errors.is_empty() {
            txn.rollback().await?;
            self.phase = PushPhase::Failed;
            let mut results: Vec<CommandResult> = commands
                .iter()
                .map(|c| CommandResult {
                    ref_name: c.ref_name.clone(),
                    ok: false,
                    reason: Some("atomic push failed: ref lock conflict".to_string()),
                })
                .collect();
            for (idx, reason) in lock_errors {
                results[idx].reason = Some(reason);
            }
            let orphans = self.report_orphans(newly_flushed);
            return Ok(PushOutcome {
                success: false,
                results,
                orphans,
            });
        }

        // All commands validated: apply with one timestamp, commit, then
        // append the matching log entries.
        let timestamp = now_secs();
        for (command, current) in commands.iter().zip(&currents) {
            apply_ref_update(
                &txn,
                &command.ref_name,
                &command.new,
                current.is_some(),
                timestamp,
            )
            .await?;
        }
        txn.commit().await?;

        for (command, current) in commands.iter().zip(&currents) {
            let old = current.as_deref().unwrap_or("");
            let new = if command.is_delete() { "" } else { &command.new };
            self.ref_log.append(&command.ref_name, old, new);
            self.refs.invalidate(&command.ref_name);
        }
        if let Err(e) = self.ref_log.persist_tail().await {
            // The table committed; the log tail will persist on the next
            // batch or at shutdown.
            tracing::warn!(error = %e, "ref log tail persistence deferred");
        }

        self.phase = PushPhase::Completed;
        tracing::debug!(commands = commands.len(), "push transaction committed");
        Ok(PushOutcome {
            success: true,
            results: commands
                .iter()
                .map(|c| CommandResult {
                    ref_name: c.ref_name.clone(),
                    ok: true,
                    reason: None,
                })
                .collect(),
            orphans: Vec::new(),
        })
    }

    /// Write buffered objects into the CAS and force a segment flush.
    /// Returns the ids that were actually new.
    async fn flush_buffered(&mut self) -> Result<Vec<ObjectHash>, GitError> {
        let mut newly_flushed = Vec::new();
        let staged: Vec<(ObjectHash, ObjectType, Vec<u8>)> = self
            .buffered
            .drain()
            .map(|(id, (t, body))| (id, t, body))
            .collect();
        self.buffered_bytes = 0;

        for (id, obj_type, body) in staged {
            if self.cas.has(&id).await? {
                continue;
            }
            let written = self.cas.put(obj_type, body).await?;
            debug_assert_eq!(written, id);
            newly_flushed.push(id);
        }
        if !newly_flushed.is_empty() {
            self.cas.flush().await?;
        }
        Ok(newly_flushed)
    }

    fn all_failed(
        &mut self,
        commands: &[PushCommand],
        offender: Option<(usize, String)>,
        generic: &str,
        newly_flushed: Vec<ObjectHash>,
    ) -> PushOutcome {
        let mut results: Vec<CommandResult> = commands
            .iter()
            .map(|c| CommandResult {
                ref_name: c.ref_name.clone(),
                ok: false,
                reason: Some(generic.to_string()),
            })
            .collect();
        if let Some((idx, reason)) = offender
            && let Some(result) = results.get_mut(idx)
        {
            result.reason = Some(reason);
        }
        let orphans = self.report_orphans(newly_flushed);
        PushOutcome {
            success: false,
            results,
            orphans,
        }
    }

    /// On rollback, the just-flushed objects are referenced only by failed
    /// commands; hand them to the cleanup sink.
    fn report_orphans(&self, newly_flushed: Vec<ObjectHash>) -> Vec<ObjectHash> {
        if newly_flushed.is_empty() {
            return newly_flushed;
        }
        if let Some(tx) = &self.orphan_tx {
            let _ = tx.send(newly_flushed.clone());
        }
        newly_flushed
    }
}

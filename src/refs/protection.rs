//! Branch protection: glob-pattern rules evaluated against each ref update
//! before the atomic batch applies. Patterns are exact names, a trailing
//! `/*` matching one remaining path segment, or a bare `*` matching all.

use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ZERO_ID,
    scratchpad::{Scratchpad, entity, now_secs},
};

/// One protection rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub pattern: String,
    pub required_reviews: u32,
    pub prevent_force_push: bool,
    pub prevent_deletion: bool,
    pub enabled: bool,
}

/// The update facts protection evaluates.
#[derive(Debug, Clone)]
pub struct RefUpdate<'a> {
    pub ref_name: &'a str,
    pub new_sha: &'a str,
    /// Only true when the pusher advertised the force flag; non-fast-forward
    /// detection is not inferred here.
    pub is_force_push: bool,
}

/// Verdict for one update: either allowed, or denied with the reason and the
/// offending rule's pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub rule: Option<String>,
}

impl ProtectionVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            rule: None,
        }
    }

    fn denied(reason: String, rule: &ProtectionRule) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            rule: Some(rule.pattern.clone()),
        }
    }
}

/// Match a rule pattern against a ref name: exact, `prefix/*` for exactly one
/// more segment, or `*` for anything.
pub fn pattern_matches(pattern: &str, ref_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return ref_name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|segment| !segment.is_empty() && !segment.contains('/'));
    }
    pattern == ref_name
}

/// Evaluate rules in list order; the first denial wins.
pub fn check(update: &RefUpdate, rules: &[ProtectionRule]) -> ProtectionVerdict {
    for rule in rules {
        if !rule.enabled || !pattern_matches(&rule.pattern, update.ref_name) {
            continue;
        }
        if update.new_sha == ZERO_ID && rule.prevent_deletion {
            return ProtectionVerdict::denied(
                format!(
                    "deletion of {} is blocked by rule {}",
                    update.ref_name, rule.pattern
                ),
                rule,
            );
        }
        if update.is_force_push && rule.prevent_force_push {
            return ProtectionVerdict::denied(
                format!(
                    "force push to {} is blocked by rule {}",
                    update.ref_name, rule.pattern
                ),
                rule,
            );
        }
        // No review system is wired in; a positive requirement denies until
        // an external approval signal exists.
        if rule.required_reviews > 0 {
            return ProtectionVerdict::denied(
                format!(
                    "{} requires {} review(s) per rule {}",
                    update.ref_name, rule.required_reviews, rule.pattern
                ),
                rule,
            );
        }
    }
    ProtectionVerdict::allowed()
}

/// Scratchpad-backed rule set.
pub struct ProtectionStore {
    scratchpad: Scratchpad,
}

impl ProtectionStore {
    pub fn new(scratchpad: Scratchpad) -> Self {
        Self { scratchpad }
    }

    pub async fn add_rule(&self, rule: &ProtectionRule) -> Result<(), GitError> {
        entity::branch_protection::ActiveModel {
            pattern: Set(rule.pattern.clone()),
            required_reviews: Set(rule.required_reviews as i32),
            prevent_force_push: Set(rule.prevent_force_push),
            prevent_deletion: Set(rule.prevent_deletion),
            enabled: Set(rule.enabled),
            created_at: Set(now_secs()),
            ..Default::default()
        }
        .insert(self.scratchpad.conn())
        .await?;
        Ok(())
    }

    /// Rules in insertion order.
    pub async fn rules(&self) -> Result<Vec<ProtectionRule>, GitError> {
        let rows = entity::branch_protection::Entity::find()
            .all(self.scratchpad.conn())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ProtectionRule {
                pattern: row.pattern,
                required_reviews: row.required_reviews.max(0) as u32,
                prevent_force_push: row.prevent_force_push,
                prevent_deletion: row.prevent_deletion,
                enabled: row.enabled,
            })
            .collect())
    }
}

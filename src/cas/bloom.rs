//! Existence filters fronting the segment store: a persisted bloom filter for
//! the conservative `may_exist` probe and an exact sha table for
//! `definitely_exists`. Object ids are already uniformly distributed, so the
//! k probe positions are derived straight from the id bytes rather than
//! re-hashing.

use std::sync::RwLock;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};

use crate::{
    config::BloomConfig,
    errors::GitError,
    hash::ObjectHash,
    internal::object::types::ObjectType,
    scratchpad::{Scratchpad, entity, now_secs},
};

/// In-memory bloom bitset.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    k: u32,
    item_count: u64,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at `false_positive_rate`.
    pub fn with_params(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as usize;
        let k = ((m_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        Self {
            bits: vec![0u8; m_bits.div_ceil(8)],
            k,
            item_count: 0,
        }
    }

    fn from_parts(bits: Vec<u8>, k: u32, item_count: u64) -> Self {
        Self {
            bits,
            k,
            item_count,
        }
    }

    fn positions(&self, id: &ObjectHash) -> impl Iterator<Item = usize> + '_ {
        let m = self.bits.len() * 8;
        let h1 = u64::from_be_bytes(id.0[0..8].try_into().expect("20-byte id"));
        // Odd step so every probe sequence cycles the whole bitset.
        let h2 = u64::from_be_bytes(id.0[8..16].try_into().expect("20-byte id")) | 1;
        (0..self.k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m as u64) as usize)
    }

    pub fn insert(&mut self, id: &ObjectHash) {
        let positions: Vec<usize> = self.positions(id).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
        self.item_count += 1;
    }

    /// Conservative membership: never a false negative for inserted ids.
    pub fn contains(&self, id: &ObjectHash) -> bool {
        self.positions(id)
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }
}

/// Bloom filter plus exact sha cache, persisted in the scratchpad.
pub struct BloomCache {
    scratchpad: Scratchpad,
    config: BloomConfig,
    filter: RwLock<BloomFilter>,
}

impl BloomCache {
    /// Restore the persisted filter, or build a fresh one when none exists.
    pub async fn load(scratchpad: Scratchpad, config: BloomConfig) -> Result<Self, GitError> {
        let row = entity::bloom_filter::Entity::find_by_id(1)
            .one(scratchpad.conn())
            .await?;
        let filter = match row {
            Some(row) => {
                BloomFilter::from_parts(row.bits, row.k as u32, row.item_count.max(0) as u64)
            }
            None => BloomFilter::with_params(config.expected_items, config.false_positive_rate),
        };
        Ok(Self {
            scratchpad,
            config,
            filter: RwLock::new(filter),
        })
    }

    /// O(1) probabilistic probe; no false negatives after `add`.
    pub fn may_exist(&self, id: &ObjectHash) -> bool {
        self.filter.read().expect("bloom lock poisoned").contains(id)
    }

    /// Exact probe against the sha cache table.
    pub async fn definitely_exists(&self, id: &ObjectHash) -> Result<bool, GitError> {
        Ok(entity::sha_cache::Entity::find_by_id(id.to_string())
            .one(self.scratchpad.conn())
            .await?
            .is_some())
    }

    /// Record a newly written object in both the filter and the exact table.
    pub async fn add(
        &self,
        id: &ObjectHash,
        obj_type: ObjectType,
        size: usize,
    ) -> Result<(), GitError> {
        self.filter
            .write()
            .expect("bloom lock poisoned")
            .insert(id);

        let existing = entity::sha_cache::Entity::find_by_id(id.to_string())
            .one(self.scratchpad.conn())
            .await?;
        if existing.is_none() {
            entity::sha_cache::ActiveModel {
                sha: Set(id.to_string()),
                otype: Set(obj_type.to_string()),
                size: Set(size as i64),
                added_at: Set(now_secs()),
            }
            .insert(self.scratchpad.conn())
            .await?;
        }
        Ok(())
    }

    /// Drop an id from the exact table; the bloom bits stay set until the
    /// next rebuild, which only costs a false positive.
    pub async fn remove_exact(&self, id: &ObjectHash) -> Result<(), GitError> {
        entity::sha_cache::Entity::delete_by_id(id.to_string())
            .exec(self.scratchpad.conn())
            .await?;
        Ok(())
    }

    /// Whether item_count has drifted far enough past the sizing target that
    /// the filter should be rebuilt from segment listings.
    pub fn needs_rebuild(&self) -> bool {
        let count = self
            .filter
            .read()
            .expect("bloom lock poisoned")
            .item_count();
        count as f64 > self.config.expected_items as f64 * self.config.rebuild_drift
    }

    /// Replace the filter with one rebuilt from the given ids and persist it.
    pub async fn rebuild<I>(&self, ids: I) -> Result<(), GitError>
    where
        I: IntoIterator<Item = ObjectHash>,
    {
        let mut fresh =
            BloomFilter::with_params(self.config.expected_items, self.config.false_positive_rate);
        for id in ids {
            fresh.insert(&id);
        }
        *self.filter.write().expect("bloom lock poisoned") = fresh;
        self.persist().await
    }

    /// Persist the current bitset as the singleton scratchpad row.
    pub async fn persist(&self) -> Result<(), GitError> {
        let (bits, k, item_count) = {
            let f = self.filter.read().expect("bloom lock poisoned");
            (f.bits.clone(), f.k, f.item_count)
        };
        let model = entity::bloom_filter::ActiveModel {
            id: Set(1),
            bits: Set(bits),
            k: Set(k as i32),
            item_count: Set(item_count as i64),
            updated_at: Set(now_secs()),
        };
        let existing = entity::bloom_filter::Entity::find_by_id(1)
            .one(self.scratchpad.conn())
            .await?;
        if existing.is_some() {
            model.update(self.scratchpad.conn()).await?;
        } else {
            model.insert(self.scratchpad.conn()).await?;
        }
        Ok(())
    }

    /// Whether bloom negatives should be double-checked against segments.
    pub fn verify_negatives(&self) -> bool {
        self.config.verify_negatives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// No false negatives: every inserted id probes positive.
    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_params(1000, 0.01);
        let ids: Vec<ObjectHash> = (0..1000)
            .map(|i| ObjectHash::new(format!("object-{i}").as_bytes()))
            .collect();
        for id in &ids {
            filter.insert(id);
        }
        assert!(ids.iter().all(|id| filter.contains(id)));
        assert_eq!(filter.item_count(), 1000);
    }

    /// False positive rate stays in the neighborhood of the target.
    #[test]
    fn test_false_positive_rate() {
        let mut filter = BloomFilter::with_params(1000, 0.01);
        for i in 0..1000 {
            filter.insert(&ObjectHash::new(format!("member-{i}").as_bytes()));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.contains(&ObjectHash::new(format!("absent-{i}").as_bytes())))
            .count();
        // Target is 1%; allow generous slack to keep the test stable.
        assert!(false_positives < 500, "fp count {false_positives}");
    }

    /// The cache persists across load cycles and tracks the exact table.
    #[tokio::test]
    async fn test_persist_and_reload() {
        let pad = Scratchpad::in_memory().await.unwrap();
        let cache = BloomCache::load(pad.clone(), BloomConfig::default())
            .await
            .unwrap();

        let id = ObjectHash::new(b"persisted object");
        cache.add(&id, ObjectType::Blob, 16).await.unwrap();
        assert!(cache.may_exist(&id));
        assert!(cache.definitely_exists(&id).await.unwrap());
        cache.persist().await.unwrap();

        let reloaded = BloomCache::load(pad, BloomConfig::default()).await.unwrap();
        assert!(reloaded.may_exist(&id));
        assert!(reloaded.definitely_exists(&id).await.unwrap());
    }

    /// remove_exact clears the exact table but not the filter bits.
    #[tokio::test]
    async fn test_remove_exact() {
        let pad = Scratchpad::in_memory().await.unwrap();
        let cache = BloomCache::load(pad, BloomConfig::default()).await.unwrap();
        let id = ObjectHash::new(b"to be deleted");
        cache.add(&id, ObjectType::Blob, 4).await.unwrap();
        cache.remove_exact(&id).await.unwrap();
        assert!(!cache.definitely_exists(&id).await.unwrap());
        assert!(cache.may_exist(&id));
    }

    /// Drift detection fires once item_count exceeds the configured factor.
    #[tokio::test]
    async fn test_needs_rebuild() {
        let pad = Scratchpad::in_memory().await.unwrap();
        let config = BloomConfig {
            expected_items: 4,
            rebuild_drift: 2.0,
            ..BloomConfig::default()
        };
        let cache = BloomCache::load(pad, config).await.unwrap();
        for i in 0..9 {
            cache
                .add(&ObjectHash::new(format!("{i}").as_bytes()), ObjectType::Blob, 1)
                .await
                .unwrap();
        }
        assert!(cache.needs_rebuild());

        cache.rebuild(vec![ObjectHash::new(b"only one")]).await.unwrap();
        assert!(!cache.needs_rebuild());
        assert!(cache.may_exist(&ObjectHash::new(b"only one")));
    }
}

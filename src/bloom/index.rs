//! Per-organization bloom filters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::BloomConfig;
use crate::entity::Entity;
use crate::ids::OrgId;
use crate::normalize::tokens;
use crate::storage::{EntityStore, StorageError};

use super::filter::BloomFilter;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Point-in-time view of one organization's filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomStats {
    /// Keys inserted since the last rebuild.
    pub insertions: usize,
    /// Design capacity.
    pub capacity: usize,
    /// Bits in the filter.
    pub num_bits: u64,
    /// Expected false-positive rate at the current fill.
    pub estimated_false_positive_rate: f64,
}

/// One bloom filter per organization, keyed by the tokens of each active
/// entity's normalized canonical text.
///
/// Filters are created on first use by scanning the organization's entities
/// in the store, so a fresh process never reports a false negative for
/// entities written by an earlier one.
#[derive(Debug)]
pub struct BloomIndex {
    config: BloomConfig,
    filters: RwLock<HashMap<OrgId, Arc<RwLock<BloomFilter>>>>,
}

impl BloomIndex {
    #[must_use]
    pub fn new(config: BloomConfig) -> Self {
        Self {
            config,
            filters: RwLock::new(HashMap::new()),
        }
    }

    fn build<S: EntityStore + ?Sized>(
        &self,
        org_id: OrgId,
        store: &S,
        min_capacity: usize,
    ) -> Result<BloomFilter, StorageError> {
        let entities = store.entities_for_org(org_id)?;
        let keys: Vec<String> = entities
            .iter()
            .filter(|e| e.is_active())
            .flat_map(|e| tokens(&e.normalized_text).map(str::to_string).collect::<Vec<_>>())
            .collect();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let grown = (keys.len() as f64 * self.config.rebuild_growth_factor).ceil() as usize;
        let capacity = self.config.expected_entities.max(min_capacity).max(grown);

        let mut filter = BloomFilter::with_capacity(capacity, self.config.false_positive_rate);
        for key in &keys {
            filter.insert(key);
        }
        tracing::debug!(
            org_id = %org_id,
            keys = keys.len(),
            capacity,
            "bloom filter built"
        );
        Ok(filter)
    }

    fn filter_for<S: EntityStore + ?Sized>(
        &self,
        org_id: OrgId,
        store: &S,
    ) -> Result<Arc<RwLock<BloomFilter>>, StorageError> {
        {
            let filters = self.filters.read().map_err(|_| lock_err("bloom.filters"))?;
            if let Some(filter) = filters.get(&org_id) {
                return Ok(Arc::clone(filter));
            }
        }

        let built = Arc::new(RwLock::new(self.build(org_id, store, 0)?));
        let mut filters = self.filters.write().map_err(|_| lock_err("bloom.filters"))?;
        // Another thread may have bootstrapped the same org meanwhile.
        Ok(Arc::clone(filters.entry(org_id).or_insert(built)))
    }

    /// Returns false only if no active entity of `org_id` shares a token
    /// with `normalized`.
    ///
    /// # Errors
    /// Returns a `StorageError` if bootstrapping the filter fails.
    pub fn may_match<S: EntityStore + ?Sized>(
        &self,
        org_id: OrgId,
        normalized: &str,
        store: &S,
    ) -> Result<bool, StorageError> {
        let filter = self.filter_for(org_id, store)?;
        let filter = filter.read().map_err(|_| lock_err("bloom.filter"))?;
        Ok(tokens(normalized).any(|token| filter.may_contain(token)))
    }

    /// Adds an entity's keys, rebuilding the filter if it saturates.
    ///
    /// # Errors
    /// Returns a `StorageError` if bootstrapping or rebuilding fails.
    pub fn insert_entity<S: EntityStore + ?Sized>(
        &self,
        entity: &Entity,
        store: &S,
    ) -> Result<(), StorageError> {
        let filter = self.filter_for(entity.org_id, store)?;
        let mut filter = filter.write().map_err(|_| lock_err("bloom.filter"))?;
        for token in tokens(&entity.normalized_text) {
            filter.insert(token);
        }
        if filter.is_saturated() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let grown = (filter.capacity() as f64 * self.config.rebuild_growth_factor).ceil() as usize;
            let mut rebuilt = self.build(entity.org_id, store, grown)?;
            // The caller may index an entity before its commit is visible.
            for token in tokens(&entity.normalized_text) {
                rebuilt.insert(token);
            }
            tracing::info!(
                org_id = %entity.org_id,
                old_capacity = filter.capacity(),
                new_capacity = rebuilt.capacity(),
                "bloom filter saturated, rebuilt"
            );
            *filter = rebuilt;
        }
        Ok(())
    }

    /// Discards and rebuilds an organization's filter from the store.
    ///
    /// # Errors
    /// Returns a `StorageError` if the store scan fails.
    pub fn rebuild<S: EntityStore + ?Sized>(&self, org_id: OrgId, store: &S) -> Result<(), StorageError> {
        let rebuilt = Arc::new(RwLock::new(self.build(org_id, store, 0)?));
        self.filters
            .write()
            .map_err(|_| lock_err("bloom.filters"))?
            .insert(org_id, rebuilt);
        Ok(())
    }

    /// Copy of an organization's filter, if one is loaded.
    ///
    /// # Errors
    /// Returns `BackendError` if a lock is poisoned.
    pub fn snapshot(&self, org_id: OrgId) -> Result<Option<BloomFilter>, StorageError> {
        let filters = self.filters.read().map_err(|_| lock_err("bloom.filters"))?;
        filters
            .get(&org_id)
            .map(|f| f.read().map(|f| f.clone()).map_err(|_| lock_err("bloom.filter")))
            .transpose()
    }

    /// Installs a previously saved filter for an organization.
    ///
    /// # Errors
    /// Returns `BackendError` if a lock is poisoned.
    pub fn restore(&self, org_id: OrgId, filter: BloomFilter) -> Result<(), StorageError> {
        self.filters
            .write()
            .map_err(|_| lock_err("bloom.filters"))?
            .insert(org_id, Arc::new(RwLock::new(filter)));
        Ok(())
    }

    /// Organizations with a loaded filter.
    ///
    /// # Errors
    /// Returns `BackendError` if a lock is poisoned.
    pub fn loaded_orgs(&self) -> Result<Vec<OrgId>, StorageError> {
        let filters = self.filters.read().map_err(|_| lock_err("bloom.filters"))?;
        let mut orgs: Vec<OrgId> = filters.keys().copied().collect();
        orgs.sort();
        Ok(orgs)
    }

    /// Fill statistics for a loaded filter.
    ///
    /// # Errors
    /// Returns `BackendError` if a lock is poisoned.
    pub fn stats(&self, org_id: OrgId) -> Result<Option<BloomStats>, StorageError> {
        Ok(self.snapshot(org_id)?.map(|f| BloomStats {
            insertions: f.insertions(),
            capacity: f.capacity(),
            num_bits: f.num_bits(),
            estimated_false_positive_rate: f.estimated_false_positive_rate(),
        }))
    }
}

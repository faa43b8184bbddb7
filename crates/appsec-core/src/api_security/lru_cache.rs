// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LruCacheError {
    #[error("appsec: LRU cache capacity must be a positive integer, got {0}")]
    InvalidCapacity(usize),
}

/// Fixed-capacity map evicting the least recently used entry.
///
/// Each entry records the tick of its last use; `order` maps ticks back to
/// keys so the oldest entry is found without scanning.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    max_size: NonZeroUsize,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(max_size: usize) -> Result<Self, LruCacheError> {
        NonZeroUsize::new(max_size)
            .map(Self::with_capacity)
            .ok_or(LruCacheError::InvalidCapacity(max_size))
    }

    pub fn with_capacity(max_size: NonZeroUsize) -> Self {
        Self {
            max_size,
            entries: HashMap::with_capacity(max_size.get()),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Returns the value for `key`, computing and storing it when absent.
    ///
    /// Either way the entry becomes the most recently used.
    pub fn fetch_or_store<F>(&mut self, key: K, compute: F) -> &V
    where
        F: FnOnce() -> V,
    {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let tick = self.next_tick();
        let order = &mut self.order;
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let previous = std::mem::replace(&mut entry.get_mut().1, tick);
                order.remove(&previous);
                order.insert(tick, entry.key().clone());
                &entry.into_mut().0
            }
            Entry::Vacant(entry) => {
                let value = compute();
                order.insert(tick, entry.key().clone());
                &entry.insert((value, tick)).0
            }
        }
    }

    /// Stores `value`, overwriting any previous value and marking it most recently used.
    pub fn store(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let tick = self.next_tick();
        if let Some((_, previous)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&previous);
        }
        self.order.insert(tick, key);
    }

    /// Returns the value for `key`. A hit counts as a use.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (value, last_used) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(last_used, tick);
        self.order.remove(&previous);
        self.order.insert(tick, key.clone());
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evicts the least recently used entry if inserting a new key would exceed capacity.
    fn make_room(&mut self) {
        if self.entries.len() < self.max_size.get() {
            return;
        }
        if let Some((_, oldest)) = self.order.pop_first() {
            self.entries.remove(&oldest);
        }
    }
}

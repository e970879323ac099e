use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Locally cached view of discovered endpoints, key to sorted set of values.
///
/// Keys present here are the ones subscribed by the discovery loop.
#[derive(Default)]
pub struct DiscoveryCache {
    map: DashMap<String, BTreeSet<String>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of `key`, returns true when the content changed
    pub fn update(&self, key: &str, values: BTreeSet<String>) -> bool {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut cur) => {
                if *cur.get() == values {
                    return false;
                }
                cur.insert(values);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(values);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<BTreeSet<String>> {
        self.map.get(key).map(|item| item.value().clone())
    }

    pub fn keys(&self) -> HashSet<String> {
        self.map.iter().map(|item| item.key().clone()).collect()
    }

    /// Returns the cached sets, and whether every key is present
    pub fn lookup(&self, keys: &HashSet<String>) -> (HashMap<String, BTreeSet<String>>, bool) {
        let mut found = HashMap::with_capacity(keys.len());
        let mut complete = true;
        for key in keys {
            match self.get(key) {
                Some(values) => {
                    found.insert(key.clone(), values);
                }
                None => complete = false,
            }
        }
        (found, complete)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

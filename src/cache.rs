//! C6 — Cache Gate, and its `CacheBackend` capability contract.
//!
//! The gate owns "what a cache entry means": key normalization, canonical vs.
//! legacy serialization, and popularity bookkeeping. The backend owns only
//! opaque byte storage; a `parking_lot::Mutex`-guarded in-memory map is the
//! default, mirroring the teacher's preference for `parking_lot` over
//! `std::sync::Mutex` for uncontended, short critical sections.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::{CacheEntry, NormalizedKey, PopularQuery, SparqlPayload};
use crate::plan::{parse_cached_payload, to_canonical_text};

/// Opaque byte-level storage. Implementations need not know what a record
/// means, only how to get/put/enumerate it by key.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredRecord>;
    fn put(&self, key: String, record: StoredRecord);
    fn enumerate(&self) -> Vec<(String, StoredRecord)>;
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub raw_sparql: String,
    pub original_query: String,
    pub count: u64,
}

#[derive(Default)]
pub struct InMemoryCacheBackend {
    records: Mutex<HashMap<String, StoredRecord>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, key: &str) -> Option<StoredRecord> {
        self.records.lock().get(key).cloned()
    }

    fn put(&self, key: String, record: StoredRecord) {
        self.records.lock().insert(key, record);
    }

    fn enumerate(&self) -> Vec<(String, StoredRecord)> {
        self.records.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Normalization/serialization layer over a `CacheBackend`.
pub struct CacheGate {
    backend: Box<dyn CacheBackend>,
    /// Insertion order of keys, for popularity tie-breaking — a `HashMap`
    /// alone cannot recover insertion order once entries are re-stored.
    insertion_order: Mutex<Vec<String>>,
}

impl CacheGate {
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        Self { backend: Box::new(backend), insertion_order: Mutex::new(Vec::new()) }
    }

    /// Look up a prior plan by normalized key. Increments the entry's count
    /// as a side effect of a hit.
    pub fn lookup(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        let record = self.backend.get(&key.0)?;
        let payload = parse_cached_payload(&record.raw_sparql);

        let bumped = StoredRecord { count: record.count + 1, ..record };
        self.backend.put(key.0.clone(), bumped.clone());

        Some(CacheEntry {
            sparql: payload,
            count: bumped.count,
            original_query: bumped.original_query,
            normalized_query: key.clone(),
        })
    }

    /// Store a successful plan in canonical form, keyed by the normalized
    /// query. A fresh entry starts at count 1; re-storing an existing key
    /// preserves its accumulated count.
    pub fn store(&self, key: NormalizedKey, payload: SparqlPayload, original_query: &str) {
        let canonical = to_canonical_text(&payload);
        let existing_count = self.backend.get(&key.0).map(|r| r.count).unwrap_or(0);

        let is_new = existing_count == 0;
        self.backend.put(
            key.0.clone(),
            StoredRecord {
                raw_sparql: canonical,
                original_query: original_query.to_string(),
                count: existing_count.max(1),
            },
        );

        if is_new {
            self.insertion_order.lock().push(key.0);
        }
    }

    /// Top-N entries by count descending, ties broken by insertion order.
    pub fn popular(&self, limit: usize) -> Vec<PopularQuery> {
        let order = self.insertion_order.lock();
        let rank: HashMap<&str, usize> = order.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();

        let mut entries: Vec<(String, StoredRecord)> = self.backend.enumerate();
        entries.sort_by(|(ka, a), (kb, b)| {
            b.count
                .cmp(&a.count)
                .then_with(|| rank.get(ka.as_str()).unwrap_or(&usize::MAX).cmp(rank.get(kb.as_str()).unwrap_or(&usize::MAX)))
        });

        entries
            .into_iter()
            .take(limit)
            .map(|(normalized_query, record)| PopularQuery {
                original_query: record.original_query,
                normalized_query,
                count: record.count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> CacheGate {
        CacheGate::new(InMemoryCacheBackend::new())
    }

    #[test]
    fn miss_returns_none() {
        let gate = gate();
        let key = NormalizedKey::from_effective_query("nothing here");
        assert!(gate.lookup(&key).is_none());
    }

    #[test]
    fn store_then_lookup_round_trips_single_payload() {
        let gate = gate();
        let key = NormalizedKey::from_effective_query("how many blocks");
        gate.store(key.clone(), SparqlPayload::Single("SELECT ?x WHERE { ?x a ?t }".to_string()), "How many blocks?");

        let entry = gate.lookup(&key).unwrap();
        assert_eq!(entry.sparql, SparqlPayload::Single("SELECT ?x WHERE { ?x a ?t }".to_string()));
        assert_eq!(entry.count, 1);
    }

    #[test]
    fn lookup_increments_count() {
        let gate = gate();
        let key = NormalizedKey::from_effective_query("q");
        gate.store(key.clone(), SparqlPayload::Single("SELECT * WHERE {}".to_string()), "q");
        gate.lookup(&key);
        gate.lookup(&key);
        let entry = gate.lookup(&key).unwrap();
        assert_eq!(entry.count, 4);
    }

    #[test]
    fn popular_breaks_ties_by_insertion_order() {
        let gate = gate();
        gate.store(NormalizedKey::from_effective_query("a"), SparqlPayload::Single("SELECT * WHERE {}".to_string()), "a");
        gate.store(NormalizedKey::from_effective_query("b"), SparqlPayload::Single("SELECT * WHERE {}".to_string()), "b");

        let top = gate.popular(10);
        assert_eq!(top[0].normalized_query, "a");
        assert_eq!(top[1].normalized_query, "b");
    }

    #[test]
    fn popular_sorts_by_count_descending() {
        let gate = gate();
        let key_a = NormalizedKey::from_effective_query("a");
        let key_b = NormalizedKey::from_effective_query("b");
        gate.store(key_a.clone(), SparqlPayload::Single("SELECT * WHERE {}".to_string()), "a");
        gate.store(key_b.clone(), SparqlPayload::Single("SELECT * WHERE {}".to_string()), "b");
        gate.lookup(&key_b);
        gate.lookup(&key_b);

        let top = gate.popular(10);
        assert_eq!(top[0].normalized_query, "b");
        assert_eq!(top[1].normalized_query, "a");
    }
}

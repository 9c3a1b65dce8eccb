use std::sync::Arc;

use quick_cache::sync::Cache;

use crate::history::TransactionHistoryResponse;
use crate::types::Address;

/// Bounded cache of assembled history responses.
///
/// The dataset never changes, so entries never need invalidation; the only
/// pressure is capacity. Keyed by address and page size, since the same
/// address queried with a different cap yields a different body.
pub struct HistoryCache {
    responses: Cache<(Address, usize), Arc<TransactionHistoryResponse>>,
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            responses: Cache::new(capacity),
        }
    }

    pub fn get(&self, address: &Address, max_results: usize) -> Option<Arc<TransactionHistoryResponse>> {
        self.responses.get(&(*address, max_results))
    }

    pub fn insert(&self, address: Address, max_results: usize, response: Arc<TransactionHistoryResponse>) {
        self.responses.insert((address, max_results), response);
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(address: &Address, max_results: usize) -> Arc<TransactionHistoryResponse> {
        Arc::new(TransactionHistoryResponse {
            address_type: address.kind(),
            address: address.to_hex(),
            max_results: max_results as u32,
            count: 0,
            history: Vec::new(),
            ledger_index: 1,
        })
    }

    #[test]
    fn hit_returns_the_shared_response() {
        let cache = HistoryCache::new(4);
        let address = Address::ed25519([0xaa; 32]);

        assert!(cache.get(&address, 100).is_none());

        let stored = response(&address, 100);
        cache.insert(address, 100, stored.clone());

        let hit = cache.get(&address, 100).unwrap();
        assert!(Arc::ptr_eq(&stored, &hit));

        // A different page size is a different body.
        assert!(cache.get(&address, 10).is_none());
    }

    #[test]
    fn capacity_bounds_the_entry_count() {
        let cache = HistoryCache::new(2);
        for byte in 0..8u8 {
            let address = Address::ed25519([byte; 32]);
            cache.insert(address, 100, response(&address, 100));
        }
        assert!(cache.len() <= 2);
        assert!(!cache.is_empty());
    }
}

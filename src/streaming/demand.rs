//! Per-client demand bookkeeping.
//!
//! Tracks which chunk indices each client is currently waiting for. Pure
//! bookkeeping; the controller triggers scheduling after every mutation.

use std::collections::{BTreeSet, HashMap};

/// Client identity derived from the connection's remote address.
///
/// Diagnostic only; it does not need to be globally unique.
pub type ClientId = String;

#[derive(Debug, Default)]
pub struct DemandTracker {
    clients: HashMap<ClientId, BTreeSet<usize>>,
}

impl DemandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `client` wants `index`.
    pub fn add(&mut self, client: &str, index: usize) {
        self.clients
            .entry(client.to_string())
            .or_default()
            .insert(index);
    }

    /// Drop `client`'s interest in `index`, if any.
    pub fn remove(&mut self, client: &str, index: usize) {
        if let Some(chunks) = self.clients.get_mut(client) {
            chunks.remove(&index);
            if chunks.is_empty() {
                self.clients.remove(client);
            }
        }
    }

    /// Drop every client's interest in `index` (the slot was just filled).
    pub fn remove_all(&mut self, index: usize) {
        self.clients.retain(|_, chunks| {
            chunks.remove(&index);
            !chunks.is_empty()
        });
    }

    /// Whether `client` currently wants `index`.
    pub fn contains(&self, client: &str, index: usize) -> bool {
        self.clients
            .get(client)
            .is_some_and(|chunks| chunks.contains(&index))
    }

    /// All demanded indices, deduplicated across clients, in increasing order.
    pub fn indices(&self) -> BTreeSet<usize> {
        self.clients.values().flatten().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove() {
        let mut demand = DemandTracker::new();
        demand.add("a", 3);
        demand.add("a", 7);
        demand.add("b", 3);

        assert_eq!(demand.indices().into_iter().collect::<Vec<_>>(), [3, 7]);

        demand.remove("a", 3);
        // Client b still wants 3.
        assert!(demand.indices().contains(&3));

        demand.remove("b", 3);
        assert_eq!(demand.indices().into_iter().collect::<Vec<_>>(), [7]);
    }

    #[test]
    fn remove_all_clears_index_for_every_client() {
        let mut demand = DemandTracker::new();
        demand.add("a", 5);
        demand.add("b", 5);
        demand.add("b", 6);

        demand.remove_all(5);
        assert_eq!(demand.indices().into_iter().collect::<Vec<_>>(), [6]);
    }

    #[test]
    fn client_entry_disappears_with_last_index() {
        let mut demand = DemandTracker::new();
        demand.add("a", 1);
        demand.remove("a", 1);
        assert!(demand.is_empty());
    }

    #[test]
    fn remove_unknown_client_is_noop() {
        let mut demand = DemandTracker::new();
        demand.remove("ghost", 0);
        assert!(demand.is_empty());
    }
}

use crate::crypto::IssuedKey;
use crate::issuance::IssueError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// `None` until the generation for a name finishes
pub type Outcome = Option<Result<Arc<IssuedKey>, IssueError>>;

/// Result of a cache lookup
pub enum Lookup {
    /// Someone already asked for this name; wait on the receiver
    Pending(watch::Receiver<Outcome>),
    /// This caller created the entry and must arrange for the sender to be completed
    Created(watch::Sender<Outcome>, watch::Receiver<Outcome>),
}

/// In-flight and completed issuance results keyed by subject name.
#[derive(Default)]
pub struct IssuanceCache {
    entries: Mutex<HashMap<String, watch::Receiver<Outcome>>>,
}

impl IssuanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing entry for `name`, or atomically create one
    pub fn lookup_or_insert(&self, name: &str) -> Lookup {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(receiver) = entries.get(name) {
            return Lookup::Pending(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        entries.insert(name.to_string(), receiver.clone());
        Lookup::Created(sender, receiver)
    }

    /// Remove the entry for `name` only if it is still the one `receiver` belongs to
    pub fn evict(&self, name: &str, receiver: &watch::Receiver<Outcome>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(name) {
            Some(current) if current.same_channel(receiver) => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_lookup_creates_entry() {
        let cache = IssuanceCache::new();
        assert!(cache.is_empty());

        assert!(matches!(cache.lookup_or_insert("alice"), Lookup::Created(..)));
        assert!(matches!(cache.lookup_or_insert("alice"), Lookup::Pending(_)));
        assert!(matches!(cache.lookup_or_insert("bob"), Lookup::Created(..)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_pending_receivers_see_the_published_outcome() {
        let cache = IssuanceCache::new();
        let Lookup::Created(sender, _) = cache.lookup_or_insert("alice") else {
            panic!("expected a new entry");
        };
        let Lookup::Pending(receiver) = cache.lookup_or_insert("alice") else {
            panic!("expected a pending entry");
        };

        sender.send_replace(Some(Err(IssueError::Generation("boom".to_string()))));
        assert!(matches!(
            &*receiver.borrow(),
            Some(Err(IssueError::Generation(msg))) if msg == "boom"
        ));
    }

    #[test]
    fn test_evict_only_removes_matching_entry() {
        let cache = IssuanceCache::new();
        let Lookup::Created(_, stale) = cache.lookup_or_insert("alice") else {
            panic!("expected a new entry");
        };
        assert!(cache.evict("alice", &stale));
        assert!(cache.is_empty());

        let Lookup::Created(_, fresh) = cache.lookup_or_insert("alice") else {
            panic!("expected a new entry");
        };
        // The stale receiver no longer owns the slot
        assert!(!cache.evict("alice", &stale));
        assert_eq!(cache.len(), 1);
        assert!(cache.evict("alice", &fresh));
        assert!(!cache.evict("missing", &fresh));
    }
}

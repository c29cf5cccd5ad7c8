use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use crate::messaging::message::MessageId;

/// Ids of recently accepted messages per source node, for duplicate detection. Entries are
///  evicted by age.
#[derive(Default)]
pub struct RecentMessages {
    by_source: Mutex<FxHashMap<String, FxHashMap<MessageId, Instant>>>,
}

impl RecentMessages {
    pub fn new() -> RecentMessages {
        Default::default()
    }

    /// Returns `true` if the id was added, `false` if it was present already. Checking and
    ///  inserting is atomic, so concurrent arrivals of the same message are detected reliably.
    pub fn insert_if_absent(&self, source: &str, message_id: MessageId, now: Instant) -> bool {
        let mut by_source = self.by_source.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ids) = by_source.get_mut(source) {
            return match ids.entry(message_id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(e) => {
                    e.insert(now);
                    true
                }
            };
        }

        by_source.entry(source.to_string())
            .or_default()
            .insert(message_id, now);
        true
    }

    pub fn contains(&self, source: &str, message_id: MessageId) -> bool {
        self.by_source.lock().unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .map(|ids| ids.contains_key(&message_id))
            .unwrap_or(false)
    }

    /// Returns the number of evicted entries
    pub fn evict_older_than(&self, cutoff: Instant) -> usize {
        let mut by_source = self.by_source.lock().unwrap_or_else(PoisonError::into_inner);

        let mut num_evicted = 0;
        for ids in by_source.values_mut() {
            let len_before = ids.len();
            ids.retain(|_, received| *received >= cutoff);
            num_evicted += len_before - ids.len();
        }
        by_source.retain(|_, ids| !ids.is_empty());
        num_evicted
    }

    pub fn len(&self) -> usize {
        self.by_source.lock().unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|ids| ids.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

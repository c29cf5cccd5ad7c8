use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// Restores arrival order after work was spread across concurrent workers.
///
/// A ticket is drawn when a payload arrives, before it is handed to a worker. Workers complete
///  their tickets in any order; completed items are parked until all earlier tickets are
///  complete, and then released strictly in ticket order. Releases happen while holding the
///  sequencer's lock, so the release function must not block.
pub struct ArrivalSequencer<T> {
    next_ticket: AtomicU64,
    state: Mutex<SequencerState<T>>,
}

struct SequencerState<T> {
    next_to_release: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> Default for ArrivalSequencer<T> {
    fn default() -> Self {
        ArrivalSequencer {
            next_ticket: AtomicU64::new(0),
            state: Mutex::new(SequencerState {
                next_to_release: 0,
                parked: BTreeMap::default(),
            }),
        }
    }
}

impl<T> ArrivalSequencer<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn next_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::AcqRel)
    }

    /// Every ticket must be completed exactly once, even if there is nothing to release for it:
    ///  later tickets are held back until it is.
    pub fn complete(&self, ticket: u64, item: T, mut release: impl FnMut(T)) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        if ticket < state.next_to_release || state.parked.contains_key(&ticket) {
            debug!(ticket, "ticket was completed before - ignoring");
            return;
        }
        state.parked.insert(ticket, item);

        while let Some(item) = state.parked.remove(&state.next_to_release) {
            state.next_to_release += 1;
            release(item);
        }
        if !state.parked.is_empty() {
            trace!(waiting_for = state.next_to_release, num_parked = state.parked.len(), "waiting for earlier arrivals");
        }
    }

    /// number of completed items waiting for earlier tickets
    pub fn num_parked(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .parked.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use rand::seq::SliceRandom;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_release_in_ticket_order() {
        let sequencer = ArrivalSequencer::new();
        let tickets = (0..3).map(|_| sequencer.next_ticket()).collect::<Vec<_>>();
        assert_eq!(tickets, vec![0, 1, 2]);

        let mut released = Vec::new();
        sequencer.complete(2, "c", |x| released.push(x));
        sequencer.complete(1, "b", |x| released.push(x));
        assert!(released.is_empty());
        assert_eq!(sequencer.num_parked(), 2);

        sequencer.complete(0, "a", |x| released.push(x));
        assert_eq!(released, vec!["a", "b", "c"]);
        assert_eq!(sequencer.num_parked(), 0);
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let sequencer = ArrivalSequencer::new();
        let mut released = Vec::new();

        sequencer.complete(0, "a", |x| released.push(x));
        sequencer.complete(0, "again", |x| released.push(x));
        sequencer.complete(2, "c", |x| released.push(x));
        sequencer.complete(2, "again", |x| released.push(x));
        sequencer.complete(1, "b", |x| released.push(x));

        assert_eq!(released, vec!["a", "b", "c"]);
    }

    #[rstest]
    #[case::two_workers(2)]
    #[case::eight_workers(8)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completion(#[case] num_workers: usize) {
        let sequencer = Arc::new(ArrivalSequencer::new());
        let released = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = (0..1000)
            .map(|_| sequencer.next_ticket())
            .collect::<Vec<_>>();
        tickets.shuffle(&mut rand::thread_rng());

        let handles = tickets.chunks(tickets.len() / num_workers)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                let sequencer = sequencer.clone();
                let released = released.clone();
                tokio::spawn(async move {
                    for ticket in chunk {
                        sequencer.complete(ticket, ticket, |x| released.lock().unwrap().push(x));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*released.lock().unwrap(), (0..1000).collect::<Vec<_>>());
    }
}

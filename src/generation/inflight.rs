use super::record::GenerationRecord;
use crate::error::ErrorKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

type Key = (String, u32);

/// Cloneable failure carried to coalesced followers; raw errors are not
/// cloneable across waiters.
#[derive(Debug, Clone)]
pub struct SharedFailure {
    pub kind: ErrorKind,
    pub message: String,
}

pub type SharedOutcome = Result<GenerationRecord, SharedFailure>;

/// Per `(project_id, chapter_number)` single-flight map. The first caller
/// leads and runs the generation; concurrent callers for the same key
/// join and receive the leader's outcome with `coalesced = true`.
#[derive(Default)]
pub struct InFlightGenerations {
    inner: Arc<Mutex<HashMap<Key, watch::Receiver<Option<SharedOutcome>>>>>,
}

pub enum Flight {
    Lead(LeaderGuard),
    Join(watch::Receiver<Option<SharedOutcome>>),
}

impl InFlightGenerations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Either become the leader for this key or join the flight already in
    /// progress.
    #[must_use]
    pub fn begin(&self, project_id: &str, chapter_number: u32) -> Flight {
        let key = (project_id.to_string(), chapter_number);
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(receiver) = map.get(&key) {
            return Flight::Join(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        map.insert(key.clone(), receiver);
        Flight::Lead(LeaderGuard {
            map: Arc::clone(&self.inner),
            key,
            sender: Some(sender),
        })
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the leader while generating. Publishing releases every joined
/// waiter and clears the key; dropping without publishing reports an
/// aborted flight instead of hanging the followers.
pub struct LeaderGuard {
    map: Arc<Mutex<HashMap<Key, watch::Receiver<Option<SharedOutcome>>>>>,
    key: Key,
    sender: Option<watch::Sender<Option<SharedOutcome>>>,
}

impl LeaderGuard {
    pub fn publish(mut self, outcome: SharedOutcome) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(outcome));
        }
        self.clear();
    }

    fn clear(&self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(Err(SharedFailure {
                kind: ErrorKind::Cancelled,
                message: "generation aborted before completing".into(),
            })));
            self.clear();
        }
    }
}

/// Wait on a joined flight until the leader publishes.
pub async fn await_flight(
    mut receiver: watch::Receiver<Option<SharedOutcome>>,
) -> SharedOutcome {
    loop {
        if let Some(outcome) = receiver.borrow().clone() {
            return outcome;
        }
        if receiver.changed().await.is_err() {
            return Err(SharedFailure {
                kind: ErrorKind::Cancelled,
                message: "generation flight vanished".into(),
            });
        }
    }
}

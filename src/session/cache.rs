use super::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// In-process session cache with per-session serialization locks.
///
/// One shared instance serves both the plain and the streaming chat paths,
/// so turns arriving on either path for the same session queue behind the
/// same lock. Bounded LRU: least-recently-used sessions fall out of the
/// cache (they live on in the repository; eviction here loses nothing).
pub struct SessionCache {
    inner: Mutex<CacheInner>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    capacity: usize,
}

struct CacheInner {
    sessions: HashMap<String, Session>,
    /// Recency order, most recent last.
    order: Vec<String>,
}

impl SessionCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                sessions: HashMap::new(),
                order: Vec::new(),
            }),
            locks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// The mutex serializing turns for one session. Handed out as an Arc so
    /// the caller can hold it across await points.
    #[must_use]
    pub fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.sessions.contains_key(session_id) {
            touch(&mut inner.order, session_id);
            inner.sessions.get(session_id).cloned()
        } else {
            None
        }
    }

    pub fn put(&self, session: Session) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = session.session_id.clone();
        inner.sessions.insert(id.clone(), session);
        touch(&mut inner.order, &id);

        while inner.order.len() > self.capacity {
            let evicted = inner.order.remove(0);
            inner.sessions.remove(&evicted);
            tracing::debug!(session_id = evicted.as_str(), "session cache eviction");
        }
    }

    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.sessions.remove(session_id);
        inner.order.retain(|id| id != session_id);
        drop(inner);

        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(order: &mut Vec<String>, id: &str) {
    order.retain(|existing| existing != id);
    order.push(id.to_string());
}

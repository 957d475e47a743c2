use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// This caller ran the work.
    Leader,
    /// This caller received another caller's result.
    Follower,
}

/// Groups concurrent misses for the same key behind one unit of work.
///
/// The first caller for a key runs the work; callers arriving while it is in
/// flight wait and receive a clone of its result. Once the work finishes the
/// key is released, so later misses start a fresh flight. If the leader is
/// cancelled one of the waiters takes over.
#[derive(Debug)]
pub struct MissCoalescer<T> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for MissCoalescer<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MissCoalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (T, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut led = false;
        let value = cell
            .get_or_init(|| {
                led = true;
                work()
            })
            .await
            .clone();

        {
            let mut inflight = self.inflight.lock();
            if inflight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                inflight.remove(key);
            }
        }

        let role = if led {
            FlightRole::Leader
        } else {
            FlightRole::Follower
        };
        (value, role)
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

//! Process-local in-flight registry.
//!
//! At most one request per [`CacheKey`] leads at a time. Everyone else
//! follows: they hold a `watch` receiver that either yields the leader's
//! stored record or closes when the leader gives up.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cache::{CacheKey, CachedResponse};

type Slot = watch::Sender<Option<Arc<CachedResponse>>>;

pub(crate) enum Flight {
    Lead(FlightGuard),
    Follow(watch::Receiver<Option<Arc<CachedResponse>>>),
}

pub(crate) enum Resolution {
    Stored(Arc<CachedResponse>),
    /// The leader failed, aborted, or degraded; try again from the top.
    Released,
    TimedOut,
}

#[derive(Clone, Default)]
pub(crate) struct FlightRegistry {
    flights: Arc<DashMap<CacheKey, Slot>>,
}

impl FlightRegistry {
    /// Becomes the leader for `key`, or subscribes to the current leader.
    /// Atomic with respect to concurrent callers for the same key.
    pub(crate) fn join_or_lead(&self, key: &CacheKey) -> Flight {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(slot) => Flight::Follow(slot.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (tx, _) = watch::channel(None);
                vacant.insert(tx);
                Flight::Lead(FlightGuard {
                    key: key.clone(),
                    flights: Arc::clone(&self.flights),
                    settled: false,
                })
            }
        }
    }

    pub(crate) async fn wait(
        mut follower: watch::Receiver<Option<Arc<CachedResponse>>>,
        deadline: Instant,
    ) -> Resolution {
        match tokio::time::timeout_at(deadline, settled(&mut follower)).await {
            Ok(Some(record)) => Resolution::Stored(record),
            Ok(None) => Resolution::Released,
            Err(_) => Resolution::TimedOut,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

async fn settled(
    follower: &mut watch::Receiver<Option<Arc<CachedResponse>>>,
) -> Option<Arc<CachedResponse>> {
    let record = follower.wait_for(Option::is_some).await.ok()?.clone();
    record
}

/// Leadership of one key. Dropping it unresolved releases every follower.
pub(crate) struct FlightGuard {
    key: CacheKey,
    flights: Arc<DashMap<CacheKey, Slot>>,
    settled: bool,
}

impl FlightGuard {
    /// Hands `record` to every follower and retires the flight.
    pub(crate) fn resolve(&mut self, record: Arc<CachedResponse>) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Some((_, tx)) = self.flights.remove(&self.key) {
            tx.send_replace(Some(record));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            // Dropping the sender closes every follower's receiver.
            self.flights.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::http::{Headers, StatusCode};

    fn key() -> CacheKey {
        CacheKey::from_digest("k".to_owned())
    }

    fn record() -> Arc<CachedResponse> {
        Arc::new(CachedResponse::new(
            StatusCode::Ok,
            Headers::new(),
            Bytes::from_static(b"done"),
        ))
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn second_caller_follows() {
        let registry = FlightRegistry::default();
        let lead = registry.join_or_lead(&key());
        assert!(matches!(lead, Flight::Lead(_)));
        assert!(matches!(registry.join_or_lead(&key()), Flight::Follow(_)));
        assert_eq!(registry.len(), 1);
        drop(lead);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn follower_receives_resolved_record() {
        let registry = FlightRegistry::default();
        let Flight::Lead(mut guard) = registry.join_or_lead(&key()) else {
            panic!("expected to lead");
        };
        let Flight::Follow(rx) = registry.join_or_lead(&key()) else {
            panic!("expected to follow");
        };

        let waiter = tokio::spawn(FlightRegistry::wait(rx, soon()));
        guard.resolve(record());
        drop(guard);

        match waiter.await.unwrap() {
            Resolution::Stored(r) => assert_eq!(r.body().as_ref(), b"done"),
            _ => panic!("expected the stored record"),
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers() {
        let registry = FlightRegistry::default();
        let lead = registry.join_or_lead(&key());
        let Flight::Follow(rx) = registry.join_or_lead(&key()) else {
            panic!("expected to follow");
        };
        drop(lead);
        assert!(matches!(
            FlightRegistry::wait(rx, soon()).await,
            Resolution::Released
        ));
        // the key is free again
        assert!(matches!(registry.join_or_lead(&key()), Flight::Lead(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn follower_gives_up_at_deadline() {
        let registry = FlightRegistry::default();
        let _lead = registry.join_or_lead(&key());
        let Flight::Follow(rx) = registry.join_or_lead(&key()) else {
            panic!("expected to follow");
        };
        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(matches!(
            FlightRegistry::wait(rx, deadline).await,
            Resolution::TimedOut
        ));
    }

    #[tokio::test]
    async fn resolved_guard_does_not_evict_a_newer_flight() {
        let registry = FlightRegistry::default();
        let Flight::Lead(mut first) = registry.join_or_lead(&key()) else {
            panic!("expected to lead");
        };
        first.resolve(record());
        let second = registry.join_or_lead(&key());
        assert!(matches!(second, Flight::Lead(_)));
        drop(first);
        assert_eq!(registry.len(), 1);
    }
}

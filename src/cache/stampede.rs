//! Single-flight population coordination
//!
//! One `StampedeState` exists per distinct (key, flags) pair while a
//! population is in flight. The creator runs the population; every other
//! concurrent requester joins and awaits the published result. Publication
//! happens exactly once and the state is removed from the registry in the
//! same step, for every terminal outcome.
//!
//! Cancellation is cooperative and decoupled from any one caller's token:
//! each joiner holds one unit of interest, and the shared token fires only
//! when the last interested caller leaves. At publication the remaining
//! interest units become reservations on the published item, so a joiner
//! that consumes the result (or cancels late) always accounts for exactly
//! one release.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::item::{CacheItem, ErasedCacheItem};
use crate::cache::types::{CacheError, CacheResult, StampedeKey};

/// Result delivered to every joined caller.
pub enum StampedeOutcome<T: Send + Sync + 'static> {
    /// A populated item; each caller consumes one carried reservation.
    Value(Arc<CacheItem<T>>),
    /// Every tier and the underlying data read were disabled: callers get a
    /// default value and nothing is written anywhere.
    Empty,
    /// The factory (or a fatal serializer step) failed; delivered to all.
    Fault(Arc<CacheError>),
    /// Every interested caller left before completion.
    Cancelled,
}

impl<T: Send + Sync + 'static> Clone for StampedeOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            StampedeOutcome::Value(item) => StampedeOutcome::Value(Arc::clone(item)),
            StampedeOutcome::Empty => StampedeOutcome::Empty,
            StampedeOutcome::Fault(err) => StampedeOutcome::Fault(Arc::clone(err)),
            StampedeOutcome::Cancelled => StampedeOutcome::Cancelled,
        }
    }
}

struct CoordinationPhase {
    callers: u32,
    published: bool,
}

/// Coordinator for one in-flight population.
pub struct StampedeState<T: Clone + Default + Send + Sync + 'static> {
    key: StampedeKey,
    phase: Mutex<CoordinationPhase>,
    tx: watch::Sender<Option<StampedeOutcome<T>>>,
    cancel: CancellationToken,
}

impl<T: Clone + Default + Send + Sync + 'static> StampedeState<T> {
    fn new(key: StampedeKey) -> Self {
        let (tx, _rx) = watch::channel(None);
        StampedeState {
            key,
            phase: Mutex::new(CoordinationPhase {
                callers: 1,
                published: false,
            }),
            tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Token handed to the population body; fires when no caller remains.
    pub fn population_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// True once every interested caller has left.
    pub fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn lock_phase(&self) -> MutexGuard<'_, CoordinationPhase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserves a caller slot. Fails once the result is published (the
    /// registry entry is about to disappear; the caller retries).
    pub fn try_join(&self) -> bool {
        let mut phase = self.lock_phase();
        if phase.published || phase.callers == 0 || phase.callers == u32::MAX {
            return false;
        }
        phase.callers += 1;
        true
    }

    /// Releases a caller slot. Draining the last slot before publication
    /// triggers the shared cancellation; after publication the slot's
    /// carried reservation is released instead.
    pub fn cancel_caller(&self) {
        let fire = {
            let mut phase = self.lock_phase();
            if phase.published {
                if let Some(StampedeOutcome::Value(item)) = &*self.tx.borrow() {
                    item.release();
                }
                return;
            }
            phase.callers = phase.callers.saturating_sub(1);
            phase.callers == 0
        };
        if fire {
            self.cancel.cancel();
        }
    }

    /// Publishes the terminal outcome to every joined caller, transfers the
    /// remaining caller slots (plus `store_reservations`) onto the item's
    /// refcount, and removes the state from the registry. Returns the number
    /// of caller slots transferred.
    pub(crate) fn publish(
        &self,
        registry: &StampedeRegistry,
        outcome: StampedeOutcome<T>,
        store_reservations: u32,
    ) -> u32 {
        let callers = {
            let mut phase = self.lock_phase();
            debug_assert!(!phase.published, "double publication");
            phase.published = true;
            phase.callers
        };
        if let StampedeOutcome::Value(item) = &outcome {
            item.add_reservations(callers + store_reservations);
        }
        // Clear the registry before waking anyone: a woken caller must never
        // observe the spent state still registered. send_replace stores the
        // value even when no receiver is currently subscribed, so a caller
        // subscribing after publication still sees it.
        registry.remove(&self.key);
        self.tx.send_replace(Some(outcome));
        callers
    }

    /// Awaits the published result on behalf of one joined caller. A local
    /// token cancels only this caller; other joiners are unaffected. Dropping
    /// the returned future releases this caller's interest unit.
    pub async fn join_result(&self, local_token: Option<&CancellationToken>) -> CacheResult<T> {
        let mut rx = self.tx.subscribe();
        let mut interest = InterestGuard {
            state: self,
            armed: true,
        };
        let outcome = match local_token {
            Some(token) => {
                tokio::select! {
                    changed = rx.wait_for(|outcome| outcome.is_some()) => extract(changed)?,
                    _ = token.cancelled() => {
                        return Err(CacheError::OperationCancelled);
                    }
                }
            }
            None => extract(rx.wait_for(|outcome| outcome.is_some()).await)?,
        };
        interest.armed = false;
        match outcome {
            StampedeOutcome::Value(item) => item.get_reserved_value(),
            StampedeOutcome::Empty => Ok(T::default()),
            StampedeOutcome::Fault(err) => Err((*err).clone()),
            StampedeOutcome::Cancelled => Err(CacheError::OperationCancelled),
        }
    }
}

/// Releases one interest unit when a waiting caller leaves without consuming
/// the outcome, whether through its token or by having its future dropped.
struct InterestGuard<'a, T: Clone + Default + Send + Sync + 'static> {
    state: &'a StampedeState<T>,
    armed: bool,
}

impl<T: Clone + Default + Send + Sync + 'static> Drop for InterestGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.state.cancel_caller();
        }
    }
}

fn extract<T: Send + Sync + 'static>(
    changed: Result<
        watch::Ref<'_, Option<StampedeOutcome<T>>>,
        watch::error::RecvError,
    >,
) -> CacheResult<StampedeOutcome<T>> {
    let guard = changed.map_err(|_| CacheError::internal("population ended without publishing"))?;
    (*guard)
        .clone()
        .ok_or_else(|| CacheError::internal("empty publication"))
}

/// Result of probing the registry for a key.
pub enum JoinOutcome<T: Clone + Default + Send + Sync + 'static> {
    /// This caller created the state and owns the population.
    Created(Arc<StampedeState<T>>),
    /// This caller joined an in-flight population.
    Joined(Arc<StampedeState<T>>),
    /// A terminal state is being torn down; retry after yielding.
    Busy,
    /// The key is in flight with a different value type.
    TypeMismatch,
}

/// Sharded (key, flags) → in-flight state registry. The map lock only guards
/// add/remove, never the population logic.
pub struct StampedeRegistry {
    states: DashMap<StampedeKey, Arc<dyn Any + Send + Sync>>,
}

impl StampedeRegistry {
    pub fn new() -> Self {
        StampedeRegistry {
            states: DashMap::new(),
        }
    }

    pub fn join_or_create<T>(&self, key: &StampedeKey) -> JoinOutcome<T>
    where
        T: Clone + Default + Send + Sync + 'static,
    {
        match self.states.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let erased = Arc::clone(occupied.get());
                drop(occupied);
                match erased.downcast::<StampedeState<T>>() {
                    Ok(state) => {
                        if state.try_join() {
                            JoinOutcome::Joined(state)
                        } else {
                            JoinOutcome::Busy
                        }
                    }
                    Err(_) => JoinOutcome::TypeMismatch,
                }
            }
            Entry::Vacant(vacant) => {
                let state = Arc::new(StampedeState::new(key.clone()));
                let erased: Arc<dyn Any + Send + Sync> = Arc::clone(&state) as _;
                vacant.insert(erased);
                JoinOutcome::Created(state)
            }
        }
    }

    pub(crate) fn remove(&self, key: &StampedeKey) {
        self.states.remove(key);
    }

    /// Number of populations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.states.len()
    }
}

impl Default for StampedeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tags::TagSet;
    use crate::cache::types::EntryFlags;

    fn registry_and_state(key: &str) -> (StampedeRegistry, Arc<StampedeState<u64>>) {
        let registry = StampedeRegistry::new();
        let skey = StampedeKey::new(key, EntryFlags::empty());
        match registry.join_or_create::<u64>(&skey) {
            JoinOutcome::Created(state) => (registry, state),
            _ => panic!("expected creation"),
        }
    }

    #[tokio::test]
    async fn all_joiners_observe_the_published_value() {
        let (registry, state) = registry_and_state("k");
        assert!(state.try_join());
        assert!(state.try_join());

        let item = Arc::new(CacheItem::immutable(99u64, 1, TagSet::Empty, 8));
        state.publish(&registry, StampedeOutcome::Value(Arc::clone(&item)), 0);
        item.release(); // creation reference

        assert_eq!(state.join_result(None).await.unwrap(), 99);
        assert_eq!(state.join_result(None).await.unwrap(), 99);
        assert_eq!(state.join_result(None).await.unwrap(), 99);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn faults_are_delivered_to_every_joiner() {
        let (registry, state) = registry_and_state("k");
        assert!(state.try_join());
        state.publish(
            &registry,
            StampedeOutcome::Fault(Arc::new(CacheError::storage("backend down"))),
            0,
        );
        for _ in 0..2 {
            let err = state.join_result(None).await.unwrap_err();
            assert!(matches!(err, CacheError::StorageError(_)));
        }
    }

    #[tokio::test]
    async fn last_caller_leaving_fires_the_shared_token() {
        let (_registry, state) = registry_and_state("k");
        assert!(state.try_join());
        state.cancel_caller();
        assert!(!state.is_abandoned());
        state.cancel_caller();
        assert!(state.is_abandoned());
        assert!(state.population_token().is_cancelled());
    }

    #[tokio::test]
    async fn local_cancellation_affects_only_that_joiner() {
        let (registry, state) = registry_and_state("k");
        assert!(state.try_join());

        let token = CancellationToken::new();
        token.cancel();
        let err = state.join_result(Some(&token)).await.unwrap_err();
        assert_eq!(err, CacheError::OperationCancelled);
        assert!(!state.is_abandoned());

        let item = Arc::new(CacheItem::immutable(7u64, 1, TagSet::Empty, 8));
        state.publish(&registry, StampedeOutcome::Value(Arc::clone(&item)), 0);
        item.release();
        assert_eq!(state.join_result(None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn publication_lands_with_no_subscriber_waiting() {
        // The uncontended case: the only caller publishes first and
        // subscribes afterwards. The outcome must still be observable.
        let (registry, state) = registry_and_state("k");
        let item = Arc::new(CacheItem::immutable(42u64, 1, TagSet::Empty, 8));
        state.publish(&registry, StampedeOutcome::Value(Arc::clone(&item)), 0);
        item.release();
        assert_eq!(state.join_result(None).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn publication_closes_the_state_to_new_joiners() {
        let (registry, state) = registry_and_state("k");
        state.publish(&registry, StampedeOutcome::Empty, 0);
        assert!(!state.try_join());
        let skey = StampedeKey::new("k", EntryFlags::empty());
        assert!(matches!(
            registry.join_or_create::<u64>(&skey),
            JoinOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn type_mismatch_is_detected() {
        let (registry, _state) = registry_and_state("k");
        let skey = StampedeKey::new("k", EntryFlags::empty());
        assert!(matches!(
            registry.join_or_create::<String>(&skey),
            JoinOutcome::TypeMismatch
        ));
    }
}

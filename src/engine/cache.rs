//! Concurrent invocation cache
//!
//! UID-indexed table of live invocations plus the watch map that serializes
//! child dispatch behind parent registration. Both maps share one mutex and
//! one condition variable: invocation identity has a single serialization
//! point per process, and every wake-up goes through the same condvar.
//!
//! The ordering contract: a thread that will register uid `P` soon calls
//! [`watch_for`](InvocationCache::watch_for) before doing any asynchronous
//! work; a thread that depends on `P` calls
//! [`parent_ready`](InvocationCache::parent_ready), which blocks while the
//! watch entry is an absent-marker and returns once
//! [`add`](InvocationCache::add) resolves it. [`end_watch`](InvocationCache::end_watch)
//! must be reached for every watch registration, error paths included.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

use super::error::{WaitError, WaitResult};
use super::invocation::{Invocation, InvocationListener, Status};
use super::message::{ErrorInfo, Uid};

struct CacheInner {
    live: HashMap<Uid, Arc<Invocation>>,
    // None is the absent-marker: registration is in flight, block dependents.
    watches: HashMap<Uid, Option<Arc<Invocation>>>,
}

/// UID-indexed concurrent table of live invocations
pub struct InvocationCache {
    inner: Mutex<CacheInner>,
    cond: Condvar,
    watch_warning: usize,
}

impl InvocationCache {
    /// Create an empty cache. `watch_warning` is the safety-valve threshold:
    /// a watch map that grows past it indicates registrations are not being
    /// completed.
    pub fn new(watch_warning: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                live: HashMap::new(),
                watches: HashMap::new(),
            }),
            cond: Condvar::new(),
            watch_warning,
        })
    }

    /// Look up the live invocation for `uid`, blocking until it appears or
    /// `timeout` elapses. A zero timeout polls exactly once and never
    /// blocks.
    pub fn get(&self, uid: &Uid, timeout: Duration) -> WaitResult<Arc<Invocation>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(invocation) = inner.live.get(uid) {
                return Ok(invocation.clone());
            }
            if timeout.is_zero() || Instant::now() >= deadline {
                return Err(WaitError::Timeout { uid: *uid, timeout });
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return match inner.live.get(uid) {
                    Some(invocation) => Ok(invocation.clone()),
                    None => Err(WaitError::Timeout { uid: *uid, timeout }),
                };
            }
        }
    }

    /// Register a live invocation, resolving any pending watch entry for its
    /// uid and waking all waiters. Installs the eviction listener that
    /// removes the entry when the invocation goes terminal.
    pub fn add(self: &Arc<Self>, invocation: Arc<Invocation>) {
        let uid = invocation.uid();
        {
            let mut inner = self.inner.lock();
            inner.live.insert(uid, invocation.clone());
            if let Some(entry) = inner.watches.get_mut(&uid) {
                *entry = Some(invocation.clone());
            }
        }
        invocation.add_internal_listener(Arc::new(EvictionListener {
            cache: Arc::downgrade(self),
            uid,
        }));
        // The published entry is reachable before the listener is in place;
        // a transition driven through it in that window makes the listener
        // registration a no-op. Re-check so a terminal invocation never
        // stays cached.
        if invocation.status().is_terminal() {
            self.remove(&uid);
        }
        self.cond.notify_all();
    }

    /// Record that registration of `uid` is in flight. No-op when the uid is
    /// already live. Must be called before any asynchronous processing that
    /// will eventually [`add`](Self::add) the invocation.
    pub fn watch_for(&self, uid: &Uid) {
        let mut inner = self.inner.lock();
        if inner.live.contains_key(uid) {
            return;
        }
        inner.watches.entry(*uid).or_insert(None);
        if inner.watches.len() > self.watch_warning {
            warn!(
                watches = inner.watches.len(),
                "watch set exceeds threshold; registrations are not being completed"
            );
        }
    }

    /// Block until a pending registration for `uid` completes
    ///
    /// Returns immediately when no watch entry exists (nothing to wait for)
    /// or when the entry is already resolved. While the entry is an
    /// absent-marker, the caller is serialized behind the registering
    /// thread's [`add`](Self::add).
    pub fn parent_ready(&self, uid: &Uid, timeout: Duration) -> WaitResult<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.watches.get(uid) {
                None | Some(Some(_)) => return Ok(()),
                Some(None) => {}
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return match inner.watches.get(uid) {
                    None | Some(Some(_)) => Ok(()),
                    Some(None) => Err(WaitError::Timeout { uid: *uid, timeout }),
                };
            }
        }
    }

    /// Remove the watch entry for `uid` and wake waiters. Idempotent; must
    /// be reached exactly once per Start message, error paths included.
    pub fn end_watch(&self, uid: &Uid) {
        let mut inner = self.inner.lock();
        inner.watches.remove(uid);
        self.cond.notify_all();
    }

    /// Whether a live invocation exists for `uid`
    pub fn contains(&self, uid: &Uid) -> bool {
        self.inner.lock().live.contains_key(uid)
    }

    /// Number of live invocations
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Whether the cache holds no live invocations
    pub fn is_empty(&self) -> bool {
        self.inner.lock().live.is_empty()
    }

    fn remove(&self, uid: &Uid) {
        let mut inner = self.inner.lock();
        inner.live.remove(uid);
        // A stale watch entry for an evicted invocation can no longer be
        // resolved; drop it too.
        inner.watches.remove(uid);
        self.cond.notify_all();
    }
}

struct EvictionListener {
    cache: Weak<InvocationCache>,
    uid: Uid,
}

impl InvocationListener for EvictionListener {
    fn on_status(&self, _invocation: &Invocation, status: Status) {
        if !status.is_terminal() {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.remove(&self.uid);
        }
    }

    fn on_error(&self, _invocation: &Invocation, _error: &ErrorInfo) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::engine::bus::{BusError, BusHandler, MessageBus};
    use crate::engine::invocation::InvocationKind;
    use crate::engine::message::{BusMessage, ClientId, MessageKind};
    use crate::engine::model::SimpleAction;

    struct NullBus(ClientId);

    impl MessageBus for NullBus {
        fn send(&self, _message: BusMessage) -> Result<(), BusError> {
            Ok(())
        }

        fn gather(
            &self,
            _message: BusMessage,
            _timeout: Duration,
        ) -> Result<Vec<BusMessage>, BusError> {
            Ok(Vec::new())
        }

        fn subscribe(&self, _kinds: &[MessageKind], _handler: Arc<dyn BusHandler>) {}

        fn next_uid(&self) -> Uid {
            Uid::new(self.0, 0)
        }

        fn client_id(&self) -> ClientId {
            self.0
        }
    }

    fn invocation(uid: Uid) -> Arc<Invocation> {
        let bus = Arc::new(NullBus(uid.originator));
        Arc::new(Invocation::new(
            InvocationKind::Action(Arc::new(SimpleAction::new("Open", 1, 0))),
            uid,
            None,
            None,
            true,
            false,
            bus,
            &EngineConfig::default(),
        ))
    }

    #[test]
    fn test_get_zero_timeout_never_blocks() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 1);
        assert!(matches!(
            cache.get(&uid, Duration::ZERO),
            Err(WaitError::Timeout { .. })
        ));

        cache.add(invocation(uid));
        assert_eq!(cache.get(&uid, Duration::ZERO).unwrap().uid(), uid);
    }

    #[test]
    fn test_get_wakes_on_add() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 2);

        let waiter = cache.clone();
        let handle = std::thread::spawn(move || waiter.get(&uid, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        cache.add(invocation(uid));

        assert_eq!(handle.join().unwrap().unwrap().uid(), uid);
    }

    #[test]
    fn test_parent_ready_blocks_until_add_resolves_watch() {
        let cache = InvocationCache::new(64);
        let parent = Uid::new(ClientId::new(), 3);
        cache.watch_for(&parent);

        let waiter = cache.clone();
        let handle = std::thread::spawn(move || waiter.parent_ready(&parent, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        cache.add(invocation(parent));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_parent_ready_immediate_without_watch() {
        let cache = InvocationCache::new(64);
        let unwatched = Uid::new(ClientId::new(), 4);
        cache.parent_ready(&unwatched, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_parent_ready_unblocked_by_end_watch() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 5);
        cache.watch_for(&uid);

        let waiter = cache.clone();
        let handle = std::thread::spawn(move || waiter.parent_ready(&uid, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        cache.end_watch(&uid);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_watch_for_live_uid_is_noop() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 6);
        cache.add(invocation(uid));
        cache.watch_for(&uid);
        // No watch entry was created, so parent_ready returns immediately.
        cache.parent_ready(&uid, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_add_evicts_already_terminal_invocation() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 8);
        let inv = invocation(uid);
        inv.set_status(Status::Ended).unwrap();

        cache.add(inv);
        assert!(!cache.contains(&uid));
    }

    #[test]
    fn test_terminal_transition_racing_add_still_evicts() {
        for round in 0u64..200 {
            let cache = InvocationCache::new(64);
            let uid = Uid::new(ClientId::new(), round);
            let inv = invocation(uid);

            // Obtain the invocation through the cache as soon as it is
            // published and drive it terminal immediately.
            let racer = cache.clone();
            let handle = std::thread::spawn(move || {
                loop {
                    match racer.get(&uid, Duration::ZERO) {
                        Ok(found) => {
                            let _ = found.fail(ErrorInfo::cancelled());
                            break;
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                }
            });
            cache.add(inv.clone());
            handle.join().unwrap();

            assert!(inv.status().is_terminal());
            assert!(
                !cache.contains(&uid),
                "terminal invocation still cached on round {round}"
            );
        }
    }

    #[test]
    fn test_terminal_status_evicts() {
        let cache = InvocationCache::new(64);
        let uid = Uid::new(ClientId::new(), 7);
        let inv = invocation(uid);
        cache.add(inv.clone());
        assert!(cache.contains(&uid));

        inv.set_status(Status::Ended).unwrap();
        assert!(!cache.contains(&uid));
        assert!(cache.is_empty());
    }
}

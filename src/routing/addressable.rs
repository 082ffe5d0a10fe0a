//! Addressable directory.
//!
//! Maps a logical actor id to the runtime id of whoever currently owns it.
//! Every addressable scene hosts one shard; the shard for an id is picked
//! by [`Router::directory_scene`](super::Router::directory_scene).
//!
//! A migration holds the per-id lock from `lock` until `unlock`, so
//! lookups issued meanwhile wait and then see the new owner.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::id::RuntimeId;
use crate::message::protocol::{
    AddressableAddRequest, AddressableGetRequest, AddressableGetResponse, AddressableLockRequest,
    AddressableRemoveRequest, AddressableResponse, AddressableUnlockRequest,
};
use crate::message::{error_code, DispatchError, DispatcherBuilder, HandlerContext, Response};
use crate::task::{KeyedGuard, KeyedLock};

/// Observable state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Lookups answer immediately.
    Registered(RuntimeId),
    /// Lookups wait until the migration ends.
    Migrating {
        /// Owner before the migration.
        old: RuntimeId,
        /// When the lock is forcibly released.
        deadline: Instant,
    },
}

struct Migration {
    _guard: KeyedGuard<i64>,
    old: RuntimeId,
    deadline: Instant,
}

/// One directory shard.
pub struct AddressableDirectory {
    entries: DashMap<i64, RuntimeId>,
    locks: KeyedLock<i64>,
    migrations: DashMap<i64, Migration>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for AddressableDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressableDirectory")
            .field("entries", &self.entries.len())
            .field("migrations", &self.migrations.len())
            .finish()
    }
}

impl AddressableDirectory {
    /// Empty shard. Migrations older than `lock_timeout` are aborted.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyedLock::new(),
            migrations: DashMap::new(),
            lock_timeout,
        }
    }

    fn begin_migration(&self, id: i64, guard: KeyedGuard<i64>, old: RuntimeId) {
        self.migrations.insert(
            id,
            Migration {
                _guard: guard,
                old,
                deadline: Instant::now() + self.lock_timeout,
            },
        );
    }

    /// Register `id` at `route`, optionally leaving it locked.
    pub async fn add(&self, id: i64, route: RuntimeId, is_lock: bool) {
        let guard = self.locks.lock(id).await;
        self.entries.insert(id, route);
        if is_lock {
            self.begin_migration(id, guard, route);
        }
        debug!("Addressable {} registered at {}", id, route);
    }

    /// Current owner of `id`. Waits while a migration is in progress.
    pub async fn get(&self, id: i64) -> Option<RuntimeId> {
        let _guard = self.locks.lock(id).await;
        self.entries.get(&id).map(|route| *route)
    }

    /// Drop `id`. Returns whether it was registered.
    pub async fn remove(&self, id: i64) -> bool {
        let _guard = self.locks.lock(id).await;
        self.entries.remove(&id).is_some()
    }

    /// Start a migration of `id`.
    pub async fn lock(&self, id: i64) {
        let guard = self.locks.lock(id).await;
        let old = self.entries.get(&id).map(|route| *route).unwrap_or(RuntimeId::NONE);
        self.begin_migration(id, guard, old);
    }

    /// End a migration: move `id` to `route`, or keep the old owner with
    /// `None`. Returns false if `id` was not locked.
    pub fn unlock(&self, id: i64, route: Option<RuntimeId>) -> bool {
        let Some((_, migration)) = self.migrations.remove(&id) else {
            return false;
        };
        match route.filter(|route| !route.is_none()) {
            Some(route) => {
                self.entries.insert(id, route);
                debug!("Addressable {} moved {} -> {}", id, migration.old, route);
            }
            None => debug!("Addressable {} migration aborted, stays at {}", id, migration.old),
        }
        true
    }

    /// Abort migrations past their deadline.
    pub fn sweep_stale(&self, now: Instant) -> usize {
        let stale: Vec<i64> = self
            .migrations
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for id in &stale {
            if self.migrations.remove(id).is_some() {
                warn!("Addressable {} lock expired, releasing", id);
            }
        }
        stale.len()
    }

    /// Entry state without waiting.
    pub fn state(&self, id: i64) -> Option<EntryState> {
        if let Some(migration) = self.migrations.get(&id) {
            return Some(EntryState::Migrating {
                old: migration.old,
                deadline: migration.deadline,
            });
        }
        self.entries.get(&id).map(|route| EntryState::Registered(*route))
    }

    /// Registered ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

macro_rules! with_directory {
    ($ctx:expr, $response:ty) => {
        match $ctx.scene.directory().cloned() {
            Some(directory) => directory,
            None => {
                warn!("Scene {} hosts no addressable directory", $ctx.scene.scene_id());
                return <$response>::from_error(error_code::NOT_FOUND_ROUTE);
            }
        }
    };
}

/// Directory request handlers.
pub fn register(builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
    builder.request(|ctx: HandlerContext, request: AddressableAddRequest| async move {
        let directory = with_directory!(ctx, AddressableResponse);
        directory
            .add(request.addressable_id, request.route_id, request.is_lock)
            .await;
        AddressableResponse::default()
    })?;

    builder.request(|ctx: HandlerContext, request: AddressableGetRequest| async move {
        let directory = with_directory!(ctx, AddressableGetResponse);
        match directory.get(request.addressable_id).await {
            Some(route_id) => AddressableGetResponse {
                error_code: error_code::SUCCESS,
                route_id,
            },
            None => AddressableGetResponse::from_error(error_code::NOT_FOUND_ROUTE),
        }
    })?;

    builder.request(|ctx: HandlerContext, request: AddressableRemoveRequest| async move {
        let directory = with_directory!(ctx, AddressableResponse);
        directory.remove(request.addressable_id).await;
        AddressableResponse::default()
    })?;

    builder.request(|ctx: HandlerContext, request: AddressableLockRequest| async move {
        let directory = with_directory!(ctx, AddressableResponse);
        directory.lock(request.addressable_id).await;
        AddressableResponse::default()
    })?;

    builder.request(|ctx: HandlerContext, request: AddressableUnlockRequest| async move {
        let directory = with_directory!(ctx, AddressableResponse);
        if !directory.unlock(request.addressable_id, Some(request.route_id)) {
            warn!("Unlock of addressable {} that was not locked", request.addressable_id);
        }
        AddressableResponse::default()
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn route(seq: u64) -> RuntimeId {
        RuntimeId::from_parts(1, 100, seq).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let directory = AddressableDirectory::new(Duration::from_secs(5));
        assert_eq!(directory.get(1).await, None);

        directory.add(1, route(1), false).await;
        assert_eq!(directory.get(1).await, Some(route(1)));
        assert_eq!(directory.state(1), Some(EntryState::Registered(route(1))));

        assert!(directory.remove(1).await);
        assert!(!directory.remove(1).await);
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_migration_commit() {
        let directory = Arc::new(AddressableDirectory::new(Duration::from_secs(5)));
        directory.add(7, route(1), false).await;
        directory.lock(7).await;
        assert!(matches!(directory.state(7), Some(EntryState::Migrating { old, .. }) if old == route(1)));

        let lookup = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.get(7).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lookup.is_finished());

        assert!(directory.unlock(7, Some(route(2))));
        assert_eq!(lookup.await.unwrap(), Some(route(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_see_one_owner_per_side_of_migration() {
        let directory = Arc::new(AddressableDirectory::new(Duration::from_secs(5)));
        directory.add(7, route(1), false).await;

        let spawn_lookups = |count: usize| -> Vec<_> {
            (0..count)
                .map(|_| {
                    let directory = directory.clone();
                    tokio::spawn(async move { directory.get(7).await })
                })
                .collect()
        };

        let before = spawn_lookups(8);
        for lookup in before {
            assert_eq!(lookup.await.unwrap(), Some(route(1)));
        }

        // Issued while the lock is being taken: either owner, never a miss.
        let racing = spawn_lookups(8);
        directory.lock(7).await;
        let during = spawn_lookups(16);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(during.iter().all(|lookup| !lookup.is_finished()));

        assert!(directory.unlock(7, Some(route(2))));
        for lookup in during {
            assert_eq!(lookup.await.unwrap(), Some(route(2)));
        }
        for lookup in racing {
            let owner = lookup.await.unwrap();
            assert!(owner == Some(route(1)) || owner == Some(route(2)), "unexpected owner {owner:?}");
        }
        assert_eq!(directory.state(7), Some(EntryState::Registered(route(2))));
    }

    #[tokio::test]
    async fn test_abort_keeps_old_route() {
        let directory = AddressableDirectory::new(Duration::from_secs(5));
        directory.add(3, route(1), false).await;
        directory.lock(3).await;
        assert!(directory.unlock(3, None));
        assert_eq!(directory.get(3).await, Some(route(1)));
        assert!(!directory.unlock(3, None));
    }

    #[tokio::test]
    async fn test_add_locked_then_commit() {
        let directory = AddressableDirectory::new(Duration::from_secs(5));
        directory.add(9, route(4), true).await;
        assert!(matches!(directory.state(9), Some(EntryState::Migrating { .. })));
        assert!(directory.unlock(9, Some(RuntimeId::NONE)));
        assert_eq!(directory.get(9).await, Some(route(4)));
    }

    #[tokio::test]
    async fn test_sweep_stale_releases_lock() {
        let directory = AddressableDirectory::new(Duration::from_millis(10));
        directory.add(5, route(1), false).await;
        directory.lock(5).await;

        assert_eq!(directory.sweep_stale(Instant::now()), 0);
        assert_eq!(directory.sweep_stale(Instant::now() + Duration::from_millis(50)), 1);
        assert_eq!(directory.get(5).await, Some(route(1)));
    }
}

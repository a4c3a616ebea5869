//! TTL-gated snapshot of enrolled identities.

use crate::store::{IdentityStore, StoreError};
use rollcall_core::IdentityRecord;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whether a snapshot loaded at `last_load` must be reloaded at `now`.
pub fn needs_refresh(last_load: Option<Instant>, now: Instant, ttl: Duration, force: bool) -> bool {
    match last_load {
        _ if force => true,
        None => true,
        Some(at) => now.saturating_duration_since(at) >= ttl,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The current snapshot is still within its TTL.
    Fresh,
    /// The snapshot was replaced with this many identities.
    Reloaded(usize),
}

pub struct IdentityCache {
    snapshot: Arc<[IdentityRecord]>,
    loaded_at: Option<Instant>,
    ttl: Duration,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: Arc::from(Vec::<IdentityRecord>::new()),
            loaded_at: None,
            ttl,
        }
    }

    /// Reload from `store` when forced, empty, or past the TTL.
    ///
    /// On error the previous snapshot and its load time are kept.
    pub async fn refresh(&mut self, store: &dyn IdentityStore, force: bool) -> Result<RefreshOutcome, StoreError> {
        self.refresh_at(store, force, Instant::now()).await
    }

    async fn refresh_at(
        &mut self,
        store: &dyn IdentityStore,
        force: bool,
        now: Instant,
    ) -> Result<RefreshOutcome, StoreError> {
        if !needs_refresh(self.loaded_at, now, self.ttl, force || self.snapshot.is_empty()) {
            return Ok(RefreshOutcome::Fresh);
        }

        let records = store.load_identities().await?;
        let count = records.len();
        if count != self.snapshot.len() {
            tracing::info!(identities = count, "identity cache reloaded");
        } else {
            tracing::debug!(identities = count, "identity cache reloaded");
        }
        self.snapshot = Arc::from(records);
        self.loaded_at = Some(now);
        Ok(RefreshOutcome::Reloaded(count))
    }

    /// Drop the snapshot so the next refresh reloads unconditionally.
    pub fn invalidate(&mut self) {
        self.snapshot = Arc::from(Vec::<IdentityRecord>::new());
        self.loaded_at = None;
    }

    pub fn snapshot(&self) -> Arc<[IdentityRecord]> {
        Arc::clone(&self.snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rollcall_core::Embedding;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeStore {
        records: Vec<IdentityRecord>,
        fail: AtomicBool,
        loads: AtomicUsize,
    }

    impl FakeStore {
        fn with(keys: &[&str]) -> Self {
            Self {
                records: keys
                    .iter()
                    .map(|k| IdentityRecord {
                        identity_key: k.to_string(),
                        display_name: k.to_string(),
                        embedding: Embedding::new(vec![1.0, 0.0]),
                    })
                    .collect(),
                fail: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityStore for FakeStore {
        async fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("offline".into()));
            }
            Ok(self.records.clone())
        }
    }

    #[test]
    fn test_needs_refresh_policy() {
        let t0 = Instant::now();
        let ttl = Duration::from_secs(30);
        assert!(needs_refresh(None, t0, ttl, false));
        assert!(!needs_refresh(Some(t0), t0 + Duration::from_secs(29), ttl, false));
        assert!(needs_refresh(Some(t0), t0 + Duration::from_secs(30), ttl, false));
        assert!(needs_refresh(Some(t0), t0, ttl, true));
    }

    #[tokio::test]
    async fn test_refresh_respects_ttl() {
        let store = FakeStore::with(&["S1"]);
        let mut cache = IdentityCache::new(Duration::from_secs(30));
        let t0 = Instant::now();

        assert_eq!(cache.refresh_at(&store, false, t0).await.unwrap(), RefreshOutcome::Reloaded(1));
        assert_eq!(
            cache.refresh_at(&store, false, t0 + Duration::from_secs(5)).await.unwrap(),
            RefreshOutcome::Fresh
        );
        assert_eq!(
            cache.refresh_at(&store, false, t0 + Duration::from_secs(31)).await.unwrap(),
            RefreshOutcome::Reloaded(1)
        );
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_snapshot_always_reloads() {
        let store = FakeStore::with(&[]);
        let mut cache = IdentityCache::new(Duration::from_secs(30));
        cache.refresh(&store, false).await.unwrap();
        cache.refresh(&store, false).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let store = FakeStore::with(&["S1", "S2"]);
        let mut cache = IdentityCache::new(Duration::from_secs(30));
        cache.refresh(&store, false).await.unwrap();
        let before = cache.snapshot();

        store.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh(&store, true).await.is_err());
        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&before, &cache.snapshot()));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = FakeStore::with(&["S1"]);
        let mut cache = IdentityCache::new(Duration::from_secs(3600));
        cache.refresh(&store, false).await.unwrap();
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.refresh(&store, false).await.unwrap(), RefreshOutcome::Reloaded(1));
    }
}

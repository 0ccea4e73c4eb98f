//! Server mutes: a cache in front of a pluggable storage backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use proxvoice_protocol::types::MuteInfo;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMute {
    pub player_id: Uuid,
    pub muted_by: Option<Uuid>,
    pub muted_at_ms: u64,
    /// `None` is permanent.
    pub until_ms: Option<u64>,
    pub reason: Option<String>,
}

impl ServerMute {
    pub fn new(player_id: Uuid, until_ms: Option<u64>, reason: Option<String>) -> Self {
        Self {
            player_id,
            muted_by: None,
            muted_at_ms: now_ms(),
            until_ms,
            reason,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.until_ms.is_some_and(|until| until <= now_ms)
    }

    pub fn to_info(&self) -> MuteInfo {
        MuteInfo {
            until_ms: self.until_ms,
            reason: self.reason.clone(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
pub trait MuteStorage: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn put(&self, mute: ServerMute) -> Result<()>;

    async fn remove(&self, player_id: &Uuid) -> Result<Option<ServerMute>>;

    async fn get(&self, player_id: &Uuid) -> Result<Option<ServerMute>>;

    async fn all(&self) -> Result<Vec<ServerMute>>;
}

#[derive(Default)]
pub struct MemoryMuteStorage {
    mutes: DashMap<Uuid, ServerMute>,
}

#[async_trait]
impl MuteStorage for MemoryMuteStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, mute: ServerMute) -> Result<()> {
        self.mutes.insert(mute.player_id, mute);
        Ok(())
    }

    async fn remove(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
        Ok(self.mutes.remove(player_id).map(|(_, mute)| mute))
    }

    async fn get(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
        Ok(self.mutes.get(player_id).map(|m| m.clone()))
    }

    async fn all(&self) -> Result<Vec<ServerMute>> {
        Ok(self.mutes.iter().map(|m| m.value().clone()).collect())
    }
}

/// Mutes persisted as a JSON array, rewritten on every change.
pub struct JsonMuteStorage {
    path: PathBuf,
    mutes: Mutex<HashMap<Uuid, ServerMute>>,
}

impl JsonMuteStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mutes: Mutex::new(HashMap::new()),
        }
    }

    async fn save(&self, mutes: &HashMap<Uuid, ServerMute>) -> Result<()> {
        let mut list: Vec<&ServerMute> = mutes.values().collect();
        list.sort_by_key(|m| m.muted_at_ms);
        let json = serde_json::to_vec_pretty(&list)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Written beside the target and renamed over it, so a crash leaves
        // either the old file or the new one.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}

#[async_trait]
impl MuteStorage for JsonMuteStorage {
    async fn init(&self) -> Result<()> {
        let mut mutes = self.mutes.lock().await;
        mutes.clear();
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        let content = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let list: Vec<ServerMute> =
            serde_json::from_slice(&content).with_context(|| format!("invalid mute file {}", self.path.display()))?;
        mutes.extend(list.into_iter().map(|m| (m.player_id, m)));
        info!(count = mutes.len(), "loaded mutes");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mutes = self.mutes.lock().await;
        self.save(&mutes).await
    }

    async fn put(&self, mute: ServerMute) -> Result<()> {
        let mut mutes = self.mutes.lock().await;
        mutes.insert(mute.player_id, mute);
        self.save(&mutes).await
    }

    async fn remove(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
        let mut mutes = self.mutes.lock().await;
        let removed = mutes.remove(player_id);
        if removed.is_some() {
            self.save(&mutes).await?;
        }
        Ok(removed)
    }

    async fn get(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
        Ok(self.mutes.lock().await.get(player_id).cloned())
    }

    async fn all(&self) -> Result<Vec<ServerMute>> {
        Ok(self.mutes.lock().await.values().cloned().collect())
    }
}

/// Mute lookups on the audio path hit the cache only.
pub struct MuteManager {
    storage: RwLock<Arc<dyn MuteStorage>>,
    cache: DashMap<Uuid, ServerMute>,
}

impl MuteManager {
    pub fn new(storage: Arc<dyn MuteStorage>) -> Self {
        Self {
            storage: RwLock::new(storage),
            cache: DashMap::new(),
        }
    }

    pub fn storage(&self) -> Arc<dyn MuteStorage> {
        self.storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_storage(&self, storage: Arc<dyn MuteStorage>) {
        *self.storage.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = storage;
        self.cache.clear();
    }

    /// Initialise the storage and fill the cache from it.
    pub async fn init(&self) -> Result<()> {
        let storage = self.storage();
        storage.init().await.context("mute storage init failed")?;
        self.cache.clear();
        for mute in storage.all().await? {
            self.cache.insert(mute.player_id, mute);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.storage().close().await
    }

    pub async fn mute(&self, mute: ServerMute) -> Result<()> {
        self.storage().put(mute.clone()).await?;
        self.cache.insert(mute.player_id, mute);
        Ok(())
    }

    pub async fn unmute(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
        let removed = self.storage().remove(player_id).await?;
        let cached = self.cache.remove(player_id).map(|(_, m)| m);
        Ok(removed.or(cached))
    }

    /// The player's mute, unless it has expired.
    pub fn get(&self, player_id: &Uuid) -> Option<ServerMute> {
        let mute = self.cache.get(player_id)?;
        (!mute.is_expired(now_ms())).then(|| mute.clone())
    }

    pub fn is_muted(&self, player_id: &Uuid) -> bool {
        self.get(player_id).is_some()
    }

    /// Drop mutes that ended before `now_ms` and return whose were dropped.
    ///
    /// A mute stays cached until the storage has removed it, so a failed
    /// removal is retried on the next sweep.
    pub async fn expire(&self, now_ms: u64) -> Vec<Uuid> {
        let candidates: Vec<Uuid> = self
            .cache
            .iter()
            .filter(|m| m.is_expired(now_ms))
            .map(|m| m.player_id)
            .collect();
        let storage = self.storage();
        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            match storage.remove(&id).await {
                Ok(_) => {
                    self.cache.remove(&id);
                    expired.push(id);
                }
                Err(e) => warn!(player = %id, "failed to remove expired mute: {:#}", e),
            }
        }
        expired
    }

    pub fn all(&self) -> Vec<ServerMute> {
        self.cache.iter().map(|m| m.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mute_and_unmute() {
        let manager = MuteManager::new(Arc::new(MemoryMuteStorage::default()));
        let id = Uuid::new_v4();
        assert!(!manager.is_muted(&id));

        manager.mute(ServerMute::new(id, None, Some("spam".into()))).await.unwrap();
        assert!(manager.is_muted(&id));
        assert_eq!(manager.get(&id).unwrap().to_info().reason.as_deref(), Some("spam"));

        assert!(manager.unmute(&id).await.unwrap().is_some());
        assert!(!manager.is_muted(&id));
        assert!(manager.unmute(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_mutes_are_swept() {
        let storage = Arc::new(MemoryMuteStorage::default());
        let manager = MuteManager::new(storage.clone());
        let temporary = Uuid::new_v4();
        let permanent = Uuid::new_v4();
        manager.mute(ServerMute::new(temporary, Some(1_000), None)).await.unwrap();
        manager.mute(ServerMute::new(permanent, None, None)).await.unwrap();

        // Already past its end time.
        assert!(!manager.is_muted(&temporary));

        let expired = manager.expire(2_000).await;
        assert_eq!(expired, vec![temporary]);
        assert!(storage.get(&temporary).await.unwrap().is_none());
        assert!(manager.is_muted(&permanent));
    }

    #[tokio::test]
    async fn json_storage_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutes.json");
        let id = Uuid::new_v4();

        let storage = JsonMuteStorage::new(&path);
        storage.init().await.unwrap();
        storage.put(ServerMute::new(id, None, Some("loud".into()))).await.unwrap();

        let reloaded = Arc::new(JsonMuteStorage::new(&path));
        let manager = MuteManager::new(reloaded);
        manager.init().await.unwrap();
        assert_eq!(manager.get(&id).unwrap().reason.as_deref(), Some("loud"));
    }

    #[tokio::test]
    async fn json_storage_replaces_file_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutes.json");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let storage = JsonMuteStorage::new(&path);
        storage.init().await.unwrap();
        storage.put(ServerMute::new(first, None, None)).await.unwrap();
        storage.put(ServerMute::new(second, None, None)).await.unwrap();
        storage.remove(&first).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["mutes.json".to_string()]);

        let reloaded = JsonMuteStorage::new(&path);
        reloaded.init().await.unwrap();
        let all = reloaded.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].player_id, second);
    }

    /// Accepts writes, refuses removals.
    #[derive(Default)]
    struct StuckStorage {
        inner: MemoryMuteStorage,
    }

    #[async_trait]
    impl MuteStorage for StuckStorage {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn put(&self, mute: ServerMute) -> Result<()> {
            self.inner.put(mute).await
        }

        async fn remove(&self, _player_id: &Uuid) -> Result<Option<ServerMute>> {
            anyhow::bail!("disk is read-only")
        }

        async fn get(&self, player_id: &Uuid) -> Result<Option<ServerMute>> {
            self.inner.get(player_id).await
        }

        async fn all(&self) -> Result<Vec<ServerMute>> {
            self.inner.all().await
        }
    }

    #[tokio::test]
    async fn failed_removal_keeps_mute_for_next_sweep() {
        let manager = MuteManager::new(Arc::new(StuckStorage::default()));
        let id = Uuid::new_v4();
        manager.mute(ServerMute::new(id, Some(1_000), None)).await.unwrap();

        assert!(manager.expire(2_000).await.is_empty());
        assert!(manager.all().iter().any(|m| m.player_id == id));
    }

    #[tokio::test]
    async fn corrupt_json_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutes.json");
        std::fs::write(&path, "{not json").unwrap();
        let manager = MuteManager::new(Arc::new(JsonMuteStorage::new(&path)));
        assert!(manager.init().await.is_err());
    }

    #[tokio::test]
    async fn replaced_storage_clears_cache() {
        let manager = MuteManager::new(Arc::new(MemoryMuteStorage::default()));
        let id = Uuid::new_v4();
        manager.mute(ServerMute::new(id, None, None)).await.unwrap();
        manager.set_storage(Arc::new(MemoryMuteStorage::default()));
        manager.init().await.unwrap();
        assert!(!manager.is_muted(&id));
    }
}

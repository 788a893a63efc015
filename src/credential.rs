// Copyright 2024 StorSched Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Delegated credentials bound to operations, with a bounded in-memory cache
//! in front of the persistent credential store.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// A credential delegated by a client for use by its operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedCredential {
    pub id: u64,
    /// Distinguished name of the delegating identity
    pub name: String,
    pub role: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Opaque credential material as handed over by the delegation protocol
    pub material: Vec<u8>,
}

impl DelegatedCredential {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn remaining_lifetime(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Persistent store for delegated credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, credential: &DelegatedCredential) -> Result<()>;

    async fn load(&self, id: u64) -> Result<Option<DelegatedCredential>>;

    /// Most recent unexpired credential for a name/role pair.
    async fn find(&self, name: &str, role: Option<&str>) -> Result<Option<DelegatedCredential>>;
}

struct CacheEntry {
    credential: Arc<DelegatedCredential>,
    cached_at: Instant,
}

/// Store front-end with a capacity- and TTL-bounded cache.
///
/// Operations look credentials up by id on every scheduling quantum; the
/// cache keeps that off the store's hot path. Eviction is oldest-first when
/// over capacity.
pub struct CredentialRegistry {
    store: Arc<dyn CredentialStore>,
    cache: Mutex<HashMap<u64, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl CredentialRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    /// Register a freshly delegated credential: persist it and prime the
    /// cache.
    pub async fn put(&self, credential: DelegatedCredential) -> Result<()> {
        self.store.save(&credential).await?;
        let mut cache = self.cache.lock().await;
        Self::insert_bounded(&mut cache, self.capacity, Arc::new(credential));
        Ok(())
    }

    /// Look a credential up by id, hitting the store only on cache miss or
    /// stale entry. Expired credentials are rejected with
    /// [`Error::Expired`].
    pub async fn get(&self, id: u64) -> Result<Arc<DelegatedCredential>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&id) {
                if entry.cached_at.elapsed() < self.ttl {
                    let credential = entry.credential.clone();
                    drop(cache);
                    return Self::check_expiry(credential);
                }
                debug!(credential = id, "evicting stale cache entry");
                cache.remove(&id);
            }
        }

        let credential = self
            .store
            .load(id)
            .await?
            .ok_or(Error::CredentialNotFound(id))?;
        let credential = Arc::new(credential);
        let mut cache = self.cache.lock().await;
        Self::insert_bounded(&mut cache, self.capacity, credential.clone());
        drop(cache);
        Self::check_expiry(credential)
    }

    /// Find the best credential for a name/role pair, bypassing the id
    /// cache.
    pub async fn find(
        &self,
        name: &str,
        role: Option<&str>,
    ) -> Result<Option<DelegatedCredential>> {
        self.store.find(name, role).await
    }

    fn check_expiry(credential: Arc<DelegatedCredential>) -> Result<Arc<DelegatedCredential>> {
        if credential.is_expired() {
            return Err(Error::Expired);
        }
        Ok(credential)
    }

    fn insert_bounded(
        cache: &mut HashMap<u64, CacheEntry>,
        capacity: usize,
        credential: Arc<DelegatedCredential>,
    ) {
        if cache.len() >= capacity && !cache.contains_key(&credential.id) {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(id, _)| *id)
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            credential.id,
            CacheEntry {
                credential,
                cached_at: Instant::now(),
            },
        );
    }
}

/// In-memory [`CredentialStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<u64, DelegatedCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, credential: &DelegatedCredential) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(credential.id, credential.clone());
        Ok(())
    }

    async fn load(&self, id: u64) -> Result<Option<DelegatedCredential>> {
        Ok(self.credentials.read().await.get(&id).cloned())
    }

    async fn find(&self, name: &str, role: Option<&str>) -> Result<Option<DelegatedCredential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .values()
            .filter(|c| c.name == name && c.role.as_deref() == role && !c.is_expired())
            .max_by_key(|c| c.expires_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: u64, name: &str, valid_for: chrono::Duration) -> DelegatedCredential {
        DelegatedCredential {
            id,
            name: name.to_string(),
            role: None,
            expires_at: Utc::now() + valid_for,
            material: vec![1, 2, 3],
        }
    }

    fn registry(capacity: usize) -> CredentialRegistry {
        CredentialRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            capacity,
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn get_returns_registered_credential() {
        let registry = registry(10);
        registry
            .put(credential(1, "dn=alice", chrono::Duration::hours(1)))
            .await
            .unwrap();
        let got = registry.get(1).await.unwrap();
        assert_eq!(got.name, "dn=alice");
        assert!(matches!(registry.get(2).await, Err(Error::CredentialNotFound(2))));
    }

    #[tokio::test]
    async fn expired_credential_is_rejected() {
        let registry = registry(10);
        registry
            .put(credential(1, "dn=alice", chrono::Duration::hours(-1)))
            .await
            .unwrap();
        assert!(matches!(registry.get(1).await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn cache_stays_within_capacity() {
        let registry = registry(2);
        for id in 1..=3 {
            registry
                .put(credential(id, "dn=alice", chrono::Duration::hours(1)))
                .await
                .unwrap();
        }
        assert!(registry.cache.lock().await.len() <= 2);
        // Evicted entries are still served from the store
        for id in 1..=3 {
            assert!(registry.get(id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn find_prefers_longest_lived_unexpired() {
        let store = MemoryCredentialStore::new();
        store
            .save(&credential(1, "dn=alice", chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .save(&credential(2, "dn=alice", chrono::Duration::hours(2)))
            .await
            .unwrap();
        store
            .save(&credential(3, "dn=alice", chrono::Duration::hours(-1)))
            .await
            .unwrap();
        let found = store.find("dn=alice", None).await.unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert!(store.find("dn=bob", None).await.unwrap().is_none());
    }
}

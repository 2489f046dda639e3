//! Distributed group cache shared by all app instances.
//!
//! Every instance is both client and server. A key has exactly one owner
//! instance, chosen by stable hash over the current instance count; lookups
//! for keys owned elsewhere go over HTTP to the owner, pinned to the right
//! instance with the platform's `X-CF-APP-INSTANCE` routing header (all
//! instances share one external URL). The owner loads misses through the
//! group's getter and keeps the value in a byte-bounded LRU.
//!
//! Any peer failure degrades to loading locally; the cache trades accuracy
//! for availability everywhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use cffaas_common::error::{FaasError, Result};
use cffaas_common::http::{status_response, EventRequest, EventResponse};
use cffaas_common::platform::InstanceLister;

use crate::handler::{path_vars, Handler};

/// Path prefix for the peer protocol. Some random thing that won't collide
/// with a user route.
pub const BASE_PATH: &str = "/_group_cache_32723262323249873240";

/// Per-group storage cap.
const GROUP_CACHE_BYTES: usize = 1 << 20;

/// Deadline for a single peer fetch.
const PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Loads a value for a key on a cache miss.
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes>;
}

/// LRU bounded by total value bytes rather than entry count.
struct ByteBoundedLru {
    entries: LruCache<String, Bytes>,
    total: usize,
    cap: usize,
}

impl ByteBoundedLru {
    fn new(cap: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total: 0,
            cap,
        }
    }

    fn get(&mut self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Bytes) {
        if value.len() > self.cap {
            return;
        }
        if let Some(old) = self.entries.pop(&key) {
            self.total -= old.len();
        }
        self.total += value.len();
        self.entries.put(key, value);

        while self.total > self.cap {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.total -= evicted.len();
        }
    }
}

/// One named cache group with its loader and local store.
pub struct Group {
    name: String,
    getter: Arc<dyn Getter>,
    store: Mutex<ByteBoundedLru>,
    pool: Arc<GroupCachePool>,
}

impl Group {
    /// Looks a key up: local store, then the owning peer, then the getter.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        if let Some(value) = self.store.lock().get(key) {
            return Ok(value);
        }

        if let Some(instance) = self.pool.pick_peer(key) {
            match self.pool.fetch_from_peer(instance, &self.name, key).await {
                Ok(value) => {
                    self.store.lock().insert(key.to_string(), value.clone());
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!(
                        group = %self.name,
                        instance,
                        error = %e,
                        "peer fetch failed; loading locally"
                    );
                }
            }
        }

        self.load_local(key).await
    }

    /// Loads through the getter without consulting peers. This is what the
    /// peer protocol handler calls on the owning instance.
    async fn load_local(&self, key: &str) -> Result<Bytes> {
        if let Some(value) = self.store.lock().get(key) {
            return Ok(value);
        }
        let value = self.getter.get(key).await?;
        self.store.lock().insert(key.to_string(), value.clone());
        Ok(value)
    }
}

/// The per-process peer pool: owns the groups, the peer set and the HTTP
/// side of the peer protocol.
pub struct GroupCachePool {
    external_addr: String,
    app_guid: String,
    self_instance: usize,
    instances: AtomicUsize,
    groups: Mutex<HashMap<String, Arc<Group>>>,
    http: reqwest::Client,
}

impl GroupCachePool {
    /// Creates a pool that initially knows only itself.
    ///
    /// # Arguments
    /// * `external_addr` - The shared external route of the app
    /// * `app_guid` - Application guid used in the instance routing header
    /// * `self_instance` - This instance's index
    /// * `http` - Shared reqwest client
    pub fn new(
        external_addr: String,
        app_guid: String,
        self_instance: usize,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            external_addr,
            app_guid,
            self_instance,
            instances: AtomicUsize::new(1),
            groups: Mutex::new(HashMap::new()),
            http,
        })
    }

    /// Registers (or returns the existing) group under `name`.
    pub fn add_group(self: &Arc<Self>, name: &str, getter: Arc<dyn Getter>) -> Arc<Group> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            return group.clone();
        }

        let group = Arc::new(Group {
            name: name.to_string(),
            getter,
            store: Mutex::new(ByteBoundedLru::new(GROUP_CACHE_BYTES)),
            pool: self.clone(),
        });
        groups.insert(name.to_string(), group.clone());
        group
    }

    /// Updates the number of peer instances. Never drops below one.
    pub fn set_instance_count(&self, count: usize) {
        self.instances.store(count.max(1), Ordering::SeqCst);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    /// Picks the owning instance for a key, or `None` when this instance
    /// owns it (or no peers are known).
    fn pick_peer(&self, key: &str) -> Option<usize> {
        let count = self.instances.load(Ordering::SeqCst);
        if count <= 1 {
            return None;
        }

        // Processes must agree on the owner, so the hash has to be stable
        // across builds and hosts.
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let owner = (u64::from_be_bytes(prefix) % count as u64) as usize;

        if owner == self.self_instance {
            None
        } else {
            Some(owner)
        }
    }

    async fn fetch_from_peer(&self, instance: usize, group: &str, key: &str) -> Result<Bytes> {
        let url = format!("{}{}/{}/{}", self.external_addr, BASE_PATH, group, key);

        let resp = self
            .http
            .get(&url)
            .header(
                "X-CF-APP-INSTANCE",
                format!("{}:{}", self.app_guid, instance),
            )
            .timeout(PEER_FETCH_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FaasError::Cache(format!(
                "peer {} answered {} for {}/{}",
                instance, status, group, key
            )));
        }

        Ok(resp.bytes().await?)
    }
}

#[async_trait]
impl Handler for GroupCachePool {
    /// Serves peer lookups. The platform routed this request to us because
    /// we own the key, so only load locally - never re-enter peer selection.
    async fn handle(&self, req: EventRequest) -> EventResponse {
        let vars = path_vars(&req);
        let (Some(name), Some(key)) = (vars.get("name"), vars.get("key")) else {
            return status_response(StatusCode::NOT_FOUND);
        };

        let group = self.groups.lock().get(name).cloned();
        let Some(group) = group else {
            return status_response(StatusCode::NOT_FOUND);
        };

        match group.load_local(key).await {
            Ok(value) => {
                let mut resp = http::Response::new(Full::new(value));
                *resp.status_mut() = StatusCode::OK;
                resp
            }
            Err(e) => {
                tracing::warn!(group = %name, error = %e, "failed to load value for peer");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Keeps the pool's peer set in step with the platform's instance count.
pub struct PeerManager {
    pool: Arc<GroupCachePool>,
    lister: Arc<dyn InstanceLister>,
    app_guid: String,
    interval: Duration,
}

impl PeerManager {
    pub fn new(
        pool: Arc<GroupCachePool>,
        lister: Arc<dyn InstanceLister>,
        app_guid: String,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            lister,
            app_guid,
            interval,
        }
    }

    /// One refresh pass. Failures keep the previous peer set.
    pub async fn tick(&self) {
        match tokio::time::timeout(
            Duration::from_secs(10),
            self.lister.instance_count(&self.app_guid),
        )
        .await
        {
            Ok(Ok(count)) => self.pool.set_instance_count(count),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to refresh peer set"),
            Err(_) => tracing::warn!("timed out refreshing peer set"),
        }
    }

    /// Starts the periodic refresh loop. The first pass runs immediately.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize as TestCounter;

    struct CountingGetter {
        calls: TestCounter,
        value: Bytes,
    }

    impl CountingGetter {
        fn new(value: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: TestCounter::new(0),
                value: Bytes::from(value.to_string()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Getter for CountingGetter {
        async fn get(&self, _key: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    fn pool() -> Arc<GroupCachePool> {
        GroupCachePool::new(
            "http://app.example.com".into(),
            "app-guid".into(),
            0,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_get_loads_once_then_hits() {
        let getter = CountingGetter::new("value");
        let group = pool().add_group("g", getter.clone());

        assert_eq!(&group.get("k").await.unwrap()[..], b"value");
        assert_eq!(&group.get("k").await.unwrap()[..], b"value");
        assert_eq!(getter.calls(), 1);
    }

    #[tokio::test]
    async fn test_add_group_is_idempotent() {
        let p = pool();
        let getter = CountingGetter::new("v");
        let g1 = p.add_group("g", getter.clone());
        let g2 = p.add_group("g", CountingGetter::new("other"));

        g1.get("k").await.unwrap();
        assert_eq!(&g2.get("k").await.unwrap()[..], b"v");
        assert_eq!(getter.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_instance_never_picks_a_peer() {
        let p = pool();
        assert_eq!(p.pick_peer("any-key"), None);
    }

    #[tokio::test]
    async fn test_peer_pick_is_stable_and_excludes_self() {
        let p = pool();
        p.set_instance_count(4);

        for key in ["a", "b", "c", "d", "e", "f"] {
            let first = p.pick_peer(key);
            assert_eq!(first, p.pick_peer(key));
            if let Some(instance) = first {
                assert_ne!(instance, 0);
                assert!(instance < 4);
            }
        }
    }

    #[tokio::test]
    async fn test_instance_count_never_below_one() {
        let p = pool();
        p.set_instance_count(0);
        assert_eq!(p.instance_count(), 1);
    }

    #[test]
    fn test_byte_lru_evicts_oldest() {
        let mut lru = ByteBoundedLru::new(10);
        lru.insert("a".into(), Bytes::from_static(b"aaaa"));
        lru.insert("b".into(), Bytes::from_static(b"bbbb"));
        // Touch "a" so "b" is the eviction candidate.
        lru.get("a");
        lru.insert("c".into(), Bytes::from_static(b"cccc"));

        assert!(lru.get("a").is_some());
        assert!(lru.get("b").is_none());
        assert!(lru.get("c").is_some());
        assert!(lru.total <= 10);
    }

    #[test]
    fn test_byte_lru_rejects_oversized_values() {
        let mut lru = ByteBoundedLru::new(4);
        lru.insert("big".into(), Bytes::from_static(b"too large"));
        assert!(lru.get("big").is_none());
        assert_eq!(lru.total, 0);
    }

    #[test]
    fn test_byte_lru_replacing_key_adjusts_total() {
        let mut lru = ByteBoundedLru::new(10);
        lru.insert("a".into(), Bytes::from_static(b"aaaa"));
        lru.insert("a".into(), Bytes::from_static(b"aa"));
        assert_eq!(lru.total, 2);
    }

    #[tokio::test]
    async fn test_peer_handler_unknown_group_is_404() {
        let p = pool();
        let mut req = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("{}/ghost/key", BASE_PATH))
            .body(Bytes::new())
            .unwrap();
        req.extensions_mut().insert(crate::handler::PathVars(
            HashMap::from([
                ("name".to_string(), "ghost".to_string()),
                ("key".to_string(), "key".to_string()),
            ]),
        ));

        let resp = p.handle(req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_peer_handler_serves_local_load() {
        let p = pool();
        let getter = CountingGetter::new("shared");
        p.add_group("g", getter);

        let mut req = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("{}/g/key", BASE_PATH))
            .body(Bytes::new())
            .unwrap();
        req.extensions_mut().insert(crate::handler::PathVars(
            HashMap::from([
                ("name".to_string(), "g".to_string()),
                ("key".to_string(), "key".to_string()),
            ]),
        ));

        let resp = p.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

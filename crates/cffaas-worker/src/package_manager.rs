//! Caching loader for deployed droplet packages.
//!
//! A background loop periodically resolves each configured app name to its
//! current `(package guid, download URL)` through the platform seam, then
//! makes sure that package is unpacked on the scratch filesystem. Unpacked
//! directories live in an LRU of [`LRU_CAPACITY`] entries keyed by
//! `(app, guid, url)`; room is made for a new package before it is
//! downloaded, so the scratch disk never holds more than the capacity.
//!
//! [`PackageManager::package_for_app`] blocks until the first resolution
//! pass finishes - an app must never look unknown just because the process
//! started a moment ago. Per-app failures are logged and retried on the next
//! tick; they never surface to callers.
//!
//! Archives are unpacked flat: every entry lands directly in
//! `<data_dir>/<package_guid>/` and is marked executable. Entry names with
//! path separators or `..` segments are rejected outright.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use cffaas_common::error::{FaasError, Result};
use cffaas_common::platform::PackageClient;

/// Unpacked packages kept on disk at once.
const LRU_CAPACITY: usize = 100;

/// Deadline for each name/package resolution call.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PackageKey {
    app_name: String,
    package_guid: String,
    download_url: String,
}

/// Makes each app's deployed artifact available as a local directory.
#[derive(Clone)]
pub struct PackageManager {
    inner: Arc<PmInner>,
}

struct PmInner {
    client: Arc<dyn PackageClient>,
    http: reqwest::Client,
    data_dir: PathBuf,
    app_names: Vec<String>,
    dirs: RwLock<HashMap<String, PathBuf>>,
    cache: Mutex<LruCache<PackageKey, PathBuf>>,
    ready_rx: watch::Receiver<bool>,
}

impl PackageManager {
    /// Creates a manager and starts its polling loop.
    ///
    /// # Arguments
    /// * `app_names` - Apps whose packages this worker may execute
    /// * `interval` - Polling period for package resolution
    /// * `data_dir` - Scratch directory (typically `/dev/shm`)
    /// * `client` - Platform seam for name and package resolution
    /// * `http` - Client used for the actual package downloads
    pub fn new(
        app_names: Vec<String>,
        interval: Duration,
        data_dir: PathBuf,
        client: Arc<dyn PackageClient>,
        http: reqwest::Client,
    ) -> Self {
        Self::with_capacity(app_names, interval, data_dir, client, http, LRU_CAPACITY)
    }

    fn with_capacity(
        app_names: Vec<String>,
        interval: Duration,
        data_dir: PathBuf,
        client: Arc<dyn PackageClient>,
        http: reqwest::Client,
        capacity: usize,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        let inner = Arc::new(PmInner {
            client,
            http,
            data_dir,
            app_names,
            dirs: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(capacity)),
            ready_rx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.refresh_all().await;
            }
            let _ = ready_tx.send(true);

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                inner.refresh_all().await;
            }
        });

        Self { inner }
    }

    /// Returns the unpacked directory for `app_name`.
    ///
    /// Blocks until the initial resolution pass completes, then answers from
    /// the latest known mapping.
    pub async fn package_for_app(&self, app_name: &str) -> Result<PathBuf> {
        let mut ready = self.inner.ready_rx.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                break;
            }
        }

        self.inner
            .dirs
            .read()
            .get(app_name)
            .cloned()
            .ok_or_else(|| FaasError::UnknownApp(app_name.to_string()))
    }
}

impl PmInner {
    async fn refresh_all(&self) {
        let passes = self.app_names.iter().map(|name| self.refresh_app(name));
        futures::future::join_all(passes).await;
    }

    async fn refresh_app(&self, app_name: &str) {
        if let Err(e) = self.try_refresh_app(app_name).await {
            tracing::warn!(app_name, error = %e, "failed to refresh package; retrying next tick");
        }
    }

    async fn try_refresh_app(&self, app_name: &str) -> Result<()> {
        let app_guid = tokio::time::timeout(RESOLVE_TIMEOUT, self.client.get_app_guid(app_name))
            .await
            .map_err(|_| FaasError::DeadlineExceeded(RESOLVE_TIMEOUT.as_millis() as u64))??;

        let package = tokio::time::timeout(RESOLVE_TIMEOUT, self.client.get_package(&app_guid))
            .await
            .map_err(|_| FaasError::DeadlineExceeded(RESOLVE_TIMEOUT.as_millis() as u64))??;

        self.ensure_package(PackageKey {
            app_name: app_name.to_string(),
            package_guid: package.guid,
            download_url: package.download_url,
        })
        .await
    }

    async fn ensure_package(&self, key: PackageKey) -> Result<()> {
        {
            let mut cache = self.cache.lock().await;
            // A hit also refreshes recency.
            if cache.get(&key).is_some() {
                return Ok(());
            }
        }

        // Make room before downloading: the evicted directory must be gone
        // before the next package lands on the scratch filesystem.
        let evicted = {
            let mut cache = self.cache.lock().await;
            if cache.len() >= cache.cap().get() {
                cache.pop_lru()
            } else {
                None
            }
        };
        if let Some((old_key, old_dir)) = evicted {
            tracing::info!(
                app_name = %old_key.app_name,
                package_guid = %old_key.package_guid,
                "evicting package"
            );
            if let Err(e) = tokio::fs::remove_dir_all(&old_dir).await {
                tracing::warn!(error = %e, "failed to clean up evicted package");
            }
        }

        let dir = self.download_and_unpack(&key).await?;
        self.dirs
            .write()
            .insert(key.app_name.clone(), dir.clone());

        // Concurrent first-pass downloads can overshoot the room made above;
        // push then evicts on its own and that directory must go too.
        let overflow = self.cache.lock().await.push(key, dir);
        if let Some((old_key, old_dir)) = overflow {
            tracing::info!(
                app_name = %old_key.app_name,
                package_guid = %old_key.package_guid,
                "evicting package"
            );
            if let Err(e) = tokio::fs::remove_dir_all(&old_dir).await {
                tracing::warn!(error = %e, "failed to clean up evicted package");
            }
        }

        Ok(())
    }

    async fn download_and_unpack(&self, key: &PackageKey) -> Result<PathBuf> {
        let resp = self.http.get(&key.download_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FaasError::UnexpectedStatus {
                context: key.download_url.clone(),
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let bytes = resp.bytes().await?;

        let zip_path = self.data_dir.join(format!("{}.zip", key.package_guid));
        tokio::fs::write(&zip_path, &bytes).await?;

        let dir = self.data_dir.join(&key.package_guid);
        let unpack_zip = zip_path.clone();
        let unpack_dir = dir.clone();
        tokio::task::spawn_blocking(move || unpack_flat(&unpack_zip, &unpack_dir))
            .await
            .map_err(|e| FaasError::Package(format!("unpack task failed: {}", e)))??;

        let _ = tokio::fs::remove_file(&zip_path).await;

        tracing::info!(
            app_name = %key.app_name,
            package_guid = %key.package_guid,
            dir = %dir.display(),
            "downloaded package"
        );

        Ok(dir)
    }
}

/// Unpacks every archive entry directly into `dir` and marks it executable.
fn unpack_flat(zip_path: &Path, dir: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| FaasError::Package(format!("bad archive: {}", e)))?;

    std::fs::create_dir_all(dir)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FaasError::Package(format!("bad archive entry: {}", e)))?;

        let name = entry.name().to_string();
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(FaasError::ArchiveEntry(name));
        }

        let out_path = dir.join(&name);
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(0o777))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use cffaas_common::platform::PackageInfo;

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    /// Serves the same zip for every request, counting downloads.
    async fn zip_server(payload: Vec<u8>, downloads: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = payload.clone();
                let downloads = downloads.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req| {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        let payload = payload.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(http::Response::new(Full::new(
                                Bytes::from(payload),
                            )))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        format!("http://{}/package", addr)
    }

    struct FakeClient {
        packages: HashMap<String, PackageInfo>,
    }

    #[async_trait]
    impl PackageClient for FakeClient {
        async fn get_app_guid(&self, app_name: &str) -> Result<String> {
            if self.packages.contains_key(app_name) {
                Ok(format!("{}-guid", app_name))
            } else {
                Err(FaasError::UnknownApp(app_name.to_string()))
            }
        }

        async fn get_package(&self, app_guid: &str) -> Result<PackageInfo> {
            let app_name = app_guid.trim_end_matches("-guid");
            self.packages
                .get(app_name)
                .cloned()
                .ok_or_else(|| FaasError::UnknownApp(app_name.to_string()))
        }
    }

    #[tokio::test]
    async fn test_first_pass_unpacks_and_maps() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let url = zip_server(zip_bytes(&[("echo", "#!/bin/bash\ncat")]), downloads.clone()).await;
        let data_dir = tempfile::tempdir().unwrap();

        let client = Arc::new(FakeClient {
            packages: HashMap::from([(
                "echo-app".to_string(),
                PackageInfo {
                    guid: "pkg-1".into(),
                    download_url: url,
                },
            )]),
        });

        let manager = PackageManager::new(
            vec!["echo-app".into()],
            Duration::from_secs(3600),
            data_dir.path().to_path_buf(),
            client,
            reqwest::Client::new(),
        );

        let dir = manager.package_for_app("echo-app").await.unwrap();
        assert_eq!(dir, data_dir.path().join("pkg-1"));

        let script = dir.join("echo");
        let content = std::fs::read_to_string(&script).unwrap();
        assert!(content.contains("cat"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_app_after_first_pass() {
        let data_dir = tempfile::tempdir().unwrap();
        let manager = PackageManager::new(
            vec![],
            Duration::from_secs(3600),
            data_dir.path().to_path_buf(),
            Arc::new(FakeClient {
                packages: HashMap::new(),
            }),
            reqwest::Client::new(),
        );

        let err = manager.package_for_app("ghost").await.unwrap_err();
        assert!(matches!(err, FaasError::UnknownApp(_)));
    }

    #[tokio::test]
    async fn test_resolution_failure_is_tolerated() {
        let data_dir = tempfile::tempdir().unwrap();
        // Client errors on every call; the manager must still become ready.
        let manager = PackageManager::new(
            vec!["broken-app".into()],
            Duration::from_secs(3600),
            data_dir.path().to_path_buf(),
            Arc::new(FakeClient {
                packages: HashMap::new(),
            }),
            reqwest::Client::new(),
        );

        let err = manager.package_for_app("broken-app").await.unwrap_err();
        assert!(matches!(err, FaasError::UnknownApp(_)));
    }

    #[tokio::test]
    async fn test_unchanged_package_downloads_once() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let url = zip_server(zip_bytes(&[("run", "x")]), downloads.clone()).await;
        let data_dir = tempfile::tempdir().unwrap();

        let client = Arc::new(FakeClient {
            packages: HashMap::from([(
                "echo-app".to_string(),
                PackageInfo {
                    guid: "pkg-1".into(),
                    download_url: url,
                },
            )]),
        });

        let manager = PackageManager::new(
            vec!["echo-app".into()],
            Duration::from_millis(20),
            data_dir.path().to_path_buf(),
            client,
            reqwest::Client::new(),
        );

        manager.package_for_app("echo-app").await.unwrap();
        // Let several polling ticks run against the same package guid.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eviction_deletes_directory() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let url = zip_server(zip_bytes(&[("run", "x")]), downloads.clone()).await;
        let data_dir = tempfile::tempdir().unwrap();

        let client = Arc::new(FakeClient {
            packages: HashMap::from([
                (
                    "app-a".to_string(),
                    PackageInfo {
                        guid: "pkg-a".into(),
                        download_url: url.clone(),
                    },
                ),
                (
                    "app-b".to_string(),
                    PackageInfo {
                        guid: "pkg-b".into(),
                        download_url: url.clone(),
                    },
                ),
                (
                    "app-c".to_string(),
                    PackageInfo {
                        guid: "pkg-c".into(),
                        download_url: url,
                    },
                ),
            ]),
        });

        let manager = PackageManager::with_capacity(
            vec!["app-a".into(), "app-b".into(), "app-c".into()],
            Duration::from_secs(3600),
            data_dir.path().to_path_buf(),
            client,
            reqwest::Client::new(),
            2,
        );

        // Wait for the first pass to settle.
        for app in ["app-a", "app-b", "app-c"] {
            let _ = manager.package_for_app(app).await;
        }

        let on_disk = std::fs::read_dir(data_dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count();
        assert!(on_disk <= 2, "{} package dirs on disk", on_disk);
    }

    #[test]
    fn test_unpack_rejects_traversal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        std::fs::write(&zip_path, zip_bytes(&[("../escape", "boom")])).unwrap();

        let err = unpack_flat(&zip_path, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, FaasError::ArchiveEntry(_)));
    }

    #[test]
    fn test_unpack_rejects_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("nested.zip");
        std::fs::write(&zip_path, zip_bytes(&[("sub/file", "x")])).unwrap();

        let err = unpack_flat(&zip_path, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, FaasError::ArchiveEntry(_)));
    }
}

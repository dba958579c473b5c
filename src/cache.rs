//! URL-keyed download cache.
//!
//! Remembers which demo URLs were already fetched, evicts entries older than
//! the retention window, and streams new files to `<root>/<tab>/<filename>`.
//! The metadata document is rewritten after every confirmed download so an
//! interrupted run never forgets a file it already has.

use crate::error::AcquireError;
use crate::progress::{DownloadEvent, ProgressReporter};
use crate::session::Session;
use crate::transport::{Download, Transport};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Entries older than this are evicted and their URLs become eligible again
pub const RETENTION_DAYS: i64 = 60;

const CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// Persisted metadata
// ============================================================================

/// A URL that has already been downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    /// Local path relative to the download root, `<tab>/<segment>`
    pub filename: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub download_date: DateTime<Utc>,
}

/// Accept RFC 3339 as well as zone-less ISO timestamps (read as UTC)
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// All cache entries, persisted as one JSON document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStore {
    #[serde(default)]
    pub files: Vec<CacheEntry>,
}

impl CacheStore {
    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.files.iter().find(|e| e.url == url)
    }

    /// Entry already mapped to a local path, if any
    pub fn by_filename(&self, filename: &str) -> Option<&CacheEntry> {
        self.files.iter().find(|e| e.filename == filename)
    }

    /// Insert or replace the entry for `entry.url`, keeping one entry per URL
    pub fn insert(&mut self, entry: CacheEntry) {
        if let Some(existing) = self.files.iter_mut().find(|e| e.url == entry.url) {
            *existing = entry;
        } else {
            self.files.push(entry);
        }
    }

    /// Drop entries whose age exceeds `window`; returns how many were removed
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let before = self.files.len();
        self.files.retain(|e| now - e.download_date <= window);
        before - self.files.len()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Load from `path`; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let store: CacheStore = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(store)
    }

    /// Write the whole document through a temp file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Download cache
// ============================================================================

/// Per-category download counters
#[derive(Debug, Default)]
pub struct FetchReport {
    pub downloaded: usize,
    pub cached: usize,
    pub failed: usize,
}

enum Fetched {
    Downloaded(String),
    AlreadyCached(String),
}

pub struct DownloadCache<T> {
    root: PathBuf,
    metadata_path: PathBuf,
    transport: T,
    progress: Box<dyn ProgressReporter>,
    store: CacheStore,
    prepared: bool,
    /// Set when an unreadable document could not be moved aside
    keep_on_disk: bool,
}

impl<T: Transport> DownloadCache<T> {
    pub fn new(
        root: impl Into<PathBuf>,
        metadata_path: impl Into<PathBuf>,
        transport: T,
        progress: Box<dyn ProgressReporter>,
    ) -> Self {
        Self {
            root: root.into(),
            metadata_path: metadata_path.into(),
            transport,
            progress,
            store: CacheStore::default(),
            prepared: false,
            keep_on_disk: false,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    #[cfg(test)]
    pub fn is_cached(&self, url: &str) -> bool {
        self.store.get(url).is_some()
    }

    pub fn prepare_session(&mut self) -> usize {
        self.prepare_session_at(Utc::now())
    }

    /// Load the store, evict expired entries and persist the pruned result.
    /// Returns the number of evicted entries.
    pub fn prepare_session_at(&mut self, now: DateTime<Utc>) -> usize {
        self.keep_on_disk = false;
        self.store = match CacheStore::load(&self.metadata_path) {
            Ok(store) => store,
            Err(err) => {
                let aside = self.metadata_path.with_extension("json.corrupt");
                tracing::error!(
                    path = %self.metadata_path.display(),
                    moved_to = %aside.display(),
                    error = %format!("{:#}", err),
                    "cache metadata unreadable, starting empty"
                );
                if let Err(err) = fs::rename(&self.metadata_path, &aside) {
                    tracing::error!(
                        path = %self.metadata_path.display(),
                        error = %err,
                        "could not move cache metadata aside, leaving it untouched"
                    );
                    self.keep_on_disk = true;
                }
                CacheStore::default()
            }
        };
        self.prepared = true;
        if self.store.is_empty() {
            tracing::debug!(path = %self.metadata_path.display(), "no cached downloads");
        }

        let evicted = self.store.evict_older_than(now, Duration::days(RETENTION_DAYS));
        tracing::info!(entries = self.store.len(), evicted, "cache prepared");
        self.persist();
        evicted
    }

    /// Fetch every URL not yet cached, in order, into `<root>/<tab>/`.
    ///
    /// Failures are contained per URL and counted in the report.
    pub fn fetch_all(&mut self, urls: &[String], tab: &str, session: &Session) -> FetchReport {
        if !self.prepared {
            self.prepare_session();
        }

        let mut report = FetchReport::default();
        for url in urls {
            match self.fetch_one(url, tab, session) {
                Ok(Fetched::Downloaded(filename)) => {
                    tracing::info!(tab, url = %url, file = %filename, "downloaded");
                    report.downloaded += 1;
                }
                Ok(Fetched::AlreadyCached(filename)) => {
                    tracing::info!(tab, url = %url, file = %filename, "already cached, skipping");
                    report.cached += 1;
                }
                Err(err) => {
                    tracing::error!(tab, error = %err, kind = err.kind(), "download failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn fetch_one(
        &mut self,
        url: &str,
        tab: &str,
        session: &Session,
    ) -> Result<Fetched, AcquireError> {
        if let Some(entry) = self.store.get(url) {
            return Ok(Fetched::AlreadyCached(entry.filename.clone()));
        }

        if !is_safe_component(tab) {
            return Err(AcquireError::download(url, format!("invalid tab name '{}'", tab)));
        }
        let name = filename_from_url(url)
            .ok_or_else(|| AcquireError::download(url, "URL has no usable file name"))?;
        let relative = format!("{}/{}", tab, name);
        let dir = self.root.join(tab);
        let target = dir.join(&name);

        if let Some(other) = self.store.by_filename(&relative) {
            tracing::warn!(
                url,
                previous_url = %other.url,
                file = %relative,
                "file name collision, overwriting previous download"
            );
        } else if target.exists() {
            tracing::warn!(url, file = %target.display(), "overwriting untracked file");
        }

        fs::create_dir_all(&dir).map_err(|e| {
            AcquireError::download(url, format!("creating {}: {}", dir.display(), e))
        })?;

        let download = self.transport.open(url, session)?;
        let part = dir.join(format!("{}.part", name));
        match self.stream_to(&part, download, &relative) {
            Ok(bytes) => {
                fs::rename(&part, &target).map_err(|e| {
                    let _ = fs::remove_file(&part);
                    AcquireError::download(url, format!("finalizing {}: {}", target.display(), e))
                })?;
                tracing::debug!(url, bytes, "stream complete");
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(AcquireError::download(url, format!("{:#}", e)));
            }
        }

        self.store.insert(CacheEntry {
            url: url.to_string(),
            filename: relative.clone(),
            download_date: Utc::now(),
        });
        self.persist();
        Ok(Fetched::Downloaded(relative))
    }

    fn stream_to(&self, path: &Path, mut download: Download, label: &str) -> Result<u64> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut bytes: u64 = 0;

        self.progress.report(DownloadEvent::Started {
            file: label.to_string(),
            total: download.total,
        });

        loop {
            let n = match download.body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading response body"),
            };
            writer.write_all(&buf[..n])?;
            bytes += n as u64;
            self.progress.report(DownloadEvent::Transferred {
                file: label.to_string(),
                bytes,
                total: download.total,
            });
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;

        self.progress.report(DownloadEvent::Finished {
            file: label.to_string(),
            bytes,
        });
        Ok(bytes)
    }

    /// Persist the store; failures are logged and the in-memory state kept
    fn persist(&self) {
        if self.keep_on_disk {
            tracing::warn!(
                path = %self.metadata_path.display(),
                "cache metadata not saved, existing document kept"
            );
            return;
        }
        if let Err(err) = self.store.save(&self.metadata_path) {
            let err = AcquireError::persistence(&self.metadata_path, format!("{:#}", err));
            tracing::error!(error = %err, "cache metadata not saved, continuing in memory");
        }
    }
}

/// Last path segment of `url`, used as the local file name
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    if is_safe_component(segment) {
        Some(segment.to_string())
    } else {
        None
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::session::tests::test_session;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Serves canned bodies by URL and records every request
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub bodies: HashMap<String, Vec<u8>>,
        pub requests: RefCell<Vec<String>>,
    }

    impl FakeTransport {
        pub(crate) fn serving(urls: &[&str]) -> Self {
            let bodies = urls
                .iter()
                .map(|u| (u.to_string(), format!("demo bytes of {}", u).into_bytes()))
                .collect();
            Self {
                bodies,
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for &FakeTransport {
        fn open(&self, url: &str, _session: &Session) -> Result<Download, AcquireError> {
            self.requests.borrow_mut().push(url.to_string());
            match self.bodies.get(url) {
                Some(body) => Ok(Download {
                    total: Some(body.len() as u64),
                    body: Box::new(Cursor::new(body.clone())),
                }),
                None => Err(AcquireError::download(url, "HTTP 404 Not Found")),
            }
        }
    }

    const A: &str = "https://replay181.valve.net/730/003690000000000000001_0001.dem.bz2";
    const B: &str = "https://replay182.valve.net/730/003690000000000000002_0002.dem.bz2";
    const C: &str = "https://replay183.valve.net/730/003690000000000000003_0003.dem.bz2";

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn cache<'a>(dir: &TempDir, transport: &'a FakeTransport) -> DownloadCache<&'a FakeTransport> {
        DownloadCache::new(
            dir.path().join("demos"),
            dir.path().join("cache.json"),
            transport,
            Box::new(NoProgress),
        )
    }

    fn entry(url: &str, age: Duration, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            filename: format!("premier/{}", filename_from_url(url).unwrap()),
            download_date: now - age,
        }
    }

    #[test]
    fn test_downloads_then_skips_on_second_run() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B]);
        let session = test_session("alice", "t");

        let mut first = cache(&dir, &transport);
        first.prepare_session();
        let report = first.fetch_all(&urls(&[A, B]), "competitive", &session);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.cached, 0);
        let store_after_first = first.store().clone();

        // A fresh cache instance simulates the next process run
        let mut second = cache(&dir, &transport);
        second.prepare_session();
        let report = second.fetch_all(&urls(&[A, B]), "competitive", &session);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.cached, 2);
        assert_eq!(second.store(), &store_after_first);
        assert_eq!(transport.requests.borrow().len(), 2);
    }

    #[test]
    fn test_overlapping_lists_keep_one_entry_per_url() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B, C]);
        let session = test_session("alice", "t");
        let mut cache = cache(&dir, &transport);
        cache.prepare_session();

        cache.fetch_all(&urls(&[A, B, A]), "premier", &session);
        cache.fetch_all(&urls(&[B, C]), "premier", &session);

        assert_eq!(cache.store().len(), 3);
        for url in [A, B, C] {
            assert_eq!(cache.store().files.iter().filter(|e| e.url == url).count(), 1);
        }
        assert_eq!(transport.requests.borrow().len(), 3);
    }

    #[test]
    fn test_eviction_boundary_and_bit_exact_retention() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let expired = entry(A, Duration::days(60) + Duration::seconds(1), now);
        let boundary = entry(B, Duration::days(60), now);
        let fresh = entry(C, Duration::days(3) + Duration::nanoseconds(123_456_789), now);
        CacheStore {
            files: vec![expired, boundary.clone(), fresh.clone()],
        }
        .save(&dir.path().join("cache.json"))
        .unwrap();

        let transport = FakeTransport::default();
        let mut cache = cache(&dir, &transport);
        let evicted = cache.prepare_session_at(now);

        assert_eq!(evicted, 1);
        assert!(!cache.is_cached(A));
        assert_eq!(cache.store().files, vec![boundary.clone(), fresh.clone()]);

        // The pruned store is persisted before any download happens
        let on_disk = CacheStore::load(&dir.path().join("cache.json")).unwrap();
        assert_eq!(on_disk.files, vec![boundary, fresh]);
    }

    #[test]
    fn test_evicted_url_is_downloaded_again() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        CacheStore {
            files: vec![entry(A, Duration::days(90), now)],
        }
        .save(&dir.path().join("cache.json"))
        .unwrap();

        let transport = FakeTransport::serving(&[A]);
        let mut cache = cache(&dir, &transport);
        cache.prepare_session_at(now);
        let report = cache.fetch_all(&urls(&[A]), "premier", &test_session("alice", "t"));
        assert_eq!(report.downloaded, 1);
    }

    #[test]
    fn test_failed_url_does_not_stop_the_rest() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, C]);
        let mut cache = cache(&dir, &transport);
        cache.prepare_session();

        let report = cache.fetch_all(&urls(&[A, B, C]), "wingman", &test_session("alice", "t"));
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failed, 1);
        assert!(!cache.is_cached(B));

        let wingman = dir.path().join("demos").join("wingman");
        let names: Vec<String> = fs::read_dir(&wingman)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".part")));
    }

    #[test]
    fn test_each_download_is_persisted_immediately() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A]);
        let mut cache = cache(&dir, &transport);
        cache.prepare_session();
        cache.fetch_all(&urls(&[A, B]), "premier", &test_session("alice", "t"));

        let on_disk = CacheStore::load(&dir.path().join("cache.json")).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk.files[0].url, A);
        assert_eq!(
            on_disk.files[0].filename,
            "premier/003690000000000000001_0001.dem.bz2"
        );
    }

    #[test]
    fn test_file_contents_written_under_tab() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A]);
        let mut cache = cache(&dir, &transport);
        cache.fetch_all(&urls(&[A]), "premier", &test_session("alice", "t"));

        let path = dir
            .path()
            .join("demos/premier/003690000000000000001_0001.dem.bz2");
        assert_eq!(
            fs::read(path).unwrap(),
            format!("demo bytes of {}", A).into_bytes()
        );
    }

    #[test]
    fn test_fetch_without_prepare_keeps_existing_entries() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        CacheStore {
            files: vec![entry(A, Duration::days(1), now)],
        }
        .save(&dir.path().join("cache.json"))
        .unwrap();

        let transport = FakeTransport::serving(&[B]);
        let mut cache = cache(&dir, &transport);
        let report = cache.fetch_all(&urls(&[A, B]), "premier", &test_session("alice", "t"));
        assert_eq!(report.cached, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(cache.store().len(), 2);
    }

    #[test]
    fn test_corrupt_metadata_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cache.json"), "{ not json").unwrap();

        let transport = FakeTransport::default();
        let mut cache = cache(&dir, &transport);
        cache.prepare_session();

        assert!(cache.store().is_empty());
        assert!(dir.path().join("cache.json.corrupt").exists());
        assert_eq!(
            CacheStore::load(&dir.path().join("cache.json")).unwrap(),
            CacheStore::default()
        );
    }

    #[test]
    fn test_unmovable_corrupt_metadata_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let metadata = dir.path().join("cache.json");
        fs::write(&metadata, "{ not json").unwrap();
        // A non-empty directory in the way makes the move aside fail
        let aside = dir.path().join("cache.json.corrupt");
        fs::create_dir(&aside).unwrap();
        fs::write(aside.join("keep"), "x").unwrap();

        let transport = FakeTransport::serving(&[A]);
        let mut cache = cache(&dir, &transport);
        cache.prepare_session();
        let report = cache.fetch_all(&urls(&[A]), "premier", &test_session("alice", "t"));

        assert_eq!(report.downloaded, 1);
        assert!(cache.is_cached(A));
        assert_eq!(fs::read_to_string(&metadata).unwrap(), "{ not json");
    }

    #[test]
    fn test_unwritable_metadata_keeps_entries_in_memory() {
        let dir = TempDir::new().unwrap();
        // The metadata path sits below a regular file, so every save fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let transport = FakeTransport::serving(&[A]);
        let mut cache = DownloadCache::new(
            dir.path().join("demos"),
            blocker.join("cache.json"),
            &transport,
            Box::new(NoProgress),
        );
        cache.prepare_session();
        let session = test_session("alice", "t");

        let first = cache.fetch_all(&urls(&[A]), "premier", &session);
        assert_eq!(first.downloaded, 1);
        assert_eq!(first.failed, 0);
        assert!(cache.is_cached(A));
        assert!(dir.path().join("demos/premier/003690000000000000001_0001.dem.bz2").is_file());

        let second = cache.fetch_all(&urls(&[A]), "premier", &session);
        assert_eq!(second.cached, 1);
        assert_eq!(second.downloaded, 0);
        assert_eq!(transport.requests.borrow().len(), 1);
    }

    #[test]
    fn test_reads_zone_less_timestamps() {
        let doc = r#"{"files": [{"url": "https://x/a.dem.bz2", "filename": "a.dem.bz2",
            "download_date": "2024-07-10T01:57:06.123456"}]}"#;
        let store: CacheStore = serde_json::from_str(doc).unwrap();
        assert_eq!(
            store.files[0].download_date.to_rfc3339(),
            "2024-07-10T01:57:06.123456+00:00"
        );
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url(A).as_deref(),
            Some("003690000000000000001_0001.dem.bz2")
        );
        assert_eq!(
            filename_from_url("https://replay1.valve.net/730/demo.dem.bz2?x=1").as_deref(),
            Some("demo.dem.bz2")
        );
        assert_eq!(filename_from_url("https://replay1.valve.net/730/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[test]
    fn test_same_segment_collision_overwrites() {
        let dir = TempDir::new().unwrap();
        let other = "https://replay999.valve.net/730/003690000000000000001_0001.dem.bz2";
        let transport = FakeTransport::serving(&[A, other]);
        let mut cache = cache(&dir, &transport);
        let report = cache.fetch_all(&urls(&[A, other]), "premier", &test_session("alice", "t"));

        assert_eq!(report.downloaded, 2);
        assert_eq!(cache.store().len(), 2);
        let path = dir
            .path()
            .join("demos/premier/003690000000000000001_0001.dem.bz2");
        assert_eq!(
            fs::read(path).unwrap(),
            format!("demo bytes of {}", other).into_bytes()
        );
    }
}

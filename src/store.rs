//! Atomic JSON document store.
//!
//! One JSON object per logical name, stored as `<root>/<name>.json`. Saves
//! write a temporary sibling, fsync it, and rename it over the target, so
//! the file on disk is always either the previous complete document or the
//! new one. Reads go through a TTL cache keyed by name plus the file's
//! modification stamp; saves write through to that cache.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, TtlCache};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::Document;
use crate::reclaim::Reclaimable;
use crate::telemetry::metrics;

const EXTENSION: &str = ".json";
const TEMP_EXTENSION: &str = ".tmp";
const ARCHIVE_MARKER: &str = "_archive_";
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What the file looked like when it was read. A changed file gets a new
/// stamp, so a stale cache entry is never hit again. Saves rename a fresh
/// file into place, so on unix the inode changes even when mtime and length
/// do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> io::Result<Self> {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt as _;

        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
            #[cfg(unix)]
            inode: meta.ino(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    name: String,
    stamp: FileStamp,
}

/// Durable name → document persistence.
pub struct Store {
    root: PathBuf,
    archive_dir: PathBuf,
    max_document_bytes: usize,
    cache: Arc<TtlCache<StoreKey, Arc<Document>>>,
    cache_ttl: Duration,
    /// One write lock per logical name.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Completed saves per name. A load only publishes to the cache when no
    /// save finished while it was reading.
    generations: Mutex<HashMap<String, u64>>,
}

impl Store {
    /// Open the store, creating its directories.
    ///
    /// Fails if the root is not writable or the archive directory would land
    /// outside it. Temporary files left behind by interrupted saves are
    /// removed.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = config.root.clone();
        let archive_dir = config.archive_path();

        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(&archive_dir).await?;
        probe_writable(&root).await?;

        let swept = sweep_temp_files(&root).await? + sweep_temp_files(&archive_dir).await?;
        if swept > 0 {
            info!(swept, root = %root.display(), "removed stale temporary files");
        }

        Ok(Self {
            root,
            archive_dir,
            max_document_bytes: config.max_document_bytes,
            cache: Arc::new(TtlCache::new("store", config.cache_capacity)),
            cache_ttl: config.cache_ttl(),
            locks: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Path of the file backing `name`.
    pub fn document_path(&self, name: &str) -> Result<PathBuf> {
        let stem = normalize(name)?;
        Ok(self.path_for(&stem))
    }

    /// The read cache, for registration with the reclaimer.
    pub fn reclaim_target(&self) -> Arc<dyn Reclaimable> {
        self.cache.clone()
    }

    /// Hit and miss counters of the read cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Load a document. A name that was never saved loads as an empty
    /// document; malformed content is an error, never silently empty.
    pub async fn load(&self, name: &str) -> Result<Document> {
        let stem = normalize(name)?;
        let path = self.path_for(&stem);
        let generation = self.generation(&stem);

        let Some((mut file, stamp)) = retry_once("open", &path, || open_stamped(&path)).await? else {
            record_op("load", "missing");
            return Ok(Document::new());
        };

        let key = StoreKey {
            name: stem.clone(),
            stamp,
        };
        if let Some(doc) = self.cache.get(&key) {
            record_op("load", "cached");
            return Ok((*doc).clone());
        }

        let mut bytes = Vec::with_capacity(stamp.len as usize);
        file.read_to_end(&mut bytes).await?;
        let doc = parse_document(&stem, &bytes)?;

        {
            let generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
            if generations.get(&stem).copied().unwrap_or(0) == generation {
                self.cache.set(key, Arc::new(doc.clone()), self.cache_ttl);
            }
        }
        record_op("load", "disk");
        debug!(name = %stem, bytes = bytes.len(), "document loaded");
        Ok(doc)
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Save a document, reporting success as a flag.
    ///
    /// Only an invalid name is an error; every other failure is logged and
    /// returned as `false`. A failed save never damages the previous file.
    pub async fn save(&self, name: &str, doc: &Document) -> Result<bool> {
        match self.try_save(name, doc).await {
            Ok(()) => Ok(true),
            Err(e @ Error::InvalidName(_)) => Err(e),
            Err(e) => {
                warn!(name, error = %e, "save failed");
                Ok(false)
            }
        }
    }

    /// Save a document, reporting the precise failure.
    ///
    /// A document over the size ceiling is not written. Instead the current
    /// document is archived and `Error::Oversized` returned, so the caller
    /// can shrink the document and retry.
    pub async fn try_save(&self, name: &str, doc: &Document) -> Result<()> {
        let stem = normalize(name)?;
        let path = self.path_for(&stem);
        let start = Instant::now();

        let lock = self.lock_for(&stem);
        let _guard = lock.lock().await;

        let bytes = serde_json::to_vec_pretty(doc)?;
        if bytes.len() > self.max_document_bytes {
            warn!(
                name = %stem,
                size = bytes.len(),
                limit = self.max_document_bytes,
                "document over size ceiling, archiving previous version"
            );
            match self.archive_current(&stem, &path).await {
                Ok(Some(archive)) => info!(name = %stem, archive = %archive.display(), "document archived"),
                Ok(None) => debug!(name = %stem, "nothing on disk to archive"),
                Err(e) => error!(name = %stem, error = %e, "archiving failed"),
            }
            record_op("save", "oversized");
            return Err(Error::Oversized {
                name: stem,
                size: bytes.len(),
                limit: self.max_document_bytes,
            });
        }

        if let Err(e) = retry_once("write", &path, || write_atomic(&path, &bytes)).await {
            record_op("save", "error");
            return Err(e.into());
        }

        // Write-through: entries under older stamps are unreachable, drop them
        // and cache the new document under the stamp it now has on disk. The
        // generation bump keeps loads that read the old file from publishing.
        {
            let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
            *generations.entry(stem.clone()).or_default() += 1;
            let owned = stem.clone();
            self.cache.invalidate_where(move |key| key.name == owned);
        }
        match tokio::fs::metadata(&path).await.and_then(|meta| FileStamp::of(&meta)) {
            Ok(stamp) => self.cache.set(
                StoreKey {
                    name: stem.clone(),
                    stamp,
                },
                Arc::new(doc.clone()),
                self.cache_ttl,
            ),
            Err(e) => debug!(name = %stem, error = %e, "cannot stamp saved document, cache left cold"),
        }

        record_op("save", "ok");
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "store.save")],
        );
        debug!(name = %stem, bytes = bytes.len(), "document saved");
        Ok(())
    }

    /// Replace a document with an empty one.
    pub async fn reset(&self, name: &str) -> Result<bool> {
        self.save(name, &Document::new()).await
    }

    // -----------------------------------------------------------------------
    // Archives
    // -----------------------------------------------------------------------

    /// Archive files for `name`, oldest first.
    pub async fn list_archives(&self, name: &str) -> Result<Vec<PathBuf>> {
        let stem = normalize(name)?;
        let prefix = format!("{stem}{ARCHIVE_MARKER}");

        let mut archives = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.archive_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let is_match = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(EXTENSION))
                .is_some_and(is_archive_stamp);
            if is_match {
                archives.push(entry.path());
            }
        }
        archives.sort();
        Ok(archives)
    }

    /// Copy the current on-disk document into the archive area.
    ///
    /// Returns `None` when there is no current document.
    async fn archive_current(&self, stem: &str, path: &Path) -> Result<Option<PathBuf>> {
        let bytes = match retry_once("read", path, || tokio::fs::read(path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut archive = self
            .archive_dir
            .join(format!("{stem}{ARCHIVE_MARKER}{timestamp}{EXTENSION}"));
        let mut suffix = 1;
        // Archives are never overwritten.
        while tokio::fs::try_exists(&archive).await? {
            archive = self
                .archive_dir
                .join(format!("{stem}{ARCHIVE_MARKER}{timestamp}_{suffix}{EXTENSION}"));
            suffix += 1;
        }

        write_atomic(&archive, &bytes).await?;
        Ok(Some(archive))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn path_for(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}{EXTENSION}"))
    }

    fn generation(&self, stem: &str) -> u64 {
        let generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        generations.get(stem).copied().unwrap_or(0)
    }

    fn lock_for(&self, stem: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(stem.to_string()).or_default().clone()
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Validate a logical name and strip an optional `.json` extension.
///
/// Names are single path components under the root: no separators, no
/// `..`, no leading dot.
fn normalize(name: &str) -> Result<String> {
    let stem = name.strip_suffix(EXTENSION).unwrap_or(name);
    let invalid = stem.is_empty()
        || stem.starts_with('.')
        || stem.contains("..")
        || stem.contains(['/', '\\', ':', '\0']);
    if invalid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(stem.to_string())
}

/// Matches `YYYYMMDD_HHMMSS` with an optional `_N` collision suffix.
fn is_archive_stamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 15 || bytes[8] != b'_' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    if !digits(0..8) || !digits(9..15) {
        return false;
    }
    match &s[15..] {
        "" => true,
        rest => rest
            .strip_prefix('_')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
    }
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

fn parse_document(name: &str, bytes: &[u8]) -> Result<Document> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::new());
    }
    serde_json::from_slice(bytes).map_err(|source| Error::Corrupt {
        name: name.to_string(),
        source,
    })
}

async fn open_stamped(path: &Path) -> io::Result<Option<(tokio::fs::File, FileStamp)>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let stamp = FileStamp::of(&file.metadata().await?)?;
    Ok(Some((file, stamp)))
}

/// Write `bytes` to a temporary sibling of `path`, then rename it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    // The rename already happened; a failed directory sync only weakens
    // durability across power loss.
    if let Err(e) = sync_parent_dir(path).await {
        debug!(path = %path.display(), error = %e, "directory sync failed");
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}{TEMP_EXTENSION}", Uuid::new_v4()))
}

#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => tokio::fs::File::open(dir).await?.sync_all().await,
        None => Ok(()),
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

async fn probe_writable(root: &Path) -> Result<()> {
    let probe = root.join(format!(".probe-{}{TEMP_EXTENSION}", Uuid::new_v4()));
    let written = tokio::fs::write(&probe, b"{}").await;
    let _ = tokio::fs::remove_file(&probe).await;
    written.map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("store root {} is not writable: {e}", root.display()),
        ))
    })
}

/// Remove temporary files left by saves that never reached their rename.
async fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let mut swept = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(TEMP_EXTENSION));
        if is_temp && entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            swept += 1;
        }
    }
    Ok(swept)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::PermissionDenied
    )
}

/// Run `op`, retrying exactly once after a short pause on a transient error.
async fn retry_once<T, F, Fut>(what: &str, path: &Path, mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    match op().await {
        Err(e) if is_transient(&e) => {
            warn!(op = what, path = %path.display(), error = %e, "transient io error, retrying once");
            tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

fn record_op(operation: &'static str, result: &'static str) {
    metrics::store_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}

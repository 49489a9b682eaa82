use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CacheContents, CacheError};

/// Prefix of in-progress artifact files. These are never published.
const TEMP_PREFIX: &str = ".tmp";

/// Public route under which the artifact files are served.
const FILES_ROUTE: &str = "/files/";

/// The one cached artifact.
///
/// An entry is immutable. A refill publishes a completely new entry, pointing to a new file,
/// so the file name and the timestamp always belong to the same refill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    file_name: String,
    path: PathBuf,
    cached_at: DateTime<Utc>,
    size: u64,
}

impl CacheEntry {
    /// Name of the artifact file inside the image directory.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Absolute path of the artifact file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the refill that produced this entry completed.
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Size of the artifact in bytes. Never zero.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The metadata exposed to HTTP clients.
    pub fn view(&self) -> CacheEntryView {
        CacheEntryView {
            path: format!("{FILES_ROUTE}{}", self.file_name),
            cached_at: self.cached_at,
        }
    }
}

/// Serializable metadata of a [`CacheEntry`], as returned by `GET /api/image/current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryView {
    /// Path of the artifact relative to the image API.
    pub path: String,
    /// Time of the refill that produced the artifact.
    pub cached_at: DateTime<Utc>,
}

/// Holds the single published artifact and its backing file.
///
/// Artifacts are written to a temporary file first, renamed to a fresh name within the image
/// directory and only then published. Readers never see a partially written file, and a
/// failed write leaves the previously published entry and its file untouched.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    /// The configured file name, as written by earlier deployments.
    configured_name: String,
    stem: String,
    extension: Option<String>,
    current: Mutex<Option<Arc<CacheEntry>>>,
}

impl ArtifactStore {
    /// Opens the store in `dir`, creating the directory if needed.
    ///
    /// Left-over temporary files are removed and the newest artifact found in the directory is
    /// adopted as the current entry, with its modification time as `cached_at`. Older
    /// artifacts are removed.
    ///
    /// The name must have a non-empty stem and must not start with the temporary file prefix.
    pub fn open(dir: impl Into<PathBuf>, cached_image_name: &str) -> io::Result<Self> {
        if cached_image_name.starts_with(TEMP_PREFIX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cached image name must not start with `{TEMP_PREFIX}`"),
            ));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir = dir.canonicalize()?;

        let name = Path::new(cached_image_name);
        let stem = name
            .file_stem()
            .and_then(OsStr::to_str)
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid cached image name `{cached_image_name}`"),
                )
            })?
            .to_owned();
        let extension = name.extension().and_then(OsStr::to_str).map(str::to_owned);

        let store = Self {
            dir,
            configured_name: cached_image_name.to_owned(),
            stem,
            extension,
            current: Mutex::new(None),
        };

        let recovered = store.recover()?;
        if let Some(ref entry) = recovered {
            tracing::info!(
                path = %entry.path.display(),
                cached_at = %entry.cached_at,
                "Recovered cached artifact"
            );
        }
        *store.current.lock().unwrap() = recovered.map(Arc::new);

        Ok(store)
    }

    /// The directory holding the artifact files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the currently published entry, if any.
    pub fn read(&self) -> Option<Arc<CacheEntry>> {
        self.current.lock().unwrap().clone()
    }

    /// Reads the bytes backing `entry`.
    pub fn load(&self, entry: &CacheEntry) -> io::Result<Vec<u8>> {
        fs::read(&entry.path)
    }

    /// Writes `bytes` as the new artifact and publishes it with `cached_at = now`.
    ///
    /// The file of the previously published entry is removed after the new one is published.
    pub fn write(&self, bytes: &[u8], now: DateTime<Utc>) -> CacheContents<Arc<CacheEntry>> {
        if bytes.is_empty() {
            return Err(CacheError::StoreFailed(
                "refusing to publish an empty artifact".into(),
            ));
        }

        let file_name = self.fresh_file_name();
        let path = self.dir.join(&file_name);
        self.persist(bytes, now, &path)
            .map_err(CacheError::store_failed)?;

        let entry = Arc::new(CacheEntry {
            file_name,
            path,
            cached_at: now,
            size: bytes.len() as u64,
        });

        let previous = self.current.lock().unwrap().replace(Arc::clone(&entry));

        tracing::debug!(path = %entry.path.display(), "Published new artifact");

        if let Some(previous) = previous {
            remove_file(&previous.path);
        }

        Ok(entry)
    }

    fn persist(&self, bytes: &[u8], now: DateTime<Utc>, path: &Path) -> io::Result<()> {
        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        temp_file.write_all(bytes)?;
        temp_file.as_file().sync_all()?;

        let mtime = FileTime::from_system_time(SystemTime::from(now));
        filetime::set_file_mtime(temp_file.path(), mtime)?;

        temp_file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn fresh_file_name(&self) -> String {
        let id = Uuid::new_v4().simple();
        match self.extension {
            Some(ref ext) => format!("{}-{id}.{ext}", self.stem),
            None => format!("{}-{id}", self.stem),
        }
    }

    /// Whether `name` is an artifact file produced by this store, or by an earlier deployment.
    fn is_artifact_name(&self, name: &str) -> bool {
        if name == self.configured_name {
            return true;
        }

        let Some(rest) = name
            .strip_prefix(self.stem.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return false;
        };

        let id = match self.extension {
            Some(ref ext) => match rest
                .strip_suffix(ext.as_str())
                .and_then(|rest| rest.strip_suffix('.'))
            {
                Some(id) => id,
                None => return false,
            },
            None => rest,
        };

        id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
    }

    fn recover(&self) -> io::Result<Option<CacheEntry>> {
        let mut newest: Option<CacheEntry> = None;

        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let Ok(file_name) = dir_entry.file_name().into_string() else {
                continue;
            };
            let path = dir_entry.path();

            if file_name.starts_with(TEMP_PREFIX) {
                tracing::debug!(path = %path.display(), "Removing left-over temporary file");
                remove_file(&path);
                continue;
            }

            if !self.is_artifact_name(&file_name) {
                continue;
            }

            let metadata = dir_entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            if metadata.len() == 0 {
                remove_file(&path);
                continue;
            }

            let candidate = CacheEntry {
                file_name,
                path,
                cached_at: DateTime::<Utc>::from(metadata.modified()?),
                size: metadata.len(),
            };

            match newest {
                Some(ref current) if current.cached_at >= candidate.cached_at => {
                    remove_file(&candidate.path);
                }
                _ => {
                    if let Some(outdated) = newest.replace(candidate) {
                        remove_file(&outdated.path);
                    }
                }
            }
        }

        Ok(newest)
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        // `NotFound` errors are no cause for concern, someone else already cleaned up.
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to remove artifact file"
            );
        }
    }
}

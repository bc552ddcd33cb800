use crate::{BatchSink, Error, Result};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use telemetry::Sample;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const FILE_PREFIX: &str = "data_";
const FILE_EXT: &str = "jsonl";
const ARCHIVE_DIR: &str = "archive";

/// The local fallback sink: one serialized Sample per line, appended to a
/// daily `data_YYYYMMDD.jsonl` file. File names sort lexicographically into
/// chronological order, which is what the recovery worker relies on.
pub struct FallbackSink {
    data_dir: PathBuf,
    archive_dir: PathBuf,
    // Serializes appends and caches the current day's handle. This is the
    // one lock in the agent held across I/O: append atomicity within the
    // process requires it.
    current: tokio::sync::Mutex<Option<DayFile>>,
}

struct DayFile {
    date: NaiveDate,
    file: tokio::fs::File,
}

impl FallbackSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let archive_dir = data_dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;
        Ok(Self {
            data_dir,
            archive_dir,
            current: tokio::sync::Mutex::new(None),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Pending fallback files, sorted chronologically by file name.
    pub async fn list_pending(&self) -> Result<Vec<PathBuf>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if file_date(name).is_some() && entry.file_type().await?.is_file() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| self.data_dir.join(name))
            .collect())
    }

    /// Reads every well-formed Sample from `path`. Malformed lines are
    /// skipped with a warning rather than aborting the read; a fully corrupt
    /// file therefore yields an empty Vec.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<Sample>> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut samples = Vec::new();
        let mut skipped = 0usize;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Sample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(?err, path = %path.display(), line = line_no, "skipping malformed fallback record");
                }
            }
        }
        if skipped > 0 {
            tracing::warn!(path = %path.display(), skipped, read = samples.len(), "fallback file had malformed records");
        }
        Ok(samples)
    }

    /// Atomically moves `path` into the archive directory. A name collision
    /// is uniquified by suffixing the current UTC time-of-day before the
    /// extension.
    pub async fn archive(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Io(std::io::Error::other("fallback path has no file name")))?;

        let mut target = self.archive_dir.join(name);
        if tokio::fs::try_exists(&target).await? {
            let stem = name.strip_suffix(&format!(".{FILE_EXT}")).unwrap_or(name);
            target = self
                .archive_dir
                .join(format!("{stem}_{}.{FILE_EXT}", Utc::now().format("%H%M%S")));
        }

        // Drop the cached handle if it points at the file being renamed, so
        // later appends reopen under the pending path instead of following
        // the moved inode into the archive.
        {
            let mut current = self.current.lock().await;
            if let Some(day) = current.as_ref() {
                if self.data_dir.join(file_name(day.date)) == path {
                    *current = None;
                }
            }
        }

        tokio::fs::rename(path, &target).await?;
        tracing::info!(from = %path.display(), to = %target.display(), "archived fallback file");
        Ok(target)
    }

    /// Verifies the data directory is writable by creating and deleting a
    /// probe file.
    pub async fn health_check(&self) -> Result<()> {
        let probe = self.data_dir.join(".fieldgate_probe");
        tokio::fs::write(&probe, b"probe").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }

    /// Deletes archived files whose date is older than `retention_days`.
    /// Zero disables pruning. Returns the number of files removed.
    pub async fn prune_archive(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(retention_days));
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.archive_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = file_date(name) else { continue };
            if date < cutoff {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, retention_days, "pruned expired archive files");
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl BatchSink for FallbackSink {
    async fn write(&self, batch: &[Sample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(batch.len() * 256);
        for sample in batch {
            serde_json::to_writer(&mut buf, sample).map_err(Error::Encode)?;
            buf.push(b'\n');
        }

        // The file name is derived from the UTC date at the moment of the
        // write call; a cached handle is reused within the same day.
        let today = Utc::now().date_naive();
        let mut current = self.current.lock().await;
        if current.as_ref().map(|day| day.date) != Some(today) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.data_dir.join(file_name(today)))
                .await?;
            *current = Some(DayFile { date: today, file });
        }
        if let Some(day) = current.as_mut() {
            day.file.write_all(&buf).await?;
            day.file.flush().await?;
        }
        Ok(())
    }
}

fn file_name(date: NaiveDate) -> String {
    format!("{FILE_PREFIX}{}.{FILE_EXT}", date.format("%Y%m%d"))
}

/// Parses the date out of a `data_YYYYMMDD*.jsonl` file name; None for
/// anything else (probe files, stray content).
fn file_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    if !name.ends_with(&format!(".{FILE_EXT}")) || rest.len() < 8 {
        return None;
    }
    NaiveDate::parse_from_str(&rest[..8], "%Y%m%d").ok()
}

//! Append-only NDJSON files and the byte-offset paginated reader used to
//! serve them while a scan is still writing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn findings_path(data_dir: &Path, scan_id: &str) -> PathBuf {
    data_dir.join("scans").join(format!("{scan_id}.findings.ndjson"))
}

/// Canonical probes stream path (errors always, all probes when verbose).
pub fn log_path(data_dir: &Path, scan_id: &str) -> PathBuf {
    data_dir.join("scans").join(format!("{scan_id}.probes.ndjson"))
}

/// Legacy-only: older scans wrote a dedicated errors file. Never written anymore.
pub fn errors_path(data_dir: &Path, scan_id: &str) -> PathBuf {
    data_dir.join("scans").join(format!("{scan_id}.errors.ndjson"))
}

/// Appends one JSON record per line. Each record is serialized up front and
/// written in a single call under the mutex, so concurrent paginated readers
/// only ever see whole lines. No buffering: every record is durable once
/// `write` returns.
pub struct NdjsonWriter {
    file: Mutex<Option<File>>,
}

impl NdjsonWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self { file: Mutex::new(Some(file)) })
    }

    pub fn write<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.as_mut() {
            file.write_all(&line)?;
        }
        Ok(())
    }

    /// Release the file handle; later writes become no-ops.
    pub fn close(&self) {
        *self.file.lock().unwrap() = None;
    }
}

/// One page of records plus the cursor for the next call.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: i64,
}

pub const DEFAULT_PAGE_LIMIT: usize = 200;
pub const MAX_PAGE_LIMIT: usize = 2000;

pub fn read_page<T: DeserializeOwned>(path: &Path, cursor: i64, limit: usize) -> Result<Page<T>> {
    read_page_filtered(path, cursor, limit, |_| true)
}

/// Read up to `limit` whole lines starting at byte offset `cursor`. A cursor
/// landing mid-line discards the remainder of that line first. Lines failing
/// the `keep` predicate are skipped without consuming a limit slot; their
/// bytes still advance the cursor.
pub fn read_page_filtered<T, F>(path: &Path, cursor: i64, limit: usize, keep: F) -> Result<Page<T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let limit = match limit {
        0 => DEFAULT_PAGE_LIMIT,
        n => n.min(MAX_PAGE_LIMIT),
    };
    let mut cursor = cursor.max(0);

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Page { items: Vec::new(), next_cursor: cursor });
        }
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };

    let size = file.metadata()?.len() as i64;
    if cursor > size {
        cursor = size;
    }

    // Detect whether the cursor already sits at a line boundary.
    let mut at_line_start = cursor == 0;
    if cursor > 0 {
        file.seek(SeekFrom::Start((cursor - 1) as u64))?;
        let mut prev = [0u8; 1];
        file.read_exact(&mut prev)?;
        if prev[0] == b'\n' {
            at_line_start = true;
        }
    }

    file.seek(SeekFrom::Start(cursor as u64))?;
    let mut reader = BufReader::new(file);
    let mut cur = cursor;

    if !at_line_start {
        let mut junk = Vec::new();
        let n = reader.read_until(b'\n', &mut junk)?;
        cur += n as i64;
        if !junk.ends_with(b"\n") {
            // Partial tail with no newline yet: nothing complete to return.
            return Ok(Page { items: Vec::new(), next_cursor: cur });
        }
    }

    let mut items = Vec::new();
    let mut line = Vec::new();
    while items.len() < limit {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        cur += n as i64;
        if let Ok(record) = serde_json::from_slice::<T>(&line) {
            if keep(&record) {
                items.push(record);
            }
        }
        if !line.ends_with(b"\n") {
            break;
        }
    }

    Ok(Page { items, next_cursor: cur })
}

//! Filesystem-backed collaborators: wordlist blobs, scan metadata, and the
//! NDJSON recorders the engine writes through.

mod scans;
mod wordlists;

pub use scans::{ScanRepo, ScanStore};
pub use wordlists::WordlistStore;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Write JSON through a temp file and rename it into place so readers never
/// observe a partial file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;

    if let Err(first) = fs::rename(&tmp, path) {
        // Windows refuses to rename over an existing file.
        #[cfg(windows)]
        {
            let _ = fs::remove_file(path);
            let retried = fs::rename(&tmp, path);
            if retried.is_err() {
                let _ = fs::remove_file(&tmp);
            }
            return retried.with_context(|| format!("rename {} into place", tmp.display()));
        }
        #[cfg(not(windows))]
        {
            let _ = fs::remove_file(&tmp);
            return Err(first).with_context(|| format!("rename {} into place", tmp.display()));
        }
    }
    Ok(())
}

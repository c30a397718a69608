use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use sha2::{Digest, Sha256};

use crate::scanner::WordlistSource;
use crate::types::{now_rfc3339, WordlistMeta};
use super::write_json_atomic;

/// Content-addressed wordlist storage: `<dir>/<sha256>.txt` for the raw
/// content plus `<dir>/<sha256>.json` for metadata.
pub struct WordlistStore {
    dir: PathBuf,
}

impl WordlistStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create wordlist dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn content_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.txt"))
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Store raw wordlist bytes. The id is the sha-256 of the content, so
    /// re-uploading identical bytes yields the same id and rewrites nothing.
    /// Returns (id, size).
    pub fn put(&self, name: &str, content: &[u8]) -> Result<(String, u64)> {
        let id = hex::encode(Sha256::digest(content));
        let final_path = self.content_path(&id);
        let size = content.len() as u64;

        if !final_path.exists() {
            let tmp = self.dir.join(format!("upload-{:08x}.tmp", rand::random::<u32>()));
            fs::write(&tmp, content).with_context(|| format!("write {}", tmp.display()))?;
            if let Err(err) = fs::rename(&tmp, &final_path) {
                let _ = fs::remove_file(&tmp);
                return Err(err).context("store wordlist content");
            }
        }

        self.upsert_meta(&id, name, size)?;
        Ok((id, size))
    }

    fn upsert_meta(&self, id: &str, name: &str, bytes: u64) -> Result<()> {
        let name = name.trim();
        let name = if name.is_empty() {
            format!("{}.txt", &id[..12])
        } else {
            name.to_string()
        };

        let mut meta = self.read_meta(id).unwrap_or_default();
        if meta.id.is_empty() {
            meta = WordlistMeta {
                id: id.to_string(),
                names: vec![name],
                bytes,
                uploaded_at: now_rfc3339(),
            };
        } else {
            meta.bytes = bytes;
            if !meta.names.iter().any(|n| n == &name) {
                meta.names.insert(0, name);
                meta.names.truncate(5);
            }
        }

        write_json_atomic(&self.meta_path(id), &meta)
    }

    pub fn read_meta(&self, id: &str) -> Result<WordlistMeta> {
        let raw = fs::read(self.meta_path(id))
            .with_context(|| format!("read wordlist meta {id}"))?;
        let meta: WordlistMeta = serde_json::from_slice(&raw)?;
        ensure!(!meta.id.is_empty(), "missing id in wordlist meta");
        Ok(meta)
    }

    pub fn list(&self) -> Result<Vec<WordlistMeta>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).context("list wordlist dir")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read(&path) else { continue };
            let Ok(meta) = serde_json::from_slice::<WordlistMeta>(&raw) else { continue };
            if meta.id.is_empty() {
                continue;
            }
            out.push(meta);
        }
        out.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut removed = false;
        for path in [self.content_path(id), self.meta_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("delete {}", path.display()))
                }
            }
        }
        Ok(removed)
    }

    /// Wordlist normalization: trim whitespace, drop empty lines, prefix a
    /// missing leading `/`, and dedupe keeping first occurrence order.
    pub fn read_lines(&self, id: &str) -> Result<Vec<String>> {
        let file = File::open(self.content_path(id))
            .with_context(|| format!("open wordlist {id}"))?;
        let reader = BufReader::new(file);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let line = if line.starts_with('/') {
                line.to_string()
            } else {
                format!("/{line}")
            };
            if seen.insert(line.clone()) {
                out.push(line);
            }
        }
        Ok(out)
    }
}

impl WordlistSource for WordlistStore {
    fn lines(&self, wordlist_id: &str) -> Result<Vec<String>> {
        self.read_lines(wordlist_id)
    }

    fn meta(&self, wordlist_id: &str) -> Result<WordlistMeta> {
        self.read_meta(wordlist_id)
    }
}

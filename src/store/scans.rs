use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::ndjson::{self, NdjsonWriter, Page};
use crate::scanner::{Recorder, ScanSink};
use crate::types::{Finding, Meta, Probe};
use super::write_json_atomic;

/// Scan metadata persistence: one `<id>.json` per scan, written atomically.
pub struct ScanStore {
    dir: PathBuf,
}

impl ScanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create scan dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn write_meta(&self, id: &str, meta: &Meta) -> Result<()> {
        write_json_atomic(&self.meta_path(id), meta)
    }

    /// `Ok(None)` when no meta exists for the id.
    pub fn read_meta(&self, id: &str) -> Result<Option<Meta>> {
        let raw = match fs::read(self.meta_path(id)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read scan meta {id}")),
        };
        let meta = serde_json::from_slice(&raw).with_context(|| format!("parse scan meta {id}"))?;
        Ok(Some(meta))
    }

    /// All stored scan metas, newest first.
    pub fn list(&self) -> Result<Vec<Meta>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).context("list scan dir")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read(&path) else { continue };
            let Ok(meta) = serde_json::from_slice::<Meta>(&raw) else { continue };
            if meta.id.is_empty() {
                continue;
            }
            out.push(meta);
        }
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }
}

/// Filesystem implementation of the engine's scan persistence plus the
/// paginated read side used by the query API.
pub struct ScanRepo {
    data_dir: PathBuf,
    scans: ScanStore,
}

impl ScanRepo {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let scans = ScanStore::new(data_dir.join("scans"))?;
        Ok(Self { data_dir, scans })
    }

    pub fn scans(&self) -> &ScanStore {
        &self.scans
    }

    pub fn read_meta(&self, scan_id: &str) -> Result<Option<Meta>> {
        self.scans.read_meta(scan_id)
    }

    pub fn list(&self) -> Result<Vec<Meta>> {
        self.scans.list()
    }

    pub fn findings_path(&self, scan_id: &str) -> PathBuf {
        ndjson::findings_path(&self.data_dir, scan_id)
    }

    fn default_probe_path(&self, scan_id: &str) -> PathBuf {
        ndjson::log_path(&self.data_dir, scan_id)
    }

    fn legacy_errors_path(&self, scan_id: &str) -> PathBuf {
        ndjson::errors_path(&self.data_dir, scan_id)
    }

    /// Accept a probe-log path from meta only when it stays inside the scans
    /// directory.
    fn safe_scan_file(&self, candidate: &str) -> Option<PathBuf> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }
        let candidate = PathBuf::from(candidate);
        if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
            return None;
        }
        let base = self.data_dir.join("scans");
        if candidate == base {
            return None;
        }
        candidate.starts_with(&base).then_some(candidate)
    }

    fn probe_path_for_scan(&self, scan_id: &str) -> PathBuf {
        if let Ok(Some(meta)) = self.scans.read_meta(scan_id) {
            if let Some(path) = self.safe_scan_file(&meta.log_file) {
                return path;
            }
        }
        self.default_probe_path(scan_id)
    }

    pub fn findings_page(&self, scan_id: &str, cursor: i64, limit: usize) -> Result<Page<Finding>> {
        ndjson::read_page(&self.findings_path(scan_id), cursor, limit)
    }

    /// Errors for a scan: the legacy dedicated errors file when one exists
    /// (older scans), otherwise the probes log filtered to records carrying
    /// an error. New scans never write the legacy file.
    pub fn errors_page(&self, scan_id: &str, cursor: i64, limit: usize) -> Result<Page<Probe>> {
        let legacy = self.legacy_errors_path(scan_id);
        if legacy.exists() {
            return ndjson::read_page(&legacy, cursor, limit);
        }
        ndjson::read_page_filtered(&self.probe_path_for_scan(scan_id), cursor, limit, |p: &Probe| {
            !p.error.trim().is_empty()
        })
    }

    pub fn log_page(&self, scan_id: &str, cursor: i64, limit: usize) -> Result<Page<Probe>> {
        ndjson::read_page(&self.probe_path_for_scan(scan_id), cursor, limit)
    }
}

impl ScanSink for ScanRepo {
    fn write_meta(&self, scan_id: &str, meta: &Meta) -> Result<()> {
        self.scans.write_meta(scan_id, meta)
    }

    fn open_recorder(&self, scan_id: &str, _verbose: bool) -> Result<Arc<dyn Recorder>> {
        let probe_path = self.default_probe_path(scan_id);
        let findings = NdjsonWriter::create(&self.findings_path(scan_id))?;
        let probes = NdjsonWriter::create(&probe_path)?;
        Ok(Arc::new(FsRecorder { probe_path, findings, probes }))
    }
}

struct FsRecorder {
    probe_path: PathBuf,
    findings: NdjsonWriter,
    probes: NdjsonWriter,
}

impl Recorder for FsRecorder {
    fn write_finding(&self, finding: &Finding) -> Result<()> {
        self.findings.write(finding)
    }

    fn write_probe(&self, probe: &Probe) -> Result<()> {
        self.probes.write(probe)
    }

    fn probe_path(&self) -> String {
        self.probe_path.display().to_string()
    }

    fn close(&self) {
        self.findings.close();
        self.probes.close();
    }
}

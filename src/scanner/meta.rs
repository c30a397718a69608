//! Scan meta lifecycle: construction, external status application, and the
//! dirty-flag flush controller. Meta has exactly one writer (the scan loop).

use std::sync::Arc;

use crate::types::{HostStatus, Meta, ScanStatus, StartRequest};
use super::ScanSink;

pub(crate) fn init_meta(
    scan_id: &str,
    started_at: &str,
    req: &StartRequest,
    total_paths: usize,
    wordlist_names: Vec<String>,
    log_file: &str,
) -> Meta {
    Meta {
        id: scan_id.to_string(),
        started_at: started_at.to_string(),
        targets: req.targets.clone(),
        wordlist_id: req.wordlist_id.clone(),
        wordlist_names,
        total_paths,
        concurrency: req.concurrency,
        timeout_ms: req.timeout_ms,
        rate_limit: req.rate_limit,
        tags: req.tags.clone(),
        verbose: req.verbose,
        log_file: log_file.to_string(),
        proxy: req.proxy.clone(),
        total_requests: total_paths as i64 * req.targets.len() as i64,
        status: ScanStatus::Running,
        ..Default::default()
    }
}

/// Apply an externally requested status, propagating to non-terminal hosts:
/// pause and resume toggle running hosts, stop overrides everything that is
/// not already completed or errored.
pub(crate) fn apply_scan_status(meta: &mut Meta, status: ScanStatus) {
    meta.status = status;

    for host in meta.hosts.values_mut() {
        if matches!(host.status, HostStatus::Completed | HostStatus::Error) {
            continue;
        }
        match status {
            ScanStatus::Paused => {
                if host.status == HostStatus::Running {
                    host.status = HostStatus::Paused;
                }
            }
            ScanStatus::Running => {
                if host.status == HostStatus::Paused {
                    host.status = HostStatus::Running;
                }
            }
            ScanStatus::Stopped => host.status = HostStatus::Stopped,
            _ => {}
        }
    }
}

/// Tracks whether the in-memory meta has diverged from disk and flushes it
/// through the sink. A failed write keeps the meta dirty so the next tick
/// retries.
pub(crate) struct MetaController {
    sink: Arc<dyn ScanSink>,
    scan_id: String,
    dirty: bool,
}

impl MetaController {
    pub fn new(sink: Arc<dyn ScanSink>, scan_id: &str) -> Self {
        Self { sink, scan_id: scan_id.to_string(), dirty: false }
    }

    pub fn mark(&mut self) {
        self.dirty = true;
    }

    pub fn flush(&mut self, meta: &Meta, force: bool) {
        if !force && !self.dirty {
            return;
        }
        match self.sink.write_meta(&self.scan_id, meta) {
            Ok(()) => self.dirty = false,
            Err(err) => {
                tracing::warn!(scan = %self.scan_id, error = %err, "meta flush failed, will retry");
            }
        }
    }
}

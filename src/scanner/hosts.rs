//! Per-target host configuration and the per-host concurrency cap.

use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::types::{now_rfc3339, HostMeta, HostProgressMsg, HostStartedMsg, HostStatus, Meta};
use super::meta::MetaController;
use super::soft404::Soft404Sig;
use super::Engine;

pub struct HostCfg {
    pub target: String,
    pub base: Url,
    /// Bounds in-flight requests against this one target.
    pub sem: Semaphore,
    pub total: i64,
    /// Set once by the baseline phase; absent means "matches nothing".
    pub soft404: OnceLock<Soft404Sig>,
}

impl HostCfg {
    pub fn soft404_matches(&self, status: u16, length: i64) -> bool {
        self.soft404.get().is_some_and(|sig| sig.matches(status, length))
    }
}

/// A single target gets the full worker count; otherwise workers are spread
/// across targets, rounding up.
pub fn per_host_cap_for(workers: usize, targets: usize) -> usize {
    let workers = workers.max(1);
    let targets = targets.max(1);
    if targets == 1 {
        return workers;
    }
    ((workers + targets - 1) / targets).max(1)
}

pub fn sanitize_workers(n: usize) -> usize {
    n.max(1)
}

/// Parse each target into a host config. Targets that do not parse into an
/// absolute URL with a host are recorded with status `error` and a one-shot
/// 100% progress emit so UIs settle, and are excluded from the worker set.
pub(crate) fn build_hosts(
    engine: &Engine,
    cancel: &CancellationToken,
    scan_id: &str,
    targets: &[String],
    total_paths: usize,
    per_host_cap: usize,
    meta: &mut Meta,
    ctl: &mut MetaController,
) -> Vec<Arc<HostCfg>> {
    let mut hosts = Vec::with_capacity(targets.len());
    let total = total_paths as i64;

    for raw in targets {
        let target = raw.trim().to_string();
        engine.emit(
            "host_started",
            &HostStartedMsg { scan_id: scan_id.to_string(), target: target.clone(), total },
        );

        if cancel.is_cancelled() {
            break;
        }

        let base = Url::parse(&target)
            .ok()
            .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()));

        let Some(base) = base else {
            engine.emit(
                "host_progress",
                &HostProgressMsg {
                    scan_id: scan_id.to_string(),
                    target: target.clone(),
                    percent: 100,
                    rate_rps: 0,
                    checked: total,
                    total,
                    errors: 0,
                },
            );

            let now = now_rfc3339();
            meta.hosts.insert(
                target.clone(),
                HostMeta {
                    target: target.clone(),
                    status: HostStatus::Error,
                    checked: total,
                    total,
                    findings: 0,
                    errors: 0,
                    started_at: now.clone(),
                    finished_at: now,
                },
            );
            ctl.mark();
            continue;
        };

        hosts.push(Arc::new(HostCfg {
            target: target.clone(),
            base,
            sem: Semaphore::new(per_host_cap),
            total,
            soft404: OnceLock::new(),
        }));

        meta.hosts.insert(
            target.clone(),
            HostMeta {
                target: target.clone(),
                status: HostStatus::Running,
                checked: 0,
                total,
                findings: 0,
                errors: 0,
                started_at: now_rfc3339(),
                finished_at: String::new(),
            },
        );
        ctl.mark();
    }

    hosts
}

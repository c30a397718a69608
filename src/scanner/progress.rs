//! Per-host progress aggregation with throttled emission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{now_rfc3339, HostProgressMsg, HostStatus, Meta};
use super::hosts::HostCfg;
use super::meta::MetaController;
use super::Engine;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) struct HostAgg {
    pub done: i64,
    pub last_done: i64,
    pub last_t: Instant,
    pub findings: i64,
    pub errs: i64,
    pub finished: bool,
}

impl HostAgg {
    pub fn new() -> Self {
        Self {
            done: 0,
            last_done: 0,
            last_t: Instant::now(),
            findings: 0,
            errs: 0,
            finished: false,
        }
    }
}

/// Emit at most one progress message per host per 500 ms, except that host
/// completion always emits. Rate is the delta since the last emission.
pub(crate) fn maybe_emit_progress(
    scan_id: &str,
    host: &HostCfg,
    agg: &mut HostAgg,
    now: Instant,
) -> Option<HostProgressMsg> {
    let done = agg.done;
    let total = host.total;

    if now.duration_since(agg.last_t) < PROGRESS_INTERVAL && done != total {
        return None;
    }

    let delta = done - agg.last_done;
    let secs = now.duration_since(agg.last_t).as_secs_f64();
    let rate_rps = if secs > 0.0 { (delta as f64 / secs) as i64 } else { 0 };
    let percent = if total > 0 { done * 100 / total } else { 0 };

    let msg = HostProgressMsg {
        scan_id: scan_id.to_string(),
        target: host.target.clone(),
        percent,
        rate_rps,
        checked: done,
        total,
        errors: agg.errs,
    };

    agg.last_done = done;
    agg.last_t = now;
    Some(msg)
}

/// When a scan is cancelled before hosts complete, every unfinished host gets
/// a final zero-rate progress emit and a `stopped` meta entry with its
/// finish time.
pub(crate) fn finalize_stopped_hosts(
    engine: &Engine,
    scan_id: &str,
    hosts: &[Arc<HostCfg>],
    aggs: &mut HashMap<String, HostAgg>,
    meta: &mut Meta,
    total_findings: i64,
    total_errors: i64,
    ctl: &mut MetaController,
) {
    let now = now_rfc3339();
    for host in hosts {
        let Some(agg) = aggs.get_mut(&host.target) else { continue };
        if agg.finished {
            continue;
        }
        agg.finished = true;

        let checked = agg.done;
        let total = host.total;
        let percent = if total > 0 { checked * 100 / total } else { 0 };

        engine.emit(
            "host_progress",
            &HostProgressMsg {
                scan_id: scan_id.to_string(),
                target: host.target.clone(),
                percent,
                rate_rps: 0,
                checked,
                total,
                errors: agg.errs,
            },
        );

        if let Some(hm) = meta.hosts.get_mut(&host.target) {
            hm.status = HostStatus::Stopped;
            hm.checked = checked;
            hm.total = total;
            hm.findings = agg.findings;
            hm.errors = agg.errs;
            hm.finished_at = now.clone();
        }
        meta.total_findings = total_findings;
        meta.total_errors = total_errors;
        ctl.mark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tokio::sync::Semaphore;
    use url::Url;

    fn host(total: i64) -> HostCfg {
        HostCfg {
            target: "http://h".into(),
            base: Url::parse("http://h").unwrap(),
            sem: Semaphore::new(1),
            total,
            soft404: OnceLock::new(),
        }
    }

    #[test]
    fn emission_is_throttled_between_intervals() {
        let h = host(100);
        let mut agg = HostAgg::new();
        agg.done = 10;

        // Just created: last_t is now, so nothing should emit yet.
        assert!(maybe_emit_progress("s", &h, &mut agg, Instant::now()).is_none());

        // Pretend half a second passed.
        let later = agg.last_t + Duration::from_millis(600);
        let msg = maybe_emit_progress("s", &h, &mut agg, later).expect("should emit");
        assert_eq!(msg.checked, 10);
        assert_eq!(msg.percent, 10);
        assert!(msg.rate_rps > 0);

        // Counters reset on emit.
        assert_eq!(agg.last_done, 10);
        assert!(maybe_emit_progress("s", &h, &mut agg, later).is_none());
    }

    #[test]
    fn completion_forces_emission() {
        let h = host(10);
        let mut agg = HostAgg::new();
        agg.done = 10;

        let msg = maybe_emit_progress("s", &h, &mut agg, Instant::now()).expect("completion emits");
        assert_eq!(msg.percent, 100);
        assert_eq!(msg.checked, 10);
    }

    #[test]
    fn percent_is_integer_floor() {
        let h = host(3);
        let mut agg = HostAgg::new();
        agg.done = 1;
        let later = agg.last_t + Duration::from_secs(1);
        let msg = maybe_emit_progress("s", &h, &mut agg, later).unwrap();
        assert_eq!(msg.percent, 33);
    }

    #[test]
    fn zero_total_emits_zero_percent() {
        let h = host(0);
        let mut agg = HostAgg::new();
        let msg = maybe_emit_progress("s", &h, &mut agg, Instant::now()).unwrap();
        assert_eq!(msg.percent, 0);
        assert_eq!(msg.total, 0);
    }
}

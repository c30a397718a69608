//! The scan loop: wordlist load, baselines, worker pool, classification,
//! aggregation, recording, and terminal finalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::types::{
    now_rfc3339, Finding, Probe, ScanStartedMsg, ScanStatus, StartRequest,
};
use super::hosts::{build_hosts, per_host_cap_for, sanitize_workers, HostCfg};
use super::httpclient::{build_client, perform_probe, ProbeOutcome};
use super::limiters::{Limiters, TokenBucket};
use super::meta::{apply_scan_status, init_meta, MetaController};
use super::paths::build_raw_url;
use super::progress::{finalize_stopped_hosts, maybe_emit_progress, HostAgg};
use super::runtime::ScanRuntime;
use super::soft404::compute_baselines;
use super::Engine;

struct Job {
    host: Arc<HostCfg>,
    path: String,
}

struct ProbeResult {
    host: Arc<HostCfg>,
    path: String,
    url: String,
    out: ProbeOutcome,
    at: String,
}

pub(crate) async fn run_scan(engine: Engine, rt: Arc<ScanRuntime>, req: StartRequest) {
    let scan_id = req.scan_id.clone();
    let cancel = rt.cancel_token();

    let (paths, wordlist_names) = match load_wordlist(&engine, &req.wordlist_id) {
        Ok((paths, names)) if !paths.is_empty() => (paths, names),
        _ => {
            engine.emit(
                "scan_done",
                &json!({"scanId": scan_id, "error": "failed to read wordlist"}),
            );
            return;
        }
    };

    let recorder = match engine.inner.scans.open_recorder(&scan_id, req.verbose) {
        Ok(rec) => rec,
        Err(err) => {
            tracing::error!(scan = %scan_id, error = %err, "failed to open scan recorder");
            engine.emit(
                "scan_done",
                &json!({"scanId": scan_id, "error": "failed to open scan recorder"}),
            );
            return;
        }
    };

    let probe_path = recorder.probe_path();
    let log_file = if req.verbose { probe_path } else { String::new() };

    let limiters = Limiters::build(&req);

    let started_at = now_rfc3339();
    let mut meta = init_meta(
        &scan_id,
        &started_at,
        &req,
        paths.len(),
        wordlist_names,
        &log_file,
    );
    let mut ctl = MetaController::new(engine.inner.scans.clone(), &scan_id);

    // A transition may already have been requested between accept and here.
    if let Some(desired) = rt.desired_status() {
        apply_scan_status(&mut meta, desired);
        ctl.mark();
    }

    ctl.flush(&meta, true);

    engine.emit(
        "scan_started",
        &ScanStartedMsg {
            scan_id: scan_id.clone(),
            targets: req.targets.clone(),
            wordlist_id: req.wordlist_id.clone(),
            total_paths: paths.len(),
            started_at: started_at.clone(),
            verbose: req.verbose,
            log_file: log_file.clone(),
            tags: req.tags.clone(),
        },
    );

    let timeout = Duration::from_millis(req.timeout_ms);
    let workers = sanitize_workers(req.concurrency);
    let per_host_cap = per_host_cap_for(workers, req.targets.len());

    let client = match build_client(per_host_cap, &req.proxy) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(scan = %scan_id, error = %err, "failed to build http client");
            recorder.close();
            limiters.stop();
            engine.emit(
                "scan_done",
                &json!({"scanId": scan_id, "error": "failed to build http client"}),
            );
            return;
        }
    };

    let hosts = build_hosts(
        &engine,
        &cancel,
        &scan_id,
        &req.targets,
        paths.len(),
        per_host_cap,
        &mut meta,
        &mut ctl,
    );

    compute_baselines(&rt, &client, timeout, limiters.rate.clone(), &hosts, workers).await;

    // Keep buffers low so pause takes effect quickly.
    let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(workers);
    let (results_tx, mut results_rx) = mpsc::channel::<ProbeResult>(workers);
    let jobs_rx = Arc::new(Mutex::new(jobs_rx));

    for _ in 0..workers {
        let cancel = cancel.clone();
        let client = client.clone();
        let rate = limiters.rate.clone();
        let jobs = jobs_rx.clone();
        let results = results_tx.clone();
        tokio::spawn(worker_loop(cancel, client, timeout, rate, jobs, results));
    }
    // Workers hold the only senders left; the channel closes when they exit.
    drop(results_tx);

    tokio::spawn(feed_jobs_interleaved(rt.clone(), hosts.clone(), paths, jobs_tx));

    let mut aggs: HashMap<String, HostAgg> = hosts
        .iter()
        .map(|h| (h.target.clone(), HostAgg::new()))
        .collect();
    let mut total_findings: i64 = 0;
    let mut total_errors: i64 = 0;

    let mut status_rx = rt
        .take_status_rx()
        .unwrap_or_else(|| mpsc::channel(1).1);
    let mut status_open = true;
    let mut flush_tick = tokio::time::interval(Duration::from_millis(500));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            status = status_rx.recv(), if status_open => {
                match status {
                    Some(status) => {
                        apply_scan_status(&mut meta, status);
                        ctl.mark();
                        ctl.flush(&meta, true);
                    }
                    None => status_open = false,
                }
            }

            _ = flush_tick.tick() => {
                ctl.flush(&meta, false);
            }

            result = results_rx.recv() => {
                let Some(res) = result else {
                    let stopped = cancel.is_cancelled();
                    if stopped {
                        finalize_stopped_hosts(
                            &engine, &scan_id, &hosts, &mut aggs, &mut meta,
                            total_findings, total_errors, &mut ctl,
                        );
                    }

                    meta.finished_at = now_rfc3339();
                    meta.total_findings = total_findings;
                    meta.total_errors = total_errors;
                    if meta.status != ScanStatus::Stopped {
                        meta.status = if stopped { ScanStatus::Stopped } else { ScanStatus::Completed };
                    }
                    ctl.mark();
                    ctl.flush(&meta, true);

                    recorder.close();
                    limiters.stop();
                    engine.emit("scan_done", &json!({"scanId": scan_id}));
                    return;
                };

                let agg = aggs
                    .entry(res.host.target.clone())
                    .or_insert_with(HostAgg::new);
                let now = Instant::now();
                agg.done += 1;

                let mut out = res.out;

                let mut is_finding = out.err_str.is_empty()
                    && out.status != 0
                    && out.status != 404
                    && out.status != 429
                    && out.status < 500;

                if is_finding && res.host.soft404_matches(out.status, out.length) {
                    is_finding = false;
                }

                let is_err_req = !out.err_str.is_empty()
                    || out.status == 429
                    || (500..=599).contains(&out.status);

                if is_err_req {
                    if out.err_str.is_empty() && out.status != 0 {
                        out.err_str = status_text(out.status);
                    }
                    agg.errs += 1;
                    total_errors += 1;
                }

                if is_finding {
                    agg.findings += 1;
                    total_findings += 1;

                    let finding = Finding {
                        scan_id: scan_id.clone(),
                        target: res.host.target.clone(),
                        path: res.path.clone(),
                        url: res.url.clone(),
                        status: out.status,
                        length: out.length,
                        soft404_likely: false,
                    };
                    // Recorder writes are best-effort: a bad disk must not stall the scan.
                    let _ = recorder.write_finding(&finding);
                    engine.emit("finding", &finding);
                }

                let probe = Probe {
                    scan_id: scan_id.clone(),
                    target: res.host.target.clone(),
                    path: res.path,
                    url: res.url,
                    status: out.status,
                    length: out.length,
                    duration_ms: out.duration_ms,
                    content_type: out.content_type,
                    location: out.location,
                    error: out.err_str,
                    at: res.at,
                };

                if is_err_req || req.verbose {
                    let _ = recorder.write_probe(&probe);
                }

                if is_err_req {
                    engine.emit("probe_error", &probe);
                }

                if req.verbose && !is_err_req {
                    if let Some(bucket) = &limiters.probe_events {
                        if bucket.try_acquire() {
                            engine.emit("probe", &probe);
                        }
                    }
                }

                if let Some(msg) = maybe_emit_progress(&scan_id, &res.host, agg, now) {
                    engine.emit("host_progress", &msg);

                    if let Some(hm) = meta.hosts.get_mut(&res.host.target) {
                        hm.checked = agg.done;
                        hm.findings = agg.findings;
                        hm.errors = agg.errs;
                    }
                    meta.total_findings = total_findings;
                    meta.total_errors = total_errors;
                    ctl.mark();
                } else if is_err_req {
                    if let Some(hm) = meta.hosts.get_mut(&res.host.target) {
                        hm.errors = agg.errs;
                    }
                    meta.total_errors = total_errors;
                    ctl.mark();
                }

                if agg.done == res.host.total && !agg.finished {
                    agg.finished = true;

                    let status = if cancel.is_cancelled() {
                        crate::types::HostStatus::Stopped
                    } else {
                        crate::types::HostStatus::Completed
                    };

                    if let Some(hm) = meta.hosts.get_mut(&res.host.target) {
                        hm.status = status;
                        hm.checked = agg.done;
                        hm.total = res.host.total;
                        hm.findings = agg.findings;
                        hm.errors = agg.errs;
                        hm.finished_at = now_rfc3339();
                    }
                    meta.total_findings = total_findings;
                    meta.total_errors = total_errors;
                    ctl.mark();
                }
            }
        }
    }
}

fn load_wordlist(engine: &Engine, wordlist_id: &str) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let paths = engine.inner.wordlists.lines(wordlist_id)?;
    let names = engine
        .inner
        .wordlists
        .meta(wordlist_id)
        .map(|m| m.names)
        .unwrap_or_default();
    Ok((paths, names))
}

fn status_text(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

/// Path-major job order: every host sees path N before any host sees path
/// N+1. Keeps per-host progress roughly synchronized. Pacing heuristic only,
/// not an ordering contract.
async fn feed_jobs_interleaved(
    rt: Arc<ScanRuntime>,
    hosts: Vec<Arc<HostCfg>>,
    paths: Vec<String>,
    jobs: mpsc::Sender<Job>,
) {
    let cancel = rt.cancel_token();
    for path in &paths {
        for host in &hosts {
            if !rt.wait_if_paused().await {
                return;
            }
            let job = Job { host: host.clone(), path: path.clone() };
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// One worker: pull a job, bound by the host semaphore and the rate bucket
/// (both cancellable), probe, and push the result. Workers never check the
/// pause gate; they quiesce because the producer stops feeding them.
async fn worker_loop(
    cancel: CancellationToken,
    client: Client,
    timeout: Duration,
    rate: Option<Arc<TokenBucket>>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<ProbeResult>,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            job = recv_job(&jobs) => match job {
                Some(job) => job,
                None => return,
            }
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = job.host.sem.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return,
            }
        };

        if let Some(rate) = &rate {
            if !rate.acquire(&cancel).await {
                return;
            }
        }

        let url = build_raw_url(&job.host.base, &job.path);
        let out = perform_probe(&cancel, &client, timeout, &url).await;
        if out.was_canceled {
            return;
        }
        drop(permit);

        let res = ProbeResult {
            host: job.host.clone(),
            path: job.path,
            url,
            out,
            at: now_rfc3339(),
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = results.send(res) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn recv_job(jobs: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    jobs.lock().await.recv().await
}

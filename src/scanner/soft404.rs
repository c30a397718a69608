//! Per-host soft-404 baselines: before real probing, each host is probed on
//! paths derived from a random GUID that cannot exist; whatever the server
//! answers becomes that host's "not found in disguise" signature.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::types::new_scan_id;
use super::hosts::HostCfg;
use super::httpclient::perform_probe;
use super::limiters::TokenBucket;
use super::runtime::ScanRuntime;
use super::paths::build_raw_url;

/// Exact (status, body-length) sets observed for known-nonexistent paths.
/// A response matches iff its status is present and its length is in that
/// status's set; matching responses are classified as noise.
#[derive(Debug, Clone, Default)]
pub struct Soft404Sig {
    by_status: HashMap<u16, HashSet<i64>>,
}

impl Soft404Sig {
    pub fn add(&mut self, status: u16, length: i64) {
        if status == 0 || length < 0 {
            return;
        }
        self.by_status.entry(status).or_default().insert(length);
    }

    pub fn matches(&self, status: u16, length: i64) -> bool {
        if status == 0 || length < 0 {
            return false;
        }
        self.by_status.get(&status).is_some_and(|lengths| lengths.contains(&length))
    }

    pub fn is_empty(&self) -> bool {
        self.by_status.is_empty()
    }
}

fn test_paths(guid: &str) -> [String; 4] {
    [
        format!("/{guid}"),
        format!("/{guid}/"),
        format!("/{guid}.html"),
        format!("/{guid}.png"),
    ]
}

/// Compute baselines for all hosts with `min(workers, hosts)` parallelism.
/// Each host's signature is stored on its config; cancellation mid-phase
/// leaves partial signatures in place (an absent signature matches nothing).
pub(crate) async fn compute_baselines(
    rt: &Arc<ScanRuntime>,
    client: &Client,
    timeout: Duration,
    rate: Option<Arc<TokenBucket>>,
    hosts: &[Arc<HostCfg>],
    workers: usize,
) {
    if hosts.is_empty() {
        return;
    }

    let parallelism = workers.min(hosts.len()).max(1);
    let gate = Arc::new(Semaphore::new(parallelism));
    let cancel = rt.cancel_token();
    let mut tasks = JoinSet::new();

    for host in hosts {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = gate.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            }
        };

        let rt = rt.clone();
        let client = client.clone();
        let rate = rate.clone();
        let host = host.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let sig = calc_signature(&rt, &client, timeout, rate.as_deref(), &host).await;
            let _ = host.soft404.set(sig);
        });
    }

    while tasks.join_next().await.is_some() {}
}

async fn calc_signature(
    rt: &ScanRuntime,
    client: &Client,
    timeout: Duration,
    rate: Option<&TokenBucket>,
    host: &HostCfg,
) -> Soft404Sig {
    let mut sig = Soft404Sig::default();
    let cancel = rt.cancel_token();
    let guid = new_scan_id();

    for path in test_paths(&guid) {
        if !rt.wait_if_paused().await {
            return sig;
        }

        if let Some(rate) = rate {
            if !rate.acquire(&cancel).await {
                return sig;
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return sig,
            permit = host.sem.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return sig,
            }
        };

        let url = build_raw_url(&host.base, &path);
        let out = perform_probe(&cancel, client, timeout, &url).await;
        drop(permit);

        if out.was_canceled {
            return sig;
        }
        if out.err_str.is_empty() {
            sig.add(out.status, out.length);
        }
    }

    sig
}

//! HTTP client construction and the single-probe operation.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::{header, redirect, Client, Proxy};
use tokio_util::sync::CancellationToken;
use url::Url;

/// What one GET against one URL produced.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    /// HTTP status, 0 on transport failure.
    pub status: u16,
    /// Bytes drained from the body, -1 if the body was not read.
    pub body_bytes: i64,
    /// Length used for classification and soft-404 matching (= body bytes).
    pub length: i64,
    pub content_type: String,
    pub location: String,
    /// Empty on success.
    pub err_str: String,
    pub duration_ms: i64,
    /// True when the failure was caused by scan cancellation, so the caller
    /// can exit without recording a spurious error.
    pub was_canceled: bool,
}

/// Build the per-scan client. Certificates are not verified on purpose: the
/// targets of an enumeration scan routinely carry self-signed or mismatched
/// certs. Redirects are not followed so the first response is the outcome.
pub fn build_client(per_host_cap: usize, proxy: &str) -> Result<Client> {
    let per_host_cap = per_host_cap.max(1);

    let mut builder = Client::builder()
        .redirect(redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(per_host_cap.saturating_mul(2).max(32));

    // An unusable proxy string falls back to environment proxy settings,
    // which reqwest applies by default.
    let proxy = proxy.trim();
    if !proxy.is_empty() {
        if let Ok(u) = Url::parse(proxy) {
            if u.host_str().is_some_and(|h| !h.is_empty()) {
                if let Ok(p) = Proxy::all(u.as_str()) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder.build().context("build http client")
}

/// Issue one GET, drain the body, and summarize the outcome. Never errors:
/// every failure mode is folded into the outcome. A body-read failure keeps
/// `length = -1` while the status still flows into classification, so a
/// transient read error on a 200 records as an error rather than a finding.
pub async fn perform_probe(
    cancel: &CancellationToken,
    client: &Client,
    timeout: Duration,
    full_url: &str,
) -> ProbeOutcome {
    let started = Instant::now();
    let mut out = ProbeOutcome {
        body_bytes: -1,
        length: -1,
        ..Default::default()
    };

    let attempt = async {
        let sent = client
            .get(full_url)
            // Forces an uncompressed body so lengths compare across probes.
            .header(header::ACCEPT_ENCODING, "identity")
            .timeout(timeout)
            .send()
            .await;

        let mut resp = match sent {
            Ok(resp) => resp,
            Err(err) => return Err(err.to_string()),
        };

        let status = resp.status().as_u16();
        let content_type = header_str(resp.headers(), header::CONTENT_TYPE);
        let location = header_str(resp.headers(), header::LOCATION);

        let mut read: i64 = 0;
        let body = loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => read += chunk.len() as i64,
                Ok(None) => break Ok(read),
                Err(err) => break Err(format!("body read: {err}")),
            }
        };

        Ok((status, content_type, location, body))
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            out.err_str = "request canceled".to_string();
            out.was_canceled = true;
        }
        result = attempt => match result {
            Err(err) => {
                out.err_str = err;
                if cancel.is_cancelled() {
                    out.was_canceled = true;
                }
            }
            Ok((status, content_type, location, body)) => {
                out.status = status;
                out.content_type = content_type;
                out.location = location;
                match body {
                    Ok(read) => out.body_bytes = read,
                    Err(err) => out.err_str = err,
                }
            }
        }
    }

    out.length = out.body_bytes;
    out.duration_ms = started.elapsed().as_millis() as i64;
    out
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(&name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{format_description::well_known, OffsetDateTime};
use url::Url;

/// Overall state of a scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

/// State of a single target within a scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl HostStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HostStatus::Stopped | HostStatus::Completed | HostStatus::Error)
    }
}

/// Immutable input describing one scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scan_id: String,
    pub targets: Vec<String>,
    pub wordlist_id: String,
    pub concurrency: usize,
    pub timeout_ms: u64,
    /// Requests per second across the whole scan; 0 = unlimited.
    pub rate_limit: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub verbose: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy: String,
}

impl StartRequest {
    /// Trim and validate the request in place. Returns a map of field name to
    /// problem description; an empty map means the request is ready to run.
    pub fn normalize_and_validate(&mut self) -> BTreeMap<String, String> {
        let mut details = BTreeMap::new();

        let targets_provided = !self.targets.is_empty();
        let tags_provided = !self.tags.is_empty();

        self.scan_id = self.scan_id.trim().to_string();
        self.wordlist_id = self.wordlist_id.trim().to_string();
        self.proxy = self.proxy.trim().to_string();
        self.targets = trim_non_empty(&self.targets);
        self.tags = trim_non_empty(&self.tags);

        if self.targets.is_empty() {
            if !targets_provided {
                details.insert("targets".into(), "required".into());
            } else {
                details.insert(
                    "targets".into(),
                    "must contain at least one non-empty entry".into(),
                );
            }
        }

        if self.wordlist_id.is_empty() {
            details.insert("wordlistId".into(), "required".into());
        } else if !is_valid_wordlist_id(&self.wordlist_id) {
            details.insert(
                "wordlistId".into(),
                "must be a 64-char lowercase hex sha256".into(),
            );
        }

        if self.concurrency == 0 {
            details.insert("concurrency".into(), "must be > 0".into());
        }

        if self.timeout_ms == 0 {
            details.insert("timeoutMs".into(), "must be > 0".into());
        }

        if tags_provided && self.tags.is_empty() {
            details.insert("tags".into(), "must contain at least one non-empty tag".into());
        }

        if !self.proxy.is_empty() {
            match Url::parse(&self.proxy) {
                Ok(u) if u.host_str().map_or(true, str::is_empty) => {
                    details.insert(
                        "proxy".into(),
                        "must be a valid proxy URL (e.g. http://127.0.0.1:8080)".into(),
                    );
                }
                Ok(u) if u.scheme() != "http" && u.scheme() != "https" => {
                    details.insert("proxy".into(), "scheme must be http or https".into());
                }
                Ok(_) => {}
                Err(_) => {
                    details.insert(
                        "proxy".into(),
                        "must be a valid proxy URL (e.g. http://127.0.0.1:8080)".into(),
                    );
                }
            }
        }

        details
    }
}

fn trim_non_empty(input: &[String]) -> Vec<String> {
    input
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Aggregated state of a scan, persisted as `scans/<id>.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Meta {
    pub id: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub finished_at: String,
    pub targets: Vec<String>,
    pub wordlist_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wordlist_names: Vec<String>,
    pub total_paths: usize,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub rate_limit: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub verbose: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy: String,
    pub total_requests: i64,
    pub total_findings: i64,
    pub total_errors: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, HostMeta>,
    pub status: ScanStatus,
}

/// Per-target sub-record inside [`Meta`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HostMeta {
    pub target: String,
    pub status: HostStatus,
    pub checked: i64,
    pub total: i64,
    pub findings: i64,
    pub errors: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub started_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub finished_at: String,
}

/// One interesting response, appended to `scans/<id>.findings.ndjson`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Finding {
    pub scan_id: String,
    pub target: String,
    pub path: String,
    pub url: String,
    pub status: u16,
    pub length: i64,
    #[serde(rename = "soft404_likely")]
    pub soft404_likely: bool,
}

/// Full detail of one completed probe, appended to `scans/<id>.probes.ndjson`
/// for errors (always) and for every probe when the scan is verbose.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Probe {
    pub scan_id: String,
    pub target: String,
    pub path: String,
    pub url: String,
    pub status: u16,
    pub length: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub at: String,
}

/// Metadata for an uploaded wordlist, keyed by content hash.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WordlistMeta {
    pub id: String,
    pub names: Vec<String>,
    pub bytes: u64,
    pub uploaded_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanStartedMsg {
    pub scan_id: String,
    pub targets: Vec<String>,
    pub wordlist_id: String,
    pub total_paths: usize,
    pub started_at: String,
    pub verbose: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log_file: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HostStartedMsg {
    pub scan_id: String,
    pub target: String,
    pub total: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HostProgressMsg {
    pub scan_id: String,
    pub target: String,
    pub percent: i64,
    #[serde(rename = "rate_rps")]
    pub rate_rps: i64,
    pub checked: i64,
    pub total: i64,
    pub errors: i64,
}

/// Generate a fresh 128-bit scan id, rendered as 32 lowercase hex chars.
pub fn new_scan_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

pub fn is_valid_scan_id(id: &str) -> bool {
    id.len() == 32 && is_lower_hex(id)
}

pub fn is_valid_wordlist_id(id: &str) -> bool {
    id.len() == 64 && is_lower_hex(id)
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// RFC3339 UTC timestamp using the `time` crate.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

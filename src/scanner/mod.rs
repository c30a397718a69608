//! The scan engine: lifecycle control, multi-host scheduling, rate limiting,
//! soft-404 baselining, probing, classification, and durable recording.

pub mod hosts;
pub mod httpclient;
pub mod limiters;
pub(crate) mod meta;
pub mod paths;
pub(crate) mod progress;
mod run;
pub mod runtime;
pub mod soft404;

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::types::{new_scan_id, Finding, Meta, Probe, StartRequest, WordlistMeta};
use runtime::Manager;

/// Read access to stored wordlists.
pub trait WordlistSource: Send + Sync {
    /// Ordered, deduplicated, non-empty paths, each prefixed with `/`.
    fn lines(&self, wordlist_id: &str) -> Result<Vec<String>>;
    fn meta(&self, wordlist_id: &str) -> Result<WordlistMeta>;
}

/// Durable append-only sink for one scan's findings and probe records.
/// Writes are best-effort from the engine's point of view.
pub trait Recorder: Send + Sync {
    fn write_finding(&self, finding: &Finding) -> Result<()>;
    fn write_probe(&self, probe: &Probe) -> Result<()>;
    fn probe_path(&self) -> String;
    fn close(&self);
}

/// Persistence the engine needs for scan state.
pub trait ScanSink: Send + Sync {
    fn write_meta(&self, scan_id: &str, meta: &Meta) -> Result<()>;
    fn open_recorder(&self, scan_id: &str, verbose: bool) -> Result<Arc<dyn Recorder>>;
}

/// Fire-and-forget event fan-out. Implementations must never block the scan loop.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Cheap-to-clone handle over the engine's shared state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    wordlists: Arc<dyn WordlistSource>,
    scans: Arc<dyn ScanSink>,
    emitter: Arc<dyn EventEmitter>,
    manager: Manager,
}

impl Engine {
    pub fn new(
        wordlists: Arc<dyn WordlistSource>,
        scans: Arc<dyn ScanSink>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                wordlists,
                scans,
                emitter,
                manager: Manager::new(),
            }),
        }
    }

    /// Launch a scan and return its id immediately. The request is expected to
    /// have passed [`StartRequest::normalize_and_validate`]. Starting an id
    /// that is already active is a no-op returning that id. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, mut req: StartRequest) -> String {
        if req.scan_id.is_empty() {
            req.scan_id = new_scan_id();
        }
        let id = req.scan_id.clone();
        let Some(rt) = self.inner.manager.register(&id) else {
            return id;
        };

        let engine = self.clone();
        let done_id = id.clone();
        tokio::spawn(async move {
            run::run_scan(engine.clone(), rt, req).await;
            engine.inner.manager.remove(&done_id);
        });
        id
    }

    /// Returns false if the id is unknown or the scan already finished.
    pub fn pause(&self, id: &str) -> bool {
        self.inner.manager.pause(id)
    }

    pub fn resume(&self, id: &str) -> bool {
        self.inner.manager.resume(id)
    }

    pub fn stop(&self, id: &str) -> bool {
        self.inner.manager.stop(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.manager.is_active(id)
    }

    pub(crate) fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.inner.emitter.emit(event, value),
            Err(err) => tracing::warn!(event, error = %err, "dropping unserializable event"),
        }
    }
}

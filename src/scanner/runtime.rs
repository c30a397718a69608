//! Per-scan runtime control: the pause/resume/stop state machine and the
//! manager that tracks live scans by id.
//!
//! Cancellation and pause are distinct primitives: cancellation is one-shot
//! and terminal, pause is reversible. The pause gate re-reads both on every
//! wakeup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::types::ScanStatus;

pub struct ScanRuntime {
    pub id: String,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    status_tx: mpsc::Sender<ScanStatus>,
    status_rx: Mutex<Option<mpsc::Receiver<ScanStatus>>>,
    desired: Mutex<Option<ScanStatus>>,
}

impl ScanRuntime {
    fn new(id: String) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(1);
        Arc::new(Self {
            id,
            cancel: CancellationToken::new(),
            paused,
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            desired: Mutex::new(None),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// The scan loop takes the receiving side of the status-hint channel once.
    pub(crate) fn take_status_rx(&self) -> Option<mpsc::Receiver<ScanStatus>> {
        self.status_rx.lock().unwrap().take()
    }

    /// Latest externally requested status, if any transition happened before
    /// the scan loop started listening.
    pub(crate) fn desired_status(&self) -> Option<ScanStatus> {
        *self.desired.lock().unwrap()
    }

    fn signal_status(&self, status: ScanStatus) {
        *self.desired.lock().unwrap() = Some(status);
        // Capacity-1 hint channel: if the loop is behind, the snapshot above
        // still carries the latest request.
        let _ = self.status_tx.try_send(status);
    }

    /// Blocks while the scan is paused. Returns `false` iff the scan is
    /// stopping; the caller must then wind down instead of producing work.
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                    // Woke up; loop to re-check both pause and cancellation.
                }
            }
        }
    }
}

/// Tracks live scan runtimes by id and drives their lifecycle transitions.
/// Terminal scans are removed, so every operation on an unknown id is `false`.
pub(crate) struct Manager {
    runs: Mutex<HashMap<String, Arc<ScanRuntime>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self { runs: Mutex::new(HashMap::new()) }
    }

    /// Create and track a runtime for `id`. Returns `None` if a scan with
    /// that id is already active.
    pub fn register(&self, id: &str) -> Option<Arc<ScanRuntime>> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(id) {
            return None;
        }
        let rt = ScanRuntime::new(id.to_string());
        runs.insert(id.to_string(), rt.clone());
        Some(rt)
    }

    pub fn remove(&self, id: &str) {
        self.runs.lock().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScanRuntime>> {
        self.runs.lock().unwrap().get(id).cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.runs.lock().unwrap().contains_key(id)
    }

    pub fn pause(&self, id: &str) -> bool {
        let Some(rt) = self.get(id) else { return false };
        rt.paused.send_if_modified(|p| {
            if *p {
                false
            } else {
                *p = true;
                true
            }
        });
        rt.signal_status(ScanStatus::Paused);
        true
    }

    pub fn resume(&self, id: &str) -> bool {
        let Some(rt) = self.get(id) else { return false };
        rt.paused.send_if_modified(|p| {
            if *p {
                *p = false;
                true
            } else {
                false
            }
        });
        rt.signal_status(ScanStatus::Running);
        true
    }

    pub fn stop(&self, id: &str) -> bool {
        let Some(rt) = self.get(id) else { return false };
        // Wake any paused waiters first so they observe the cancellation.
        rt.paused.send_if_modified(|p| {
            if *p {
                *p = false;
                true
            } else {
                false
            }
        });
        rt.signal_status(ScanStatus::Stopped);
        rt.cancel.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_id_returns_false() {
        let mgr = Manager::new();
        assert!(!mgr.pause("missing"));
        assert!(!mgr.resume("missing"));
        assert!(!mgr.stop("missing"));
        assert!(!mgr.is_active("missing"));
    }

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let mgr = Manager::new();
        assert!(mgr.register("a").is_some());
        assert!(mgr.register("a").is_none());
        mgr.remove("a");
        assert!(mgr.register("a").is_some());
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let mgr = Manager::new();
        let rt = mgr.register("a").unwrap();

        assert!(mgr.pause("a"));
        assert!(mgr.pause("a"));
        assert!(rt.is_paused());
        assert_eq!(rt.desired_status(), Some(ScanStatus::Paused));

        assert!(mgr.resume("a"));
        assert!(mgr.resume("a"));
        assert!(!rt.is_paused());
        assert_eq!(rt.desired_status(), Some(ScanStatus::Running));
    }

    #[tokio::test]
    async fn wait_if_paused_passes_through_when_running() {
        let mgr = Manager::new();
        let rt = mgr.register("a").unwrap();
        assert!(rt.wait_if_paused().await);
    }

    #[tokio::test]
    async fn wait_if_paused_blocks_until_resume() {
        let mgr = Manager::new();
        let rt = mgr.register("a").unwrap();
        mgr.pause("a");

        let waiter = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        mgr.resume("a");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn stop_while_paused_wakes_waiters_into_cancellation() {
        let mgr = Manager::new();
        let rt = mgr.register("a").unwrap();
        mgr.pause("a");

        let waiter = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        mgr.stop("a");
        assert!(!waiter.await.unwrap());
        assert!(rt.is_cancelled());
        assert!(!rt.is_paused());
    }

    #[tokio::test]
    async fn status_hints_reach_the_scan_loop_side() {
        let mgr = Manager::new();
        let rt = mgr.register("a").unwrap();
        let mut rx = rt.take_status_rx().unwrap();
        assert!(rt.take_status_rx().is_none());

        mgr.pause("a");
        assert_eq!(rx.recv().await, Some(ScanStatus::Paused));

        // Channel holds one hint; rapid transitions keep the latest snapshot.
        mgr.resume("a");
        mgr.pause("a");
        assert_eq!(rt.desired_status(), Some(ScanStatus::Paused));
    }
}

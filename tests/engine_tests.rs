//! End-to-end engine scenarios driven against a local HTTP target server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use serde_json::Value;

use dirprobe_rs::scanner::{Engine, EventEmitter};
use dirprobe_rs::store::{ScanRepo, WordlistStore};
use dirprobe_rs::types::{HostStatus, ScanStatus, StartRequest};

#[derive(Clone, Default)]
struct CapturingEmitter {
    events: Arc<Mutex<Vec<(String, Value)>>>,
}

impl CapturingEmitter {
    fn snapshot(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| event == name)
            .count()
    }

    fn total(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    async fn wait_done(&self, scan_id: &str) -> Value {
        for _ in 0..600 {
            if let Some(payload) = self
                .events
                .lock()
                .unwrap()
                .iter()
                .find(|(event, payload)| event == "scan_done" && payload["scanId"] == scan_id)
                .map(|(_, payload)| payload.clone())
            {
                return payload;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scan {scan_id} did not finish in time");
    }
}

impl EventEmitter for CapturingEmitter {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}

struct TestEnv {
    _tmp: tempfile::TempDir,
    engine: Engine,
    emitter: CapturingEmitter,
    repo: Arc<ScanRepo>,
    wordlists: Arc<WordlistStore>,
}

fn setup() -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let wordlists = Arc::new(WordlistStore::new(tmp.path().join("wordlists")).unwrap());
    let repo = Arc::new(ScanRepo::new(tmp.path().to_path_buf()).unwrap());
    let emitter = CapturingEmitter::default();
    let engine = Engine::new(wordlists.clone(), repo.clone(), Arc::new(emitter.clone()));
    TestEnv { _tmp: tmp, engine, emitter, repo, wordlists }
}

async fn spawn_target(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn request(env: &TestEnv, targets: Vec<String>, wordlist: &[u8]) -> StartRequest {
    let (wordlist_id, _) = env.wordlists.put("test.txt", wordlist).unwrap();
    StartRequest {
        targets,
        wordlist_id,
        concurrency: 4,
        timeout_ms: 2000,
        rate_limit: 0,
        ..Default::default()
    }
}

fn basic_router() -> Router {
    Router::new()
        .route("/a", get(|| async { (StatusCode::OK, "hello") }))
        .route("/b", get(|| async { (StatusCode::NOT_FOUND, "") }))
        .route("/c", get(|| async { (StatusCode::FORBIDDEN, "forbidden area") }))
        .fallback(|| async { (StatusCode::NOT_FOUND, "") })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hosts_three_paths_complete_with_exact_totals() {
    let env = setup();
    let h1 = spawn_target(basic_router()).await;
    let h2 = spawn_target(basic_router()).await;

    let req = request(&env, vec![h1.clone(), h2.clone()], b"a\nb\nc\n");
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().expect("meta written");
    assert_eq!(meta.status, ScanStatus::Completed);
    assert_eq!(meta.total_requests, 6);
    assert_eq!(meta.total_paths, 3);
    assert!(!meta.finished_at.is_empty());
    // /a (200) and /c (403) are findings on each host; /b (404) is neither
    // finding nor error.
    assert_eq!(meta.total_findings, 4);
    assert_eq!(meta.total_errors, 0);

    for target in [&h1, &h2] {
        let host = &meta.hosts[target.as_str()];
        assert_eq!(host.status, HostStatus::Completed);
        assert_eq!(host.checked, 3);
        assert_eq!(host.total, 3);
        assert_eq!(host.findings, 2);
        assert!(!host.finished_at.is_empty());
    }

    assert_eq!(env.emitter.count("scan_started"), 1);
    assert_eq!(env.emitter.count("host_started"), 2);
    assert_eq!(env.emitter.count("finding"), 4);

    // Every emitted finding has a corresponding line in the findings file.
    let page = env.repo.findings_page(&id, 0, 100).unwrap();
    assert_eq!(page.items.len(), 4);
    assert!(page.items.iter().all(|f| f.scan_id == id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn soft404_baseline_suppresses_matching_responses() {
    let env = setup();
    // Unknown paths (including the GUID baseline probes) answer 200 with the
    // same body a soft-404 landing page would serve.
    let router = Router::new()
        .route("/login", get(|| async { (StatusCode::OK, "secret area 42") }))
        .fallback(|| async { (StatusCode::OK, "welcome home") });
    let target = spawn_target(router).await;

    let req = request(&env, vec![target.clone()], b"admin\nlogin\n");
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    let host = &meta.hosts[target.as_str()];
    assert_eq!(host.status, HostStatus::Completed);
    assert_eq!(host.checked, 2);
    // /admin matched the baseline signature (200, len("welcome home")) and
    // became noise; /login differs in length and survives.
    assert_eq!(host.findings, 1);
    assert_eq!(meta.total_findings, 1);

    let page = env.repo.findings_page(&id, 0, 100).unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].path, "/login");
    assert_eq!(page.items[0].status, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_429_is_an_error_with_synthesized_text() {
    let env = setup();
    let router = Router::new()
        .route("/limited", get(|| async { (StatusCode::TOO_MANY_REQUESTS, "") }))
        .fallback(|| async { (StatusCode::NOT_FOUND, "") });
    let target = spawn_target(router).await;

    let req = request(&env, vec![target.clone()], b"limited\n");
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert_eq!(meta.total_findings, 0);
    assert_eq!(meta.total_errors, 1);
    let host = &meta.hosts[target.as_str()];
    // The error still counts as a checked path.
    assert_eq!(host.checked, 1);
    assert_eq!(host.errors, 1);
    assert_eq!(host.status, HostStatus::Completed);

    assert_eq!(env.emitter.count("probe_error"), 1);
    assert_eq!(env.emitter.count("finding"), 0);

    let errors = env.repo.errors_page(&id, 0, 100).unwrap();
    assert_eq!(errors.items.len(), 1);
    assert_eq!(errors.items[0].error, "Too Many Requests");
    assert_eq!(errors.items[0].status, 429);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_target_url_errors_without_blocking_the_scan() {
    let env = setup();
    let good = spawn_target(basic_router()).await;
    let bad = "not a url".to_string();

    let req = request(&env, vec![good.clone(), bad.clone()], b"a\nb\nc\n");
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert_eq!(meta.status, ScanStatus::Completed);

    let broken = &meta.hosts[bad.as_str()];
    assert_eq!(broken.status, HostStatus::Error);
    assert_eq!(broken.checked, 3);
    assert_eq!(broken.total, 3);

    let healthy = &meta.hosts[good.as_str()];
    assert_eq!(healthy.status, HostStatus::Completed);
    assert_eq!(healthy.checked, 3);

    // The broken host settled with a single 100% progress emit.
    let full = env
        .emitter
        .snapshot()
        .into_iter()
        .find(|(event, payload)| event == "host_progress" && payload["target"] == bad.as_str())
        .expect("progress for invalid host");
    assert_eq!(full.1["percent"], 100);
    assert_eq!(full.1["rate_rps"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_mid_scan_finalizes_as_stopped() {
    let env = setup();
    let router = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        (StatusCode::NOT_FOUND, "")
    });
    let target = spawn_target(router).await;

    let mut words = String::new();
    for i in 0..200 {
        words.push_str(&format!("p{i}\n"));
    }
    let req = request(&env, vec![target.clone()], words.as_bytes());
    let id = env.engine.start(req);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(env.engine.stop(&id));
    env.emitter.wait_done(&id).await;

    // The runtime is unregistered right after scan_done.
    for _ in 0..100 {
        if !env.engine.is_active(&id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!env.engine.is_active(&id));
    // Stop on a finished scan is unknown-id at the engine level.
    assert!(!env.engine.stop(&id));

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert_eq!(meta.status, ScanStatus::Stopped);
    assert!(!meta.finished_at.is_empty());

    let host = &meta.hosts[target.as_str()];
    assert_eq!(host.status, HostStatus::Stopped);
    assert!(host.checked <= 200);
    assert!(!host.finished_at.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_quiesces_and_resume_completes() {
    let env = setup();
    let router = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        (StatusCode::NOT_FOUND, "")
    });
    let target = spawn_target(router).await;

    let mut words = String::new();
    for i in 0..60 {
        words.push_str(&format!("p{i}\n"));
    }
    let mut req = request(&env, vec![target.clone()], words.as_bytes());
    req.concurrency = 2;
    let id = env.engine.start(req);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(env.engine.pause(&id));
    assert!(env.engine.pause(&id), "pause is idempotent");

    // Let in-flight probes drain; afterwards the event stream must go quiet.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let settled = env.emitter.total();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(env.emitter.total(), settled, "no events while paused");

    assert!(env.engine.resume(&id));
    assert!(env.engine.resume(&id), "resume is idempotent");
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert_eq!(meta.status, ScanStatus::Completed);
    let host = &meta.hosts[target.as_str()];
    assert_eq!(host.checked, 60);
    assert_eq!(host.status, HostStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verbose_scan_logs_every_probe() {
    let env = setup();
    let target = spawn_target(basic_router()).await;

    let mut req = request(&env, vec![target.clone()], b"a\nb\nc\n");
    req.verbose = true;
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert!(!meta.log_file.is_empty());

    // Baseline probes bypass the result loop; exactly the three wordlist
    // probes are logged.
    let log = env.repo.log_page(&id, 0, 100).unwrap();
    assert_eq!(log.items.len(), 3);
    assert!(log.items.iter().all(|p| !p.at.is_empty()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_wordlist_fails_fast_without_meta() {
    let env = setup();
    let target = spawn_target(basic_router()).await;

    let req = StartRequest {
        targets: vec![target],
        wordlist_id: "f".repeat(64),
        concurrency: 2,
        timeout_ms: 1000,
        ..Default::default()
    };
    let id = env.engine.start(req);

    let done = env.emitter.wait_done(&id).await;
    assert_eq!(done["error"], "failed to read wordlist");
    assert!(env.repo.read_meta(&id).unwrap().is_none());
    assert_eq!(env.emitter.count("scan_started"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_wordlist_fails_fast() {
    let env = setup();
    let target = spawn_target(basic_router()).await;

    let req = request(&env, vec![target], b"\n\n  \n");
    let id = env.engine.start(req);

    let done = env.emitter.wait_done(&id).await;
    assert_eq!(done["error"], "failed to read wordlist");
    assert_eq!(env.emitter.count("scan_started"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limited_scan_still_completes() {
    let env = setup();
    let target = spawn_target(basic_router()).await;

    let mut req = request(&env, vec![target.clone()], b"a\nb\nc\n");
    req.rate_limit = 50;
    let id = env.engine.start(req);
    env.emitter.wait_done(&id).await;

    let meta = env.repo.read_meta(&id).unwrap().unwrap();
    assert_eq!(meta.status, ScanStatus::Completed);
    assert_eq!(meta.hosts[target.as_str()].checked, 3);
}

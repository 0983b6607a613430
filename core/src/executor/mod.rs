//! Run orchestration.
//!
//! The executor owns every shared resource of a run: the service process
//! (through the supervisor), the transport listener, and the mock server.
//! Tests are grouped by recorded environment snapshot; each group gets one
//! service lifecycle, a bounded worker pool replays the group's tests, and
//! crashed tests are re-run sequentially afterwards. Results are buffered
//! per input index and flushed in input order at the end.

mod crash;
mod results;

pub use results::write_results;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use drift_protocol::TestCase;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::comparator::Comparator;
use crate::comparator::Deviation;
use crate::comparator::ResponseView;
use crate::config::RunConfig;
use crate::error::DriftError;
use crate::error::Result;
use crate::events::LogBus;
use crate::events::RunEvent;
use crate::mock_server::MockServer;
use crate::mock_server::TestSession;
use crate::supervisor::ServiceSupervisor;
use crate::supervisor::SupervisorState;
use crate::transport::TransportListener;
use crash::CrashTracker;

/// Environment-group key used when a trace recorded no snapshot.
const DEFAULT_GROUP: &str = "default";

/// Request headers never replayed verbatim: they describe the original
/// connection, not the request.
const REQUEST_HEADER_SKIP: [&str; 6] = [
    "accept-encoding",
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "transfer-encoding",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestResult {
    pub test_id: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub deviations: Vec<Deviation>,
    pub crashed_server: bool,
    pub retried_after_crash: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub retried: usize,
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Final results in input order; tests never started (cancellation)
    /// are absent.
    pub results: Vec<TestResult>,
    pub summary: RunSummary,
    pub cancelled: bool,
}

impl RunOutcome {
    /// The process exit code this outcome maps to. Configuration and
    /// startup errors never reach an outcome; they surface as errors and
    /// exit 3 at the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            4
        } else if self.summary.crashed > 0 {
            2
        } else if self.summary.failed > 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Clone)]
struct PlannedTest {
    index: usize,
    case: Arc<TestCase>,
}

struct EnvironmentGroup {
    key: String,
    env: Vec<(String, String)>,
    tests: Vec<PlannedTest>,
}

/// Write-once-per-phase result slots, indexed by input order. Retries
/// overwrite their own slot; nothing else does.
#[derive(Default)]
struct ResultsBoard {
    slots: Mutex<Vec<Option<TestResult>>>,
}

impl ResultsBoard {
    fn with_capacity(len: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; len]),
        }
    }

    fn store(&self, index: usize, result: TestResult) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }
    }

    fn collect(&self) -> Vec<TestResult> {
        self.slots
            .lock()
            .map(|slots| slots.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

/// Everything a worker needs for one environment group.
struct GroupRuntime {
    config: Arc<RunConfig>,
    comparator: Comparator,
    http: reqwest::Client,
    supervisor: Arc<ServiceSupervisor>,
    mock_server: Arc<MockServer>,
    bus: LogBus,
    cancel: CancellationToken,
    env: Vec<(String, String)>,
    queue: Mutex<VecDeque<PlannedTest>>,
    cases_by_index: HashMap<usize, Arc<TestCase>>,
    tracker: Mutex<CrashTracker>,
    /// Serializes "restart before next pick-up" against concurrent pick-ups.
    pickup_gate: tokio::sync::Mutex<()>,
    aborted: AtomicBool,
    board: Arc<ResultsBoard>,
}

pub struct Executor {
    config: Arc<RunConfig>,
    bus: LogBus,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(config: RunConfig, bus: LogBus) -> Self {
        Self {
            config: Arc::new(config),
            bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the whole run: no new tests start, in-flight
    /// live requests are abandoned, teardown still runs, and results
    /// collected so far are written.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, tests: Vec<TestCase>) -> Result<RunOutcome> {
        self.config.validate()?;

        let tests = self.filter_tests(tests)?;
        let board = Arc::new(ResultsBoard::with_capacity(tests.len()));

        if tests.is_empty() {
            // No service, no transport; just an empty record.
            return self.finish(&board);
        }

        let listener = TransportListener::bind(self.config.communication.kind).await?;
        let endpoint = listener.endpoint();
        let mock_server = MockServer::new(self.bus.clone());
        let serve_cancel = self.cancel.child_token();
        let serve_task = tokio::spawn(
            mock_server
                .clone()
                .serve(listener, serve_cancel.clone()),
        );

        let supervisor = Arc::new(ServiceSupervisor::new(
            self.config.service.clone(),
            self.bus.clone(),
        ));

        let planned: Vec<PlannedTest> = tests
            .iter()
            .enumerate()
            .map(|(index, case)| PlannedTest {
                index,
                case: case.clone(),
            })
            .collect();
        let groups = plan_groups(planned);
        info!(
            tests = tests.len(),
            groups = groups.len(),
            concurrency = self.config.run.concurrency,
            "starting replay run"
        );

        for group in &groups {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut env = endpoint.env_vars();
            env.extend(group.env.iter().cloned());

            let started = async {
                supervisor.start(&env).await?;
                supervisor.await_ready().await
            }
            .await;
            if let Err(err) = started {
                warn!(group = %group.key, %err, "group startup failed; marking its tests crashed");
                for planned in &group.tests {
                    let result = TestResult {
                        test_id: planned.case.trace_id.clone(),
                        passed: false,
                        duration_ms: 0,
                        deviations: Vec::new(),
                        crashed_server: true,
                        retried_after_crash: false,
                        error: Some(format!("service failed to start: {err}")),
                    };
                    self.bus.publish(RunEvent::TestCompleted(result.clone()));
                    board.store(planned.index, result);
                }
                continue;
            }
            supervisor.mark_running();

            let runtime = Arc::new(GroupRuntime {
                config: self.config.clone(),
                comparator: Comparator::new(&self.config.comparison),
                // The service is always on loopback; never route through a
                // configured proxy.
                http: reqwest::Client::builder()
                    .no_proxy()
                    .build()
                    .unwrap_or_default(),
                supervisor: supervisor.clone(),
                mock_server: mock_server.clone(),
                bus: self.bus.clone(),
                cancel: self.cancel.clone(),
                env,
                queue: Mutex::new(group.tests.iter().cloned().collect()),
                cases_by_index: group
                    .tests
                    .iter()
                    .map(|planned| (planned.index, planned.case.clone()))
                    .collect(),
                tracker: Mutex::new(CrashTracker::default()),
                pickup_gate: tokio::sync::Mutex::new(()),
                aborted: AtomicBool::new(false),
                board: board.clone(),
            });

            run_group(runtime.clone()).await;
            retry_crashed(runtime).await;
            supervisor.stop().await;
        }

        serve_cancel.cancel();
        let _ = serve_task.await;

        self.finish(&board)
    }

    fn filter_tests(&self, tests: Vec<TestCase>) -> Result<Vec<Arc<TestCase>>> {
        let tests: Vec<Arc<TestCase>> = tests.into_iter().map(Arc::new).collect();
        let Some(pattern) = &self.config.run.filter_regex else {
            return Ok(tests);
        };
        let regex = regex::Regex::new(pattern)
            .map_err(|err| DriftError::Configuration(format!("run.filter_regex: {err}")))?;
        Ok(tests
            .into_iter()
            .filter(|case| {
                regex.is_match(&case.display_name()) || regex.is_match(&case.trace_id)
            })
            .collect())
    }

    fn finish(&self, board: &ResultsBoard) -> Result<RunOutcome> {
        let results = board.collect();
        let summary = summarize(&results);
        if let Some(path) = &self.config.run.results_path {
            write_results(path, &results, &summary)?;
        }
        self.bus.publish(RunEvent::AllCompleted(summary));
        Ok(RunOutcome {
            results,
            summary,
            cancelled: self.cancel.is_cancelled(),
        })
    }
}

fn summarize(results: &[TestResult]) -> RunSummary {
    RunSummary {
        total: results.len(),
        passed: results.iter().filter(|r| r.passed).count(),
        failed: results
            .iter()
            .filter(|r| !r.passed && !r.crashed_server)
            .count(),
        crashed: results.iter().filter(|r| r.crashed_server).count(),
        retried: results.iter().filter(|r| r.retried_after_crash).count(),
    }
}

/// Groups planned tests by recorded environment snapshot, in first-seen
/// order. Byte-equal snapshots share a group and therefore one service
/// lifecycle.
fn plan_groups(tests: Vec<PlannedTest>) -> Vec<EnvironmentGroup> {
    let mut groups: Vec<EnvironmentGroup> = Vec::new();
    for planned in tests {
        let key = planned
            .case
            .env_snapshot_key()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => group.tests.push(planned),
            None => {
                let env = planned.case.env_vars().into_iter().collect();
                groups.push(EnvironmentGroup {
                    key,
                    env,
                    tests: vec![planned],
                });
            }
        }
    }
    groups
}

/// The bounded worker pool for one group's main pass.
async fn run_group(runtime: Arc<GroupRuntime>) {
    let worker_count = runtime.config.run.concurrency.max(1);
    let workers = (0..worker_count).map(|_| {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            worker_loop(runtime).await;
        })
    });
    for joined in join_all(workers).await {
        if let Err(err) = joined {
            warn!(?err, "replay worker panicked");
        }
    }
}

async fn worker_loop(runtime: Arc<GroupRuntime>) {
    loop {
        if runtime.cancel.is_cancelled() || runtime.aborted.load(Ordering::Acquire) {
            return;
        }

        // Pick-up is gated so that an owed post-crash restart completes
        // before any worker takes new work.
        let planned = {
            let _gate = runtime.pickup_gate.lock().await;
            let restart_owed = runtime
                .tracker
                .lock()
                .map(|mut tracker| tracker.take_restart())
                .unwrap_or(false);
            if restart_owed
                && runtime
                    .supervisor
                    .restart(runtime.config.run.restart_retries, &runtime.env)
                    .await
                    .is_err()
            {
                abort_group(&runtime, "service failed to restart after a crash");
                return;
            }
            let next = runtime
                .queue
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front());
            match next {
                Some(planned) => planned,
                None => return,
            }
        };

        if let Ok(mut tracker) = runtime.tracker.lock() {
            tracker.begin(planned.index);
        }
        let mut result = run_one(&runtime, &planned.case).await;
        let healthy = runtime.supervisor.health_check().await;

        let tainted = match runtime.tracker.lock() {
            Ok(mut tracker) => {
                tracker.finish(planned.index);
                if !healthy {
                    tracker.crash(planned.index);
                }
                tracker.is_tainted(planned.index)
            }
            Err(_) => !healthy,
        };

        if tainted {
            // Provisional result; the retry phase overwrites it.
            result.crashed_server = true;
            runtime.board.store(planned.index, result);
        } else {
            runtime.bus.publish(RunEvent::TestCompleted(result.clone()));
            runtime.board.store(planned.index, result);
        }
    }
}

fn abort_group(runtime: &GroupRuntime, reason: &str) {
    warn!(reason, "aborting environment group");
    runtime.aborted.store(true, Ordering::Release);
    let drained: Vec<PlannedTest> = runtime
        .queue
        .lock()
        .map(|mut queue| queue.drain(..).collect())
        .unwrap_or_default();
    for planned in drained {
        runtime.board.store(
            planned.index,
            TestResult {
                test_id: planned.case.trace_id.clone(),
                passed: false,
                duration_ms: 0,
                deviations: Vec::new(),
                crashed_server: true,
                retried_after_crash: false,
                error: Some(reason.to_string()),
            },
        );
    }
}

/// Sequential retry pass over every test tainted by a crash.
async fn retry_crashed(runtime: Arc<GroupRuntime>) {
    let retries = runtime
        .tracker
        .lock()
        .map(|tracker| tracker.retries())
        .unwrap_or_default();
    if retries.is_empty() {
        return;
    }
    info!(count = retries.len(), "retrying crashed tests sequentially");

    let cases: Vec<PlannedTest> = retries
        .into_iter()
        .filter_map(|index| {
            runtime
                .retry_case(index)
                .map(|case| PlannedTest { index, case })
        })
        .collect();

    for planned in cases {
        if runtime.cancel.is_cancelled() {
            return;
        }
        if !matches!(
            runtime.supervisor.state(),
            SupervisorState::Ready | SupervisorState::Running
        ) && runtime
            .supervisor
            .restart(runtime.config.run.restart_retries, &runtime.env)
            .await
            .is_err()
        {
            // The provisional crashed result stands, with the retry noted.
            if let Some(mut result) = runtime.stored_result(planned.index) {
                result.retried_after_crash = true;
                result.error = Some("service failed to restart before retry".to_string());
                runtime.bus.publish(RunEvent::TestCompleted(result.clone()));
                runtime.board.store(planned.index, result);
            }
            continue;
        }
        runtime.supervisor.mark_running();

        let mut result = run_one(&runtime, &planned.case).await;
        let healthy = runtime.supervisor.health_check().await;
        result.retried_after_crash = true;
        result.crashed_server = !healthy;
        if !healthy {
            result.passed = false;
        }
        runtime.bus.publish(RunEvent::TestCompleted(result.clone()));
        runtime.board.store(planned.index, result);
    }
}

impl GroupRuntime {
    fn retry_case(&self, index: usize) -> Option<Arc<TestCase>> {
        self.cases_by_index.get(&index).cloned()
    }

    fn stored_result(&self, index: usize) -> Option<TestResult> {
        self.board
            .slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(index).cloned().flatten())
    }
}

/// Replays one test: installs its span set, issues the recorded root
/// request, compares the live response against the recording.
async fn run_one(runtime: &GroupRuntime, case: &Arc<TestCase>) -> TestResult {
    runtime.bus.publish(RunEvent::TestStarted {
        trace_id: case.trace_id.clone(),
        name: case.display_name(),
    });
    let started = Instant::now();
    let mut base = TestResult {
        test_id: case.trace_id.clone(),
        passed: false,
        duration_ms: 0,
        deviations: Vec::new(),
        crashed_server: false,
        retried_after_crash: false,
        error: None,
    };

    let Some(method) = case.method() else {
        base.error = Some("recorded root request has no method".to_string());
        return base;
    };
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            base.error = Some(format!("recorded method {method:?} is not a valid HTTP method"));
            return base;
        }
    };

    let session = TestSession::new(case);
    runtime.mock_server.install(session);

    let outcome = issue_root_request(runtime, case, method).await;

    runtime.mock_server.remove(&case.trace_id);
    base.duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(live) => {
            let recorded = ResponseView::from_recorded(&case.root);
            let comparison =
                runtime
                    .comparator
                    .compare(&recorded, &live, case.root.output_schema.as_ref());
            base.passed = comparison.passed;
            base.deviations = comparison.deviations;
        }
        Err(message) => {
            base.error = Some(message);
        }
    }
    base
}

async fn issue_root_request(
    runtime: &GroupRuntime,
    case: &TestCase,
    method: reqwest::Method,
) -> std::result::Result<ResponseView, String> {
    let url = format!(
        "http://127.0.0.1:{}{}",
        runtime.config.service.port,
        case.path()
    );
    let mut request = runtime.http.request(method, &url);
    for (name, value) in case.request_headers() {
        if REQUEST_HEADER_SKIP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = case.request_body() {
        request = match body {
            serde_json::Value::String(text) => request.body(text.clone()),
            other => match serde_json::to_vec(other) {
                Ok(bytes) => request.body(bytes),
                Err(err) => return Err(format!("unserializable recorded body: {err}")),
            },
        };
    }

    let send = async {
        let response = request
            .send()
            .await
            .map_err(|err| format!("live request failed: {err}"))?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("failed reading live response body: {err}"))?;
        Ok(ResponseView::from_parts(
            status,
            headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
            &body,
        ))
    };

    tokio::select! {
        _ = runtime.cancel.cancelled() => Err("cancelled".to_string()),
        outcome = timeout(runtime.config.run.per_test_timeout, send) => match outcome {
            Ok(result) => result,
            Err(_) => Err(format!(
                "live request timed out after {:?}",
                runtime.config.run.per_test_timeout
            )),
        },
    }
}

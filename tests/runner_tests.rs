//! End-to-end runner tests over an in-process transport.
//!
//! All tests run on a paused tokio clock, so minute-long stage plans finish
//! instantly and latencies are exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use throng::loadtest::config::{LoadTestConfig, Stage};
use throng::loadtest::engine::{AbortReason, LoadTestRunner, RunState};
use throng::loadtest::error::RequestError;
use throng::loadtest::executor::{RawResponse, Request, RequestExecutor, Transport};
use throng::loadtest::scenario::VuContext;
use throng::loadtest::threshold::Verdict;
use throng::scenarios::transactions::TransactionScenario;

/// Answers every request with 200 after a fixed delay.
struct FixedLatency {
    latency: Duration,
    requests: Arc<AtomicU64>,
}

#[async_trait]
impl Transport for FixedLatency {
    async fn round_trip(&self, _request: &Request) -> Result<RawResponse, RequestError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(RawResponse {
            status: 200,
            body: b"{}".to_vec(),
        })
    }
}

/// Fails every request at the connection level.
struct Unreachable;

#[async_trait]
impl Transport for Unreachable {
    async fn round_trip(&self, _request: &Request) -> Result<RawResponse, RequestError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Err(RequestError::Network {
            message: "connection refused".to_string(),
        })
    }
}

/// Minimal transaction API: `/api/auth` hands out a token, everything else is 200.
struct FakeApi;

#[async_trait]
impl Transport for FakeApi {
    async fn round_trip(&self, request: &Request) -> Result<RawResponse, RequestError> {
        tokio::time::sleep(Duration::from_millis(8)).await;
        let body = if request.url.ends_with("/api/auth") {
            br#"{"token":"secret"}"#.to_vec()
        } else {
            br#"{"ok":true}"#.to_vec()
        };
        Ok(RawResponse { status: 200, body })
    }
}

const DEFAULT_THRESHOLDS: &str = r#"
[thresholds]
http_req_duration = ["p(95)<50"]
http_req_failed = ["rate<0.0001"]
"#;

fn one_request_scenario() -> Arc<dyn throng::loadtest::scenario::Scenario> {
    Arc::new(|ctx: VuContext| async move {
        let res = ctx
            .request(Request::get("http://api.test/health").name("health"))
            .await;
        ctx.check("status is 200", res.status() == Some(200));
        Ok::<_, anyhow::Error>(())
    })
}

fn config_with(stages: Vec<Stage>, toml_extra: &str) -> LoadTestConfig {
    let mut config = LoadTestConfig::from_toml(toml_extra).unwrap();
    config.stage = stages;
    config
}

#[tokio::test(start_paused = true)]
async fn healthy_target_passes_thresholds() {
    let requests = Arc::new(AtomicU64::new(0));
    let transport = FixedLatency {
        latency: Duration::from_millis(5),
        requests: requests.clone(),
    };
    let config = config_with(
        vec![Stage::new(Duration::from_secs(60), 10)],
        DEFAULT_THRESHOLDS,
    );
    let runner = LoadTestRunner::new(
        config,
        one_request_scenario(),
        RequestExecutor::new(transport, Duration::from_secs(60)),
    )
    .unwrap();

    let report = runner.run().await.unwrap();

    let summary = &report.summary;
    assert!(summary.total_requests > 0);
    assert_eq!(summary.total_requests, requests.load(Ordering::SeqCst));
    assert_eq!(summary.failed_requests, 0);
    assert_eq!(summary.error_rate, 0.0);
    assert_eq!(summary.iterations, summary.total_requests);
    let p95 = summary.duration.percentile(95.0);
    assert!((4.9..=5.1).contains(&p95), "p95 was {p95}");
    assert_eq!(summary.check_totals(), (summary.total_requests, 0));
    assert_eq!(summary.endpoint("health").unwrap().total_requests, summary.total_requests);

    assert_eq!(report.peak_vus, 10);
    assert!(report.aborted.is_none());
    assert!(report.passed());
    assert_eq!(
        report.verdicts.get("http_req_duration: p(95)<50"),
        Some(&Verdict::Pass)
    );
    assert!(report.elapsed >= Duration::from_secs(59));
}

#[tokio::test(start_paused = true)]
async fn unreachable_target_fails_error_rate_threshold() {
    let config = config_with(
        vec![
            Stage::new(Duration::from_secs(10), 3),
            Stage::new(Duration::from_secs(10), 0),
        ],
        r#"
[thresholds]
http_req_duration = ["p(95)<50"]
http_req_failed = ["rate<0.0001"]
http_req_timeouts = ["rate<0.01", "count==0"]
"#,
    );
    let runner = LoadTestRunner::new(
        config,
        one_request_scenario(),
        RequestExecutor::new(Unreachable, Duration::from_secs(60)),
    )
    .unwrap();

    let report = runner.run().await.unwrap();

    let summary = &report.summary;
    assert!(summary.total_requests > 0);
    assert_eq!(summary.failed_requests, summary.total_requests);
    assert_eq!(summary.error_rate, 1.0);
    assert_eq!(
        summary.error_categories.get("network"),
        Some(&summary.total_requests)
    );
    assert_eq!(summary.check_totals(), (0, summary.total_requests));
    assert_eq!(summary.error_categories.get("timeout"), None);
    assert_eq!(
        report.verdicts.get("http_req_timeouts: rate<0.01"),
        Some(&Verdict::Pass)
    );
    assert_eq!(
        report.verdicts.get("http_req_timeouts: count==0"),
        Some(&Verdict::Pass)
    );
    assert!(!report.passed());
    assert_eq!(report.failed_thresholds(), vec!["http_req_failed: rate<0.0001"]);
}

#[tokio::test(start_paused = true)]
async fn empty_plan_completes_without_requests() {
    let requests = Arc::new(AtomicU64::new(0));
    let transport = FixedLatency {
        latency: Duration::from_millis(5),
        requests: requests.clone(),
    };
    let config = config_with(Vec::new(), DEFAULT_THRESHOLDS);
    let runner = LoadTestRunner::new(
        config,
        one_request_scenario(),
        RequestExecutor::new(transport, Duration::from_secs(60)),
    )
    .unwrap();
    let states = runner.watch_state();

    let report = runner.run().await.unwrap();

    assert_eq!(*states.borrow(), RunState::Completed);
    assert_eq!(report.summary.total_requests, 0);
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    assert_eq!(report.peak_vus, 0);
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn abort_drains_and_stops_early() {
    let requests = Arc::new(AtomicU64::new(0));
    let transport = FixedLatency {
        latency: Duration::from_millis(5),
        requests: requests.clone(),
    };
    let config = config_with(vec![Stage::new(Duration::from_secs(600), 20)], "");
    let runner = LoadTestRunner::new(
        config,
        one_request_scenario(),
        RequestExecutor::new(transport, Duration::from_secs(60)),
    )
    .unwrap();
    let abort = runner.abort_handle();
    let metrics = runner.metrics();
    let mut states = runner.watch_state();

    let handle = tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*states.borrow_and_update(), RunState::Ramping);
    abort.cancel();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.aborted, Some(AbortReason::Interrupted));
    assert!(report.elapsed < Duration::from_secs(130));
    assert!(report.summary.total_requests > 0);
    assert_eq!(*states.borrow(), RunState::Completed);

    // Every VU has exited: nothing is recorded after the report.
    let issued = requests.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(requests.load(Ordering::SeqCst), issued);
    assert_eq!(metrics.snapshot().total_requests, report.summary.total_requests);
}

#[tokio::test(start_paused = true)]
async fn abort_on_fail_threshold_stops_the_run() {
    let config = config_with(
        vec![Stage::new(Duration::from_secs(300), 10)],
        r#"
[thresholds]
http_req_failed = [{ threshold = "rate<0.5", abort_on_fail = true }]
"#,
    );
    let runner = LoadTestRunner::new(
        config,
        one_request_scenario(),
        RequestExecutor::new(Unreachable, Duration::from_secs(60)),
    )
    .unwrap();

    let report = runner.run().await.unwrap();

    assert_eq!(
        report.aborted,
        Some(AbortReason::Threshold("http_req_failed: rate<0.5".to_string()))
    );
    assert!(report.elapsed < Duration::from_secs(300));
    assert!(!report.passed());
}

#[tokio::test(start_paused = true)]
async fn transaction_workload_runs_every_endpoint() {
    let config = config_with(
        vec![
            Stage::new(Duration::from_secs(20), 5),
            Stage::new(Duration::from_secs(10), 0),
        ],
        r#"
[thresholds]
"http_req_duration{name:buy}" = ["p(95)<50"]
checks = ["rate>0.99"]
iterations = ["count>0"]
"#,
    );
    let runner = LoadTestRunner::new(
        config,
        Arc::new(TransactionScenario::new("http://api.test")),
        RequestExecutor::new(FakeApi, Duration::from_secs(60)),
    )
    .unwrap();

    let report = runner.run().await.unwrap();

    let summary = &report.summary;
    assert!(summary.iterations > 0);
    assert_eq!(summary.total_requests, summary.iterations * 4);
    for name in ["auth", "buy", "info", "send"] {
        assert_eq!(
            summary.endpoint(name).unwrap().total_requests,
            summary.iterations,
            "endpoint {name}"
        );
    }
    assert_eq!(summary.check_totals(), (summary.iterations * 6, 0));
    assert!(report.passed(), "verdicts: {:?}", report.verdicts);
}

//! Demonstration of the LoadTestRunner with a custom closure scenario.
//!
//! Ramps to a handful of virtual users against an HTTP API and prints the
//! results and threshold verdicts.
//!
//! Usage:
//!   cargo run --example engine_demo -- http://localhost:8080
//!
//! If no URL is provided, defaults to http://localhost:8080.

use std::sync::Arc;

use throng::loadtest::config::LoadTestConfig;
use throng::loadtest::engine::LoadTestRunner;
use throng::loadtest::executor::Request;
use throng::loadtest::scenario::VuContext;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let toml_config = r#"
[settings]
timeout = "3s"
think_time = "500ms"

[[stage]]
duration = "5s"
target = 4

[[stage]]
duration = "5s"
target = 4

[[stage]]
duration = "3s"
target = 0

[thresholds]
http_req_duration = ["p(95)<50"]
http_req_failed = ["rate<0.0001"]
checks = ["rate>0.95"]
"#;

    let config = LoadTestConfig::from_toml(toml_config).expect("Failed to parse config");

    println!("Starting load test against {}", url);
    println!("  Stages:     {}", config.stage.len());
    println!("  Duration:   {:?}", config.total_duration());
    println!();

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let scenario = move |ctx: VuContext| {
        let health_url = health_url.clone();
        async move {
            let res = ctx.request(Request::get(health_url).name("health")).await;
            ctx.check("status is 200", res.status() == Some(200));
            Ok::<_, anyhow::Error>(())
        }
    };

    let runner = LoadTestRunner::with_reqwest(config, Arc::new(scenario))
        .expect("Failed to build runner")
        .with_ctrl_c(true);

    match runner.run().await {
        Ok(report) => {
            let summary = &report.summary;
            println!();
            println!("=== Load Test Complete ===");
            println!("  Elapsed:     {:.1}s", report.elapsed.as_secs_f64());
            println!("  Peak VUs:    {}", report.peak_vus);
            println!("  Total reqs:  {}", summary.total_requests);
            println!("  Failed:      {}", summary.failed_requests);
            println!("  Error rate:  {:.1}%", summary.error_rate * 100.0);
            println!("  Median:      {:.2}ms", summary.duration.med());
            println!("  P95:         {:.2}ms", summary.duration.percentile(95.0));
            println!("  Throughput:  {:.1} req/s", summary.request_rate());
            println!();
            for (name, verdict) in &report.verdicts {
                println!("  {verdict} {name}");
            }
        },
        Err(e) => {
            eprintln!("Load test failed: {}", e);
            std::process::exit(1);
        },
    }
}

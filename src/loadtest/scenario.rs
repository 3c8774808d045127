//! The user-supplied unit of work run by every virtual user.
//!
//! A [`Scenario`] performs one logical iteration (e.g. authenticate, buy an
//! item, send coins) through the [`VuContext`] it is handed. Requests made
//! through the context are timed and recorded automatically; named checks
//! are tallied alongside them.
//!
//! Closures work directly:
//!
//! ```no_run
//! use throng::loadtest::executor::Request;
//! use throng::loadtest::scenario::{Scenario, VuContext};
//!
//! let scenario = |ctx: VuContext| async move {
//!     let res = ctx.request(Request::get("http://localhost:8080/health")).await;
//!     ctx.check("status is 200", res.status() == Some(200));
//!     Ok::<_, anyhow::Error>(())
//! };
//! # fn assert_scenario<S: Scenario>(_: &S) {}
//! # assert_scenario(&scenario);
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::loadtest::executor::{Request, RequestExecutor, Response};
use crate::loadtest::metrics::MetricsRecorder;

/// One iteration of virtual-user behaviour.
///
/// Returning `Err` (or panicking) is recorded as a scenario error; the
/// virtual user then continues with its next iteration.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Run a single iteration.
    async fn run(&self, ctx: VuContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Scenario for F
where
    F: Fn(VuContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: VuContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Per-iteration handle given to a [`Scenario`].
#[derive(Clone)]
pub struct VuContext {
    vu_id: u32,
    iteration: u64,
    executor: Arc<RequestExecutor>,
    metrics: Arc<Mutex<MetricsRecorder>>,
}

impl VuContext {
    /// Creates a context recording into `metrics`.
    pub fn new(
        vu_id: u32,
        iteration: u64,
        executor: Arc<RequestExecutor>,
        metrics: Arc<Mutex<MetricsRecorder>>,
    ) -> Self {
        Self {
            vu_id,
            iteration,
            executor,
            metrics,
        }
    }

    /// Id of the virtual user running this iteration.
    pub fn vu_id(&self) -> u32 {
        self.vu_id
    }

    /// Zero-based iteration number within this virtual user.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Send `request` and record its outcome.
    pub async fn request(&self, request: Request) -> Response {
        let response = self.executor.send(request).await;
        self.metrics.lock().record(&response.outcome);
        response
    }

    /// Record a named check and return `passed`.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.metrics.lock().record_check(name, passed);
        passed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::loadtest::error::RequestError;
    use crate::loadtest::executor::{RawResponse, Transport};

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn round_trip(&self, request: &Request) -> Result<RawResponse, RequestError> {
            let status = if request.url.ends_with("/missing") { 404 } else { 200 };
            Ok(RawResponse {
                status,
                body: b"ok".to_vec(),
            })
        }
    }

    fn context() -> (VuContext, Arc<Mutex<MetricsRecorder>>) {
        let metrics = Arc::new(Mutex::new(MetricsRecorder::new(None)));
        let executor = Arc::new(RequestExecutor::new(Echo, Duration::from_secs(1)));
        (VuContext::new(7, 3, executor, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_closure_scenario_records_requests_and_checks() {
        let scenario = |ctx: VuContext| async move {
            let res = ctx.request(Request::get("http://api.test/ok").name("ok")).await;
            ctx.check("status is 200", res.status() == Some(200));
            let res = ctx.request(Request::get("http://api.test/missing")).await;
            ctx.check("status is 200", res.status() == Some(200));
            Ok::<_, anyhow::Error>(())
        };
        let (ctx, metrics) = context();
        assert_eq!(ctx.vu_id(), 7);
        assert_eq!(ctx.iteration(), 3);

        scenario.run(ctx).await.unwrap();

        let summary = metrics.lock().summary(Duration::ZERO);
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.check_totals(), (1, 1));
        assert_eq!(summary.endpoint("ok").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_trait_object_scenario() {
        struct Failing;

        #[async_trait]
        impl Scenario for Failing {
            async fn run(&self, _ctx: VuContext) -> anyhow::Result<()> {
                anyhow::bail!("no token")
            }
        }

        let scenario: Arc<dyn Scenario> = Arc::new(Failing);
        let (ctx, _) = context();
        let err = scenario.run(ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "no token");
    }
}

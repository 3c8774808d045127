//! Coin-transaction load: login, buy, send, info.

use anyhow::anyhow;
use async_trait::async_trait;
use rand::RngExt;
use serde::{Deserialize, Serialize};

use super::{login_request, normalize_base_url, ACCEPTABLE_LATENCY};
use crate::loadtest::executor::{Request, Response};
use crate::loadtest::scenario::{Scenario, VuContext};

/// Merchandise ids and prices in coins.
pub const ITEMS: [(&str, u32); 10] = [
    ("t-shirt", 80),
    ("cup", 20),
    ("book", 50),
    ("pen", 10),
    ("powerbank", 200),
    ("hoody", 300),
    ("umbrella", 200),
    ("socks", 10),
    ("wallet", 50),
    ("pink-hoody", 500),
];

/// Recipients are `user_1` through `user_{RECIPIENTS}`.
pub const RECIPIENTS: u32 = 10;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendCoins {
    recipient: String,
    amount: u32,
}

/// Logs in, then exercises the buy, send and info endpoints with the token.
#[derive(Debug, Clone)]
pub struct TransactionScenario {
    base_url: String,
}

impl TransactionScenario {
    /// Creates the scenario for the API at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
        }
    }

    async fn authenticate(&self, ctx: &VuContext) -> anyhow::Result<Option<String>> {
        let res = ctx.request(login_request(&self.base_url)?).await;
        if res.status() != Some(200) {
            return Ok(None);
        }
        Ok(res.json::<AuthResponse>().ok().and_then(|r| r.token))
    }

    fn authorized(&self, request: Request, token: &str) -> Request {
        request
            .header("Content-Type", "application/json")
            .bearer_auth(token)
    }
}

fn check_response(ctx: &VuContext, label: &str, res: &Response) {
    ctx.check(&format!("{label} request successful"), res.status() == Some(200));
    ctx.check("Response time < 50ms", res.duration() < ACCEPTABLE_LATENCY);
}

#[async_trait]
impl Scenario for TransactionScenario {
    async fn run(&self, ctx: VuContext) -> anyhow::Result<()> {
        let token = self
            .authenticate(&ctx)
            .await?
            .ok_or_else(|| anyhow!("Failed to authenticate"))?;

        let (item, send) = {
            let mut rng = rand::rng();
            let (item, _) = ITEMS[rng.random_range(0..ITEMS.len())];
            let send = SendCoins {
                recipient: format!("user_{}", rng.random_range(1..=RECIPIENTS)),
                amount: rng.random_range(1..=100),
            };
            (item, send)
        };

        let buy = Request::get(format!("{}/transactions/buy/{item}", self.base_url)).name("buy");
        let res = ctx.request(self.authorized(buy, &token)).await;
        check_response(&ctx, "Buy", &res);

        let transfer = Request::post(format!("{}/transactions/send", self.base_url))
            .name("send")
            .bearer_auth(&token)
            .json(&send)?;
        let res = ctx.request(transfer).await;
        check_response(&ctx, "Send", &res);

        let info = Request::get(format!("{}/transactions/info", self.base_url)).name("info");
        let res = ctx.request(self.authorized(info, &token)).await;
        check_response(&ctx, "Info", &res);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::loadtest::error::RequestError;
    use crate::loadtest::executor::{RawResponse, RequestExecutor, Transport};
    use crate::loadtest::metrics::MetricsRecorder;

    struct FakeApi {
        seen: Arc<Mutex<Vec<Request>>>,
        auth_body: &'static str,
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn round_trip(&self, request: &Request) -> Result<RawResponse, RequestError> {
            self.seen.lock().push(request.clone());
            let body = if request.url.ends_with("/api/auth") {
                self.auth_body.as_bytes().to_vec()
            } else {
                b"{}".to_vec()
            };
            Ok(RawResponse { status: 200, body })
        }
    }

    fn context(auth_body: &'static str) -> (VuContext, Arc<Mutex<Vec<Request>>>, Arc<Mutex<MetricsRecorder>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = RequestExecutor::new(
            FakeApi {
                seen: seen.clone(),
                auth_body,
            },
            Duration::from_secs(1),
        );
        let metrics = Arc::new(Mutex::new(MetricsRecorder::new(None)));
        (
            VuContext::new(0, 0, Arc::new(executor), metrics.clone()),
            seen,
            metrics,
        )
    }

    fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn test_full_iteration_uses_token() {
        let (ctx, seen, metrics) = context(r#"{"token":"abc123"}"#);
        TransactionScenario::new("http://api.test")
            .run(ctx)
            .await
            .unwrap();

        let requests = seen.lock().clone();
        assert_eq!(requests.len(), 4);
        assert!(requests[1].url.starts_with("http://api.test/transactions/buy/"));
        let item = requests[1].url.rsplit('/').next().unwrap();
        assert!(ITEMS.iter().any(|(id, _)| *id == item));
        assert_eq!(requests[2].url, "http://api.test/transactions/send");
        assert_eq!(requests[3].url, "http://api.test/transactions/info");
        for request in &requests[1..] {
            assert_eq!(header(request, "Authorization"), Some("Bearer abc123"));
            assert_eq!(header(request, "Content-Type"), Some("application/json"));
        }

        let body: serde_json::Value =
            serde_json::from_slice(requests[2].body.as_ref().unwrap()).unwrap();
        let amount = body["amount"].as_u64().unwrap();
        assert!((1..=100).contains(&amount));
        let recipient: u32 = body["recipient"]
            .as_str()
            .unwrap()
            .strip_prefix("user_")
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=RECIPIENTS).contains(&recipient));

        let summary = metrics.lock().summary(Duration::ZERO);
        assert_eq!(summary.total_requests, 4);
        let names: Vec<_> = summary.per_endpoint.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["auth", "buy", "info", "send"]);
        assert_eq!(summary.check_totals(), (6, 0));
    }

    #[tokio::test]
    async fn test_missing_token_stops_the_iteration() {
        let (ctx, seen, _) = context(r#"{"error":"nope"}"#);
        let err = TransactionScenario::new("http://api.test")
            .run(ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to authenticate");
        assert_eq!(seen.lock().len(), 1);
    }
}

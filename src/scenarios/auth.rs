//! Authentication load: one login per iteration.

use async_trait::async_trait;

use super::{login_request, normalize_base_url, ACCEPTABLE_LATENCY};
use crate::loadtest::scenario::{Scenario, VuContext};

/// Posts fresh random credentials to `/api/auth`.
#[derive(Debug, Clone)]
pub struct AuthScenario {
    base_url: String,
}

impl AuthScenario {
    /// Creates the scenario for the API at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
        }
    }
}

#[async_trait]
impl Scenario for AuthScenario {
    async fn run(&self, ctx: VuContext) -> anyhow::Result<()> {
        let res = ctx.request(login_request(&self.base_url)?).await;
        ctx.check("status is 200", res.status() == Some(200));
        ctx.check(
            "response time is acceptable",
            res.duration() < ACCEPTABLE_LATENCY,
        );
        Ok(())
    }
}

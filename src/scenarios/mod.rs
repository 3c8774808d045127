//! Built-in scenarios for the authentication and coin-transaction API.
//!
//! - [`auth::AuthScenario`] logs in with fresh random credentials every
//!   iteration.
//! - [`transactions::TransactionScenario`] logs in, then buys an item, sends
//!   coins to another user and reads the account info.
//!
//! Both check for a 200 status and a round trip under
//! [`ACCEPTABLE_LATENCY`].

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use serde::Serialize;

use crate::loadtest::executor::Request;
use crate::loadtest::scenario::Scenario;

pub mod auth;
pub mod transactions;

/// Per-request latency the built-in checks accept.
pub const ACCEPTABLE_LATENCY: Duration = Duration::from_millis(50);

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Random lowercase ASCII string of `len` characters.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| LOWERCASE[rng.random_range(0..LOWERCASE.len())] as char)
        .collect()
}

#[derive(Debug, Serialize)]
struct Credentials {
    username: String,
    password: String,
}

/// `POST {base_url}/api/auth` with a random `user_*` / `pass_*` pair.
pub fn login_request(base_url: &str) -> Result<Request, serde_json::Error> {
    let credentials = Credentials {
        username: format!("user_{}", random_string(8)),
        password: format!("pass_{}", random_string(12)),
    };
    Request::post(format!("{base_url}/api/auth"))
        .name("auth")
        .json(&credentials)
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Scenarios selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BuiltinScenario {
    /// Log in with random credentials.
    Auth,
    /// Log in, buy, send coins, read info.
    Transactions,
}

impl BuiltinScenario {
    /// Instantiate the scenario against `base_url`.
    pub fn build(self, base_url: &str) -> Arc<dyn Scenario> {
        match self {
            Self::Auth => Arc::new(auth::AuthScenario::new(base_url)),
            Self::Transactions => Arc::new(transactions::TransactionScenario::new(base_url)),
        }
    }
}

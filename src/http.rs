use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("property-onboarding/", env!("CARGO_PKG_VERSION"));

/// Shared client for the remote collaborators. Timeouts come from
/// `HTTP_TIMEOUT_SECS` (default 15) and `HTTP_CONNECT_TIMEOUT_SECS` (default 5).
pub fn build_client() -> Client {
    let timeout = secs_from(std::env::var("HTTP_TIMEOUT_SECS").ok(), 15);
    let connect = secs_from(std::env::var("HTTP_CONNECT_TIMEOUT_SECS").ok(), 5);
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn secs_from(raw: Option<String>, default: u64) -> Duration {
    let secs = raw
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

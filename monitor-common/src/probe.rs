use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::check::{CheckResult, Outcome, Target};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to build the http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Executes a single probe against a target. Failures are part of the returned
/// `CheckResult`, never an error.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, target: &Target) -> CheckResult;
}

/// Probes with one HTTP GET, using basic auth when credentials are configured.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Every probe is bounded by `request_timeout`, otherwise a stuck endpoint pins
    /// its worker and any shutdown waiting on that worker.
    pub fn new(request_timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("*/*"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("ws-monitor probe")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, target: &Target) -> CheckResult {
        let checked_at = Utc::now();
        let started = Instant::now();

        let mut request = self.client.get(&target.address);
        if target.has_credentials() {
            request = request.basic_auth(&target.login, Some(&target.password));
        }
        let response = request.send().await;
        let duration = started.elapsed();

        let result = match response {
            Ok(response) => CheckResult::responded(
                &target.address,
                checked_at,
                duration,
                response.status().as_u16(),
            ),
            Err(error) => CheckResult::unreachable(
                &target.address,
                checked_at,
                duration,
                describe(&error),
            ),
        };

        match result.outcome() {
            Outcome::Up => info!(
                address = %target.address,
                status = result.status_code,
                duration_secs = duration.as_secs_f64(),
                "probe succeeded"
            ),
            Outcome::Down => warn!(
                address = %target.address,
                status = result.status_code,
                duration_secs = duration.as_secs_f64(),
                "probe answered with a failure status"
            ),
            Outcome::Unreachable => warn!(
                address = %target.address,
                error = %result.error,
                "probe could not reach the endpoint"
            ),
        }
        debug!(?result, "probe result");

        result
    }
}

/// reqwest keeps the useful part of connection errors in the source chain.
fn describe(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn probe() -> HttpProbe {
        HttpProbe::new(Duration::from_secs(5)).expect("failed to build probe")
    }

    #[tokio::test]
    async fn test_check_reports_ok_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/health")
                // admin:secret
                .header("authorization", "Basic YWRtaW46c2VjcmV0");
            then.status(200).body("ok");
        });

        let target = Target::new(&server.url("/health"), "admin", "secret");
        let result = probe().check(&target).await;

        mock.assert();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.error, "");
        assert_eq!(result.address, target.address);
        assert_eq!(result.outcome(), Outcome::Up);
        assert!(!result.checked_at.is_empty());
    }

    #[tokio::test]
    async fn test_check_records_failure_status_as_data() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        });

        let result = probe()
            .check(&Target::new(&server.url("/health"), "u", "p"))
            .await;

        assert_eq!(result.status_code, 503);
        assert_eq!(result.error, "");
        assert_eq!(result.outcome(), Outcome::Down);
    }

    #[tokio::test]
    async fn test_check_connection_failure() {
        // Grab a free port, then close the listener so nothing answers on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}/health", listener.local_addr().unwrap());
        drop(listener);

        let result = probe().check(&Target::new(&address, "u", "p")).await;

        assert_eq!(result.status_code, 0);
        assert!(!result.error.is_empty());
        assert_eq!(result.outcome(), Outcome::Unreachable);
    }

    #[tokio::test]
    async fn test_check_invalid_address() {
        let result = probe().check(&Target::new("not a url", "", "")).await;

        assert_eq!(result.status_code, 0);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn test_check_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(2));
        });

        let probe = HttpProbe::new(Duration::from_millis(100)).unwrap();
        let result = probe
            .check(&Target::new(&server.url("/slow"), "", ""))
            .await;

        assert_eq!(result.status_code, 0);
        assert!(!result.error.is_empty());
        assert!(result.duration < Duration::from_secs(2));
    }
}

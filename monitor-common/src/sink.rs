use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use reqwest::header;
use thiserror::Error;

use crate::check::CheckResult;
use crate::probe::ClientError;

/// Enumeration of errors that can happen while forwarding one result.
/// None of them is retried: the next cycle produces a fresh result anyway.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("{0} is not a valid collector url")]
    ParseUrlError(String),
    #[error("failed to send the result to the collector: {0}")]
    RequestError(reqwest::Error),
    #[error("the collector rejected the result with status {0}")]
    StatusError(StatusCode),
}

/// Delivers check results to the collector, at most once per result.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn forward(
        &self,
        method: Method,
        url: &str,
        result: &CheckResult,
    ) -> Result<StatusCode, ForwardError>;
}

/// Sends each result as a JSON body in one HTTP request.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(request_timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("ws-monitor forwarder")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn forward(
        &self,
        method: Method,
        url: &str,
        result: &CheckResult,
    ) -> Result<StatusCode, ForwardError> {
        let url: reqwest::Url = url
            .parse()
            .map_err(|_| ForwardError::ParseUrlError(url.to_owned()))?;

        let response = self
            .client
            .request(method, url)
            .json(result)
            .send()
            .await
            .map_err(ForwardError::RequestError)?;

        let status = response.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(ForwardError::StatusError(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;

    fn result() -> CheckResult {
        CheckResult::responded("http://x/health", Utc::now(), Duration::from_millis(12), 200)
    }

    fn sink() -> HttpSink {
        HttpSink::new(Duration::from_secs(5)).expect("failed to build sink")
    }

    #[tokio::test]
    async fn test_forward_posts_json_result() {
        let server = MockServer::start();
        let result = result();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/imd")
                .header("content-type", "application/json")
                .json_body(serde_json::to_value(&result).unwrap());
            then.status(200);
        });

        let status = sink()
            .forward(Method::POST, &server.url("/api/imd"), &result)
            .await
            .expect("forward failed");

        mock.assert();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forward_collector_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/imd");
            then.status(500);
        });

        let error = sink()
            .forward(Method::POST, &server.url("/api/imd"), &result())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ForwardError::StatusError(StatusCode::INTERNAL_SERVER_ERROR)
        ));
    }

    #[tokio::test]
    async fn test_forward_unreachable_collector() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/imd", listener.local_addr().unwrap());
        drop(listener);

        let error = sink()
            .forward(Method::POST, &url, &result())
            .await
            .unwrap_err();

        assert!(matches!(error, ForwardError::RequestError(_)));
    }

    #[tokio::test]
    async fn test_forward_invalid_url() {
        let error = sink()
            .forward(Method::POST, "::not a url::", &result())
            .await
            .unwrap_err();

        assert!(matches!(error, ForwardError::ParseUrlError(_)));
    }
}

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An endpoint to probe, together with the basic credentials to present.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub login: String,
    pub password: String,
}

impl Target {
    pub fn new(address: &str, login: &str, password: &str) -> Self {
        Self {
            address: address.to_owned(),
            login: login.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Credentials are only sent when at least one half is configured.
    pub fn has_credentials(&self) -> bool {
        !self.login.is_empty() || !self.password.is_empty()
    }
}

/// Passwords never end up in logs.
impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Target")
            .field("address", &self.address)
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

/// Outcome of one probe, as forwarded to the collector.
///
/// `status` is the HTTP status code of the probed endpoint, or 0 when no response
/// was received, in which case `error` carries the transport error. Both fields
/// are always serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// RFC 3339 wall-clock time at which the probe started.
    #[serde(rename = "time")]
    pub checked_at: String,
    /// Serialized as integer nanoseconds, which is what the collector expects.
    #[serde(
        serialize_with = "serialize_duration_nanos",
        deserialize_with = "deserialize_duration_nanos"
    )]
    pub duration: Duration,
    pub address: String,
    #[serde(rename = "status")]
    pub status_code: u16,
    pub error: String,
}

impl CheckResult {
    /// The endpoint answered, whatever the status code.
    pub fn responded(
        address: &str,
        checked_at: DateTime<Utc>,
        duration: Duration,
        status_code: u16,
    ) -> Self {
        Self {
            checked_at: format_timestamp(checked_at),
            duration,
            address: address.to_owned(),
            status_code,
            error: String::new(),
        }
    }

    /// No response was received.
    pub fn unreachable(
        address: &str,
        checked_at: DateTime<Utc>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            checked_at: format_timestamp(checked_at),
            duration,
            address: address.to_owned(),
            status_code: 0,
            error: error.into(),
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self.status_code {
            0 => Outcome::Unreachable,
            200..=299 => Outcome::Up,
            _ => Outcome::Down,
        }
    }
}

/// Coarse classification used for metric labels and log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Up,
    Down,
    Unreachable,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Up => "up",
            Outcome::Down => "down",
            Outcome::Unreachable => "unreachable",
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn serialize_duration_nanos<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
    serializer.serialize_u64(nanos)
}

fn deserialize_duration_nanos<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let nanos = u64::deserialize(deserializer)?;
    Ok(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_serialized_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let result = CheckResult::responded(
            "http://x/health",
            at,
            Duration::from_millis(1500),
            200,
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "time": "2024-03-01T12:30:05Z",
                "duration": 1_500_000_000u64,
                "address": "http://x/health",
                "status": 200,
                "error": "",
            })
        );
    }

    #[test]
    fn test_outcome_classes() {
        let at = Utc::now();
        let up = CheckResult::responded("a", at, Duration::ZERO, 204);
        let down = CheckResult::responded("a", at, Duration::ZERO, 503);
        let unreachable = CheckResult::unreachable("a", at, Duration::ZERO, "connection refused");

        assert_eq!(up.outcome(), Outcome::Up);
        assert_eq!(down.outcome(), Outcome::Down);
        assert!(down.error.is_empty());
        assert_eq!(unreachable.outcome(), Outcome::Unreachable);
        assert_eq!(unreachable.status_code, 0);
        assert_eq!(unreachable.error, "connection refused");
    }

    #[test]
    fn test_target_debug_hides_password() {
        let target = Target::new("http://x/health", "admin", "hunter2");
        let rendered = format!("{:?}", target);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
        assert!(target.has_credentials());
        assert!(!Target::new("http://x", "", "").has_credentials());
    }
}

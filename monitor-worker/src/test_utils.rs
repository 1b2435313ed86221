use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::{Method, StatusCode};
use monitor_common::check::{CheckResult, Target};
use monitor_common::config::{Config, ConfigError, ConfigSource, Reload, ServiceSpec};
use monitor_common::probe::Probe;
use monitor_common::sink::{ForwardError, Sink};
use tokio::time::Instant;

/// Probing this address panics inside the worker task.
pub const PANIC_ADDRESS: &str = "http://panic.invalid/health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Started(String),
    Finished(String),
}

/// Answers 200 for every target after an optional per-address delay, and
/// records when each probe started and finished.
#[derive(Clone, Default)]
pub struct RecordingProbe {
    events: Arc<Mutex<Vec<(Instant, ProbeEvent)>>>,
    delays: HashMap<String, Duration>,
}

impl RecordingProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, address: &str, delay: Duration) -> Self {
        self.delays.insert(address.to_owned(), delay);
        self
    }

    pub fn events(&self) -> Vec<(Instant, ProbeEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn starts(&self, address: &str) -> Vec<Instant> {
        self.events()
            .into_iter()
            .filter_map(|(at, event)| match event {
                ProbeEvent::Started(a) if a == address => Some(at),
                _ => None,
            })
            .collect()
    }

    pub fn finishes(&self, address: &str) -> Vec<Instant> {
        self.events()
            .into_iter()
            .filter_map(|(at, event)| match event {
                ProbeEvent::Finished(a) if a == address => Some(at),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: ProbeEvent) {
        self.events.lock().unwrap().push((Instant::now(), event));
    }
}

#[async_trait]
impl Probe for RecordingProbe {
    async fn check(&self, target: &Target) -> CheckResult {
        if target.address == PANIC_ADDRESS {
            panic!("probe exploded");
        }

        let delay = self
            .delays
            .get(&target.address)
            .copied()
            .unwrap_or_default();

        self.record(ProbeEvent::Started(target.address.clone()));
        tokio::time::sleep(delay).await;
        self.record(ProbeEvent::Finished(target.address.clone()));

        CheckResult::responded(&target.address, Utc::now(), delay, 200)
    }
}

/// Accepts (or rejects, when failing) every result and keeps what it was sent.
#[derive(Clone, Default)]
pub struct RecordingSink {
    forwarded: Arc<Mutex<Vec<(String, CheckResult)>>>,
    attempts: Arc<Mutex<usize>>,
    failing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn forwarded(&self) -> Vec<(String, CheckResult)> {
        self.forwarded.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn forward(
        &self,
        method: Method,
        url: &str,
        result: &CheckResult,
    ) -> Result<StatusCode, ForwardError> {
        assert_eq!(method, Method::POST);
        *self.attempts.lock().unwrap() += 1;

        if self.failing {
            return Err(ForwardError::StatusError(StatusCode::INTERNAL_SERVER_ERROR));
        }
        self.forwarded
            .lock()
            .unwrap()
            .push((url.to_owned(), result.clone()));
        Ok(StatusCode::OK)
    }
}

/// Hands out queued reload outcomes, then `NotModified` forever.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Result<Reload, ConfigError>>>>,
    polls: Arc<Mutex<usize>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Result<Reload, ConfigError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

impl ConfigSource for ScriptedSource {
    fn reload(&mut self) -> Result<Reload, ConfigError> {
        *self.polls.lock().unwrap() += 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Reload::NotModified))
    }
}

pub fn service(address: &str, check_interval: u64, enabled: bool) -> ServiceSpec {
    ServiceSpec {
        address: address.to_owned(),
        login: String::new(),
        password: String::new(),
        enabled,
        check_interval,
    }
}

pub fn config(reload_config_interval: u64, services: Vec<ServiceSpec>) -> Config {
    Config {
        reload_config_interval,
        log_level: "INFO".to_owned(),
        log_filename: String::new(),
        data_collector_url: None,
        services,
    }
}

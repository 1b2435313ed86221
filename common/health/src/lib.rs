use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of the monitor.
///
/// The monitor is only useful while its supervision loop keeps turning:
/// a loop stuck on a reload, or blocked waiting for a worker that never
/// acknowledges, stops reconciling configuration even though the process
/// is still up.
///
/// Every loop registers a component with a deadline and must report
/// healthy more often than that deadline. The registry folds the
/// components into one status:
///   - no component registered yet: unhealthy
///   - any component unhealthy, starting, or past its deadline: unhealthy
///   - every component reported healthy recently: healthy
///
/// The resulting `HealthStatus` is an axum response, so the registry can be
/// mounted directly on `/_liveness`.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy
    pub healthy: bool,
    /// Status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first heartbeat
    Starting,
    /// Heartbeat received, valid until the given instant
    HealthyUntil(time::OffsetDateTime),
    /// Component reported itself unhealthy
    Unhealthy,
    /// Heartbeat deadline passed without a new report
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy_at(&self, now: time::OffsetDateTime) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > now)
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

/// Handed to a component at registration; the component calls
/// `report_healthy` from inside its loop.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Report healthy until now + deadline. Returns once the report is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Create a registry and spawn the task applying status reports.
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => _ = map.insert(message.component, message.status),
                    // Probes will fail from now on and the process gets restarted
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component, starting in `Starting`. The returned handle goes
    /// to the component so it can report on its own schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Fold all component statuses into the process status. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(_) if !status.is_healthy_at(now) => {
                    ComponentStatus::Stalled
                }
                other => other.clone(),
            };
            if !status.is_healthy_at(now) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), status);
        }

        if result.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

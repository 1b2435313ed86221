use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use monitor_common::config::{Config, ConfigSource, Reload};
use monitor_common::logging::Logging;
use monitor_common::probe::Probe;
use monitor_common::sink::Sink;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::worker::{Assignment, Worker, WorkerContext, WorkerExit, WorkerId};

/// Liveness signals buffered between the workers and the supervisor loop.
/// Workers drop signals rather than wait when this is full.
const LIVENESS_BUFFER: usize = 1024;

/// Stand-in start for tickers whose first tick is past what the clock can hold.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Asks the supervisor loop to tear down every worker and stop.
#[derive(Debug)]
pub struct ShutdownRequest {
    ack: oneshot::Sender<ShutdownReport>,
}

/// How a teardown went: every worker that was live should have acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub live: usize,
    pub acknowledged: usize,
}

/// One generation of workers, indexed like the `services` of the config they
/// were spawned from. Disabled services keep an empty slot.
#[derive(Debug, Default)]
pub struct WorkersList {
    slots: Vec<Option<Worker>>,
}

impl WorkersList {
    fn spawn(config: &Config, collector_url: &str, ids: &mut IdSequence, context: &WorkerContext) -> Self {
        let slots = config
            .services
            .iter()
            .map(|service| {
                if !service.enabled {
                    debug!(address = %service.address, "service disabled, not spawning a worker");
                    return None;
                }

                let id = ids.next();
                let assignment = Assignment {
                    target: service.target(),
                    interval: service.check_interval(),
                    collector_url: collector_url.to_owned(),
                };
                info!(worker = %id, address = %service.address, "spawning worker");
                Some(Worker::spawn(id, assignment, context))
            })
            .collect();

        Self { slots }
    }

    pub fn slots(&self) -> &[Option<Worker>] {
        &self.slots
    }

    pub fn live(&self) -> impl Iterator<Item = &Worker> {
        self.slots.iter().flatten().filter(|worker| worker.state)
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    fn get_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|worker| worker.id == id)
    }

    /// Stop every live worker, one after the other, waiting for each
    /// acknowledgement before moving to the next worker. Each wait can last a
    /// whole probe and forward, so `health` is reported before every worker.
    async fn shutdown_all(&mut self, health: &HealthHandle) -> ShutdownReport {
        let mut report = ShutdownReport {
            live: 0,
            acknowledged: 0,
        };

        for worker in self.slots.iter_mut().flatten().filter(|worker| worker.state) {
            report.live += 1;
            health.report_healthy().await;
            match worker.shutdown().await {
                Ok(ack) => {
                    debug!(worker = %ack.worker, "worker acknowledged shutdown");
                    report.acknowledged += 1;
                }
                Err(error) => warn!("worker did not acknowledge shutdown: {}", error),
            }
        }

        report
    }
}

/// Hands out worker ids, strictly increasing for the lifetime of the process.
#[derive(Debug, Default)]
struct IdSequence {
    last: u64,
}

impl IdSequence {
    fn next(&mut self) -> WorkerId {
        self.last += 1;
        WorkerId(self.last)
    }
}

/// Owns the current configuration and the worker generation spawned from it.
/// Only the supervisor loop mutates either of them.
pub struct Supervisor<C> {
    state: SupervisorState,
    config: Config,
    source: C,
    logging: Logging,
    default_collector_url: String,
    workers: WorkersList,
    ids: IdSequence,
    context: WorkerContext,
    liveness: mpsc::Receiver<WorkerId>,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    health: HealthHandle,
    shutting_down: Arc<AtomicBool>,
}

impl<C: ConfigSource + 'static> Supervisor<C> {
    /// `config` must be the snapshot `logging` was initialized from.
    pub fn new(
        config: Config,
        source: C,
        logging: Logging,
        probe: Arc<dyn Probe>,
        sink: Arc<dyn Sink>,
        health: HealthHandle,
        default_collector_url: String,
    ) -> Self {
        let (liveness_tx, liveness) = mpsc::channel(LIVENESS_BUFFER);
        let (exits_tx, exits) = mpsc::unbounded_channel();

        Self {
            state: SupervisorState::Idle,
            config,
            source,
            logging,
            default_collector_url,
            workers: WorkersList::default(),
            ids: IdSequence::default(),
            context: WorkerContext {
                probe,
                sink,
                liveness: liveness_tx,
                exits: exits_tx,
            },
            liveness,
            exits,
            health,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workers(&self) -> &WorkersList {
        &self.workers
    }

    /// Spawn the first generation of workers and run the supervisor loop in
    /// the background.
    pub fn startup(mut self) -> SupervisorHandle {
        let (requests, shutdown) = mpsc::channel(1);
        let shutting_down = self.shutting_down.clone();

        self.start_workers();
        let task = tokio::spawn(self.run(shutdown));

        SupervisorHandle {
            shutting_down,
            requests,
            task: Some(task),
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "supervisor state changed");
            self.state = state;
        }
    }

    fn start_workers(&mut self) {
        let collector_url = self
            .config
            .data_collector_url
            .clone()
            .unwrap_or_else(|| self.default_collector_url.clone());

        self.workers = WorkersList::spawn(&self.config, &collector_url, &mut self.ids, &self.context);
        self.set_state(SupervisorState::Running);

        metrics::counter!("monitor_worker_generations_total").increment(1);
        self.update_live_gauge();
        info!(
            workers = self.workers.live_count(),
            services = self.config.services.len(),
            collector = %collector_url,
            "worker generation started"
        );
    }

    async fn run(mut self, mut shutdown: mpsc::Receiver<ShutdownRequest>) -> Result<(), SupervisorError> {
        let mut reload = reload_ticker(self.config.reload_interval());
        let mut heartbeat = interval((self.health.deadline() / 2).max(Duration::from_millis(10)));

        let outcome = loop {
            tokio::select! {
                request = shutdown.recv() => {
                    let report = self.shutdown_workers().await;
                    match request {
                        Some(request) => {
                            if request.ack.send(report).is_err() {
                                warn!("shutdown requester gone before the report was sent");
                            }
                        }
                        None => warn!("supervisor handle dropped, stopping"),
                    }
                    break Ok(());
                }
                _ = reload.tick() => {
                    let period = self.config.reload_interval();
                    if let Err(error) = self.reload().await {
                        error!("configuration reload failed, stopping: {}", error);
                        self.shutdown_workers().await;
                        break Err(error);
                    }
                    if self.config.reload_interval() != period {
                        info!(
                            reload_config_interval = self.config.reload_config_interval,
                            "reload interval changed"
                        );
                        reload = reload_ticker(self.config.reload_interval());
                    }
                }
                Some(id) = self.liveness.recv() => self.record_liveness(id),
                Some(exit) = self.exits.recv() => self.record_exit(exit),
                _ = heartbeat.tick() => self.health.report_healthy().await,
            }
        };

        self.set_state(SupervisorState::Stopped);
        info!("supervisor stopped");
        outcome
    }

    /// Poll the config source once. A new snapshot replaces the whole worker
    /// generation, but only if logging accepts it first.
    async fn reload(&mut self) -> Result<(), SupervisorError> {
        let config = match self.source.reload() {
            Ok(Reload::NotModified) => {
                metrics::counter!("monitor_config_reloads_total", "outcome" => "unchanged").increment(1);
                debug!("configuration unchanged");
                return Ok(());
            }
            Ok(Reload::Updated(config)) => config,
            Err(error) => {
                metrics::counter!("monitor_config_reloads_total", "outcome" => "failed").increment(1);
                return Err(error.into());
            }
        };

        if let Err(error) = self.logging.reinit(&config) {
            metrics::counter!("monitor_config_reloads_total", "outcome" => "rejected").increment(1);
            error!("new configuration rejected, logging could not be set up: {}", error);
            return Ok(());
        }

        info!(
            workers = self.workers.live_count(),
            "configuration changed, replacing all workers"
        );
        let report = self.workers.shutdown_all(&self.health).await;
        debug!(live = report.live, acknowledged = report.acknowledged, "previous generation stopped");

        self.config = config;
        self.start_workers();
        metrics::counter!("monitor_config_reloads_total", "outcome" => "applied").increment(1);

        Ok(())
    }

    fn record_liveness(&mut self, id: WorkerId) {
        match self.workers.get_mut(id) {
            Some(worker) if worker.state => {
                worker.last_state_time = Some(Utc::now());
                debug!(worker = %id, "liveness signal received");
            }
            _ => debug!(worker = %id, "ignoring liveness signal from a stopped worker"),
        }
    }

    fn record_exit(&mut self, exit: WorkerExit) {
        metrics::counter!("monitor_worker_exits_total", "reason" => exit.reason.as_str()).increment(1);

        match self.workers.get_mut(exit.worker) {
            Some(worker) if worker.state => {
                worker.mark_exited();
                if self.shutting_down.load(Ordering::SeqCst) {
                    info!(worker = %exit.worker, reason = ?exit.reason, "worker exited during shutdown");
                } else {
                    error!(
                        worker = %exit.worker,
                        address = %worker.address(),
                        reason = ?exit.reason,
                        "worker exited unexpectedly, its service is no longer checked"
                    );
                }
                self.update_live_gauge();
            }
            _ => debug!(worker = %exit.worker, reason = ?exit.reason, "worker exited"),
        }
    }

    async fn shutdown_workers(&mut self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.set_state(SupervisorState::ShuttingDown);

        let report = self.workers.shutdown_all(&self.health).await;
        self.update_live_gauge();
        info!(
            live = report.live,
            acknowledged = report.acknowledged,
            "all workers stopped"
        );
        report
    }

    fn update_live_gauge(&self) {
        metrics::gauge!("monitor_workers_live").set(self.workers.live_count() as f64);
    }
}

/// First tick one full period from now: workers were just spawned.
fn reload_ticker(period: Duration) -> Interval {
    let start = Instant::now()
        .checked_add(period)
        .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Controls a running supervisor loop.
pub struct SupervisorHandle {
    shutting_down: Arc<AtomicBool>,
    requests: mpsc::Sender<ShutdownRequest>,
    task: Option<JoinHandle<Result<(), SupervisorError>>>,
}

impl SupervisorHandle {
    /// True once the supervisor started stopping, whatever the reason.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Tear down every worker, then stop the supervisor loop.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, SupervisorError> {
        let task = self.task.take().ok_or(SupervisorError::Stopped)?;
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("supervisor already stopping on its own");
        }
        info!("shutting down the supervisor");

        let (ack, report) = oneshot::channel();
        let report = match self.requests.send(ShutdownRequest { ack }).await {
            Ok(()) => report.await.ok(),
            // The loop already ended on its own, its outcome is in the task.
            Err(_) => None,
        };

        joined(task.await)?;
        report.ok_or(SupervisorError::Stopped)
    }

    /// Resolve when the supervisor loop stops without being asked to.
    /// Safe to cancel, and returns `Stopped` once the loop has been awaited.
    pub async fn wait(&mut self) -> Result<(), SupervisorError> {
        let task = self.task.as_mut().ok_or(SupervisorError::Stopped)?;
        let result = task.await;
        self.task = None;
        joined(result)
    }
}

fn joined(result: Result<Result<(), SupervisorError>, JoinError>) -> Result<(), SupervisorError> {
    match result {
        Ok(outcome) => outcome,
        Err(error) => Err(SupervisorError::Panicked(error.to_string())),
    }
}

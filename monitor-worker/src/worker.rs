use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use http::Method;
use monitor_common::check::Target;
use monitor_common::probe::Probe;
use monitor_common::sink::Sink;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;

/// Identifies a worker for the lifetime of the process. Ids are never reused,
/// so signals from a torn-down generation cannot be mistaken for current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests the supervisor can send down a worker's command channel.
#[derive(Debug)]
pub enum Command {
    /// Stop after the current cycle and acknowledge on `ack`.
    Shutdown {
        ack: oneshot::Sender<Acknowledgement>,
    },
}

/// Sent back by a worker right before it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub worker: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Acknowledged a shutdown command.
    Stopped,
    /// The supervisor side of the command channel went away.
    Orphaned,
    /// The check loop panicked.
    Faulted(String),
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stopped => "stopped",
            ExitReason::Orphaned => "orphaned",
            ExitReason::Faulted(_) => "faulted",
        }
    }
}

/// Reported to the supervisor whenever a worker task ends, however it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: WorkerId,
    pub reason: ExitReason,
}

/// What one worker checks, and where it sends the results.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub target: Target,
    pub interval: Duration,
    pub collector_url: String,
}

/// Collaborators and upstream channels shared by every worker of every generation.
#[derive(Clone)]
pub struct WorkerContext {
    pub probe: Arc<dyn Probe>,
    pub sink: Arc<dyn Sink>,
    pub liveness: mpsc::Sender<WorkerId>,
    pub exits: mpsc::UnboundedSender<WorkerExit>,
}

/// Time to wait before the next cycle so cycles start every `interval`.
/// A cycle that overran its interval is followed immediately by the next one.
pub fn next_wait(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Supervisor-side record of a spawned worker.
#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    /// When the last liveness signal from this worker was received.
    pub last_state_time: Option<DateTime<Utc>>,
    /// True from spawn until the worker is torn down or seen exiting.
    pub state: bool,
    address: String,
    commands: Option<mpsc::Sender<Command>>,
}

impl Worker {
    /// Start the check loop of `assignment` as its own task.
    pub fn spawn(id: WorkerId, assignment: Assignment, context: &WorkerContext) -> Self {
        let (commands, receiver) = mpsc::channel(1);
        let address = assignment.target.address.clone();

        let check_loop = CheckLoop {
            id,
            assignment,
            commands: receiver,
            probe: context.probe.clone(),
            sink: context.sink.clone(),
            liveness: context.liveness.clone(),
        };
        let exits = context.exits.clone();

        tokio::spawn(async move {
            let reason = match AssertUnwindSafe(check_loop.run()).catch_unwind().await {
                Ok(reason) => reason,
                Err(panic) => ExitReason::Faulted(panic_message(panic.as_ref())),
            };
            if exits.send(WorkerExit { worker: id, reason }).is_err() {
                debug!(worker = %id, "supervisor gone, exit not reported");
            }
        });

        Self {
            id,
            last_state_time: None,
            state: true,
            address,
            commands: Some(commands),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Ask the worker to stop and wait for its acknowledgement. The worker only
    /// sees the command between cycles, so this can take up to one probe and
    /// forward. The command channel is closed afterwards, whatever the outcome.
    pub async fn shutdown(&mut self) -> Result<Acknowledgement, WorkerError> {
        let commands = match self.commands.take() {
            Some(commands) if self.state => commands,
            _ => return Err(WorkerError::Gone(self.id)),
        };
        self.state = false;

        let (ack, acknowledged) = oneshot::channel();
        commands
            .send(Command::Shutdown { ack })
            .await
            .map_err(|_| WorkerError::Gone(self.id))?;
        let acknowledgement = acknowledged
            .await
            .map_err(|_| WorkerError::AckDropped(self.id))?;

        drop(commands);
        Ok(acknowledgement)
    }

    /// The worker task ended on its own; nothing can be sent to it anymore.
    pub fn mark_exited(&mut self) {
        self.state = false;
        self.commands = None;
    }
}

/// The task side of a worker: wait, probe, forward, repeat.
struct CheckLoop {
    id: WorkerId,
    assignment: Assignment,
    commands: mpsc::Receiver<Command>,
    probe: Arc<dyn Probe>,
    sink: Arc<dyn Sink>,
    liveness: mpsc::Sender<WorkerId>,
}

impl CheckLoop {
    async fn run(mut self) -> ExitReason {
        debug!(
            worker = %self.id,
            address = %self.assignment.target.address,
            interval_secs = self.assignment.interval.as_secs(),
            "worker started"
        );

        let mut wait = self.assignment.interval;
        loop {
            debug!(worker = %self.id, wait_secs = wait.as_secs_f64(), "waiting for next check");

            tokio::select! {
                // Commands win over an elapsed wait, so a shutdown requested during
                // a long cycle is served before the next probe starts.
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        info!(worker = %self.id, "worker shutting down");
                        if ack.send(Acknowledgement { worker: self.id }).is_err() {
                            warn!(worker = %self.id, "nobody waiting for the shutdown acknowledgement");
                        }
                        return ExitReason::Stopped;
                    }
                    None => {
                        warn!(worker = %self.id, "command channel closed, worker stopping");
                        return ExitReason::Orphaned;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            let started = Instant::now();
            self.cycle().await;
            let elapsed = started.elapsed();

            wait = next_wait(self.assignment.interval, elapsed);
            debug!(
                worker = %self.id,
                cycle_secs = elapsed.as_secs_f64(),
                next_wait_secs = wait.as_secs_f64(),
                "check cycle completed"
            );
        }
    }

    async fn cycle(&self) {
        let result = self.probe.check(&self.assignment.target).await;

        metrics::counter!("monitor_checks_total", "outcome" => result.outcome().as_str())
            .increment(1);
        metrics::histogram!("monitor_check_duration_seconds")
            .record(result.duration.as_secs_f64());

        match self
            .sink
            .forward(Method::POST, &self.assignment.collector_url, &result)
            .await
        {
            Ok(status) => debug!(worker = %self.id, %status, "check result forwarded"),
            Err(error) => {
                metrics::counter!("monitor_forward_failures_total").increment(1);
                error!(
                    worker = %self.id,
                    collector = %self.assignment.collector_url,
                    "failed to forward check result: {}", error
                );
            }
        }

        // Best effort: a busy supervisor must never hold up the next probe.
        if let Err(error) = self.liveness.try_send(self.id) {
            debug!(worker = %self.id, "liveness signal dropped: {}", error);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

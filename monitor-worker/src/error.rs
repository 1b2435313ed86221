use monitor_common::config::ConfigError;
use monitor_common::logging::LoggingError;
use monitor_common::probe::ClientError;
use thiserror::Error;

use crate::worker::WorkerId;

/// Errors of the shutdown handshake with a single worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker {0} is gone, its command channel is closed")]
    Gone(WorkerId),
    #[error("worker {0} dropped the shutdown acknowledgement")]
    AckDropped(WorkerId),
}

/// Errors that stop the supervisor, and with it the process.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("configuration could not be loaded: {0}")]
    Config(#[from] ConfigError),
    #[error("logging could not be initialized: {0}")]
    Logging(#[from] LoggingError),
    #[error("http client could not be built: {0}")]
    Client(#[from] ClientError),
    #[error("supervisor loop panicked: {0}")]
    Panicked(String),
    #[error("supervisor loop already stopped")]
    Stopped,
}

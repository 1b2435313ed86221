pub mod check;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod probe;
pub mod sink;

//! Check every configured endpoint on its own schedule and forward the results.
use std::sync::Arc;

use envconfig::Envconfig;
use health::HealthRegistry;
use monitor_common::config::FileConfigSource;
use monitor_common::logging::Logging;
use monitor_common::metrics::{serve, setup_metrics_recorder};
use monitor_common::probe::HttpProbe;
use monitor_common::sink::HttpSink;
use tracing::{error, info};

use monitor_worker::config::Config;
use monitor_worker::error::SupervisorError;
use monitor_worker::handlers::app;
use monitor_worker::signals::wait_for_shutdown_signal;
use monitor_worker::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), SupervisorError> {
    let config = Config::init_from_env().expect("Invalid configuration:");

    // Logging is configured from the services file, so nothing is logged
    // before it has been read once.
    let mut source = FileConfigSource::new(&config.config_file);
    let services = source.load()?;
    let logging = Logging::install(&services)?;
    info!(
        file = %source.path().display(),
        services = services.services.len(),
        enabled = services.enabled_services(),
        "configuration loaded"
    );

    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    let liveness = HealthRegistry::new("liveness");
    let supervisor_liveness = liveness
        .register("supervisor".to_owned(), config.liveness_deadline.0)
        .await;

    let probe = HttpProbe::new(config.request_timeout.0)?;
    let sink = HttpSink::new(config.request_timeout.0)?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = app(liveness, Some(recorder));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let mut handle = Supervisor::new(
        services,
        source,
        logging,
        Arc::new(probe),
        Arc::new(sink),
        supervisor_liveness,
        config.data_collector_url.clone(),
    )
    .startup();

    let stopped = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        outcome = handle.wait() => Some(outcome),
    };

    match stopped {
        None => {
            let report = handle.shutdown().await?;
            info!(
                live = report.live,
                acknowledged = report.acknowledged,
                "monitor stopped"
            );
            Ok(())
        }
        Some(outcome) => {
            if let Err(ref e) = outcome {
                error!("supervisor stopped: {}", e);
            }
            outcome
        }
    }
}

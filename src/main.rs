use std::net::SocketAddr;

use tlbc_monitor::app::App;
use tlbc_monitor::config::init_global_config_from_cli;
use tlbc_monitor::error::MonitorError;
use tlbc_monitor::metrics::{spawn_metrics_server, Metrics};
use tlbc_monitor::telemetry::{init_tracing, TelemetryConfig};

fn main() -> std::process::ExitCode {
    if let Err(e) = init_tracing(TelemetryConfig::default()) {
        eprintln!("failed to initialize logging: {e}");
        return std::process::ExitCode::from(4);
    }

    let config = match init_global_config_from_cli() {
        Ok(c) => c.clone(),
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    let metrics = Metrics::new();
    let registry = metrics.registry.clone();
    spawn_metrics_server(registry, SocketAddr::from(([0, 0, 0, 0], 9898)));

    let mut app = match App::new(config, Some(metrics)) {
        Ok(app) => app,
        Err(e) => return exit_for_error(&e),
    };

    if let Err(e) = app.install_signal_handler() {
        eprintln!("failed to install signal handler: {e}");
        return std::process::ExitCode::from(1);
    }

    match app.run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => exit_for_error(&e),
    }
}

fn exit_for_error(e: &MonitorError) -> std::process::ExitCode {
    tracing::error!(error = %e, "monitor stopped");
    std::process::ExitCode::from(e.exit_code() as u8)
}

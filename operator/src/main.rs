use anyhow::Result;
use chrono::Duration;
use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;

mod exceptions;
mod plans;
mod schedule;
mod util;

use plans::jobs::{DEFAULT_RUNNER_IMAGE, DEFAULT_RUNNER_SERVICE_ACCOUNT, RunnerConfig};
use schedule::evaluate::ScheduleEvaluator;

#[derive(Parser, Debug, Clone)]
#[command(name = "hibernator-operator")]
struct Args {
    /// Image used for runner jobs.
    #[arg(long, env = "HIBERNATOR_RUNNER_IMAGE", default_value = DEFAULT_RUNNER_IMAGE)]
    runner_image: String,

    /// Service account runner pods execute under.
    #[arg(
        long,
        env = "HIBERNATOR_RUNNER_SERVICE_ACCOUNT",
        default_value = DEFAULT_RUNNER_SERVICE_ACCOUNT
    )]
    runner_service_account: String,

    /// Host runners call back into for streaming and callbacks.
    #[arg(
        long,
        env = "HIBERNATOR_CONTROL_PLANE_ENDPOINT",
        default_value = "hibernator-control-plane"
    )]
    control_plane_endpoint: String,

    /// Namespace the controller leases and lives in.
    #[arg(
        long,
        env = "HIBERNATOR_CONTROLLER_NAMESPACE",
        default_value = hibernator_common::DEFAULT_CONTROLLER_NAMESPACE
    )]
    controller_namespace: String,

    /// Grace buffer in seconds applied around schedule boundaries.
    #[arg(long, env = "HIBERNATOR_SCHEDULE_BUFFER_SECONDS", default_value_t = 0)]
    schedule_buffer_seconds: i64,

    /// Port for /metrics, /healthz, and /readyz; disabled when unset.
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    hibernator_common::init();
    let args = Args::parse();

    let client = Client::try_default().await?;

    #[cfg(feature = "metrics")]
    if let Some(port) = args.metrics_port {
        tokio::spawn(util::metrics::run_metrics_server(port));
    }
    #[cfg(not(feature = "metrics"))]
    if args.metrics_port.is_some() {
        eprintln!("{}", "metrics port set but the metrics feature is off".yellow());
    }

    let evaluator = if args.schedule_buffer_seconds > 0 {
        ScheduleEvaluator::with_buffer(Duration::seconds(args.schedule_buffer_seconds))
    } else {
        ScheduleEvaluator::new()
    };
    let runner = RunnerConfig {
        image: args.runner_image.clone(),
        service_account: args.runner_service_account.clone(),
        control_plane_endpoint: args.control_plane_endpoint.clone(),
    };

    println!(
        "{}{}",
        "🌙 hibernator-operator starting • runner=".green(),
        args.runner_image.green().dimmed(),
    );

    tokio::try_join!(
        plans::reconcile::run(
            client.clone(),
            evaluator,
            runner,
            args.controller_namespace.clone(),
        ),
        exceptions::reconcile::run(client, args.controller_namespace),
    )?;
    Ok(())
}

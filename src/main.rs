//! Lattice VM Backup - scheduled virtual machine backup controller

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use lattice_vm_backup::controller::{
    error_policy, reconcile, trigger_until_applied, Context, ControllerConfig, ScheduleRef,
};
use lattice_vm_backup::crd::{ScheduleVmBackup, VirtualMachineBackup};
use lattice_vm_backup::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use lattice_vm_backup::{
    DEFAULT_RECHECK_INTERVAL_SECS, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_TRIGGER_DEADLINE_SECS,
    DEFAULT_TRIGGER_NAMESPACE,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Lattice VM Backup - scheduled VM backups with retention and auto-suspend
#[derive(Parser, Debug)]
#[command(name = "lattice-vm-backup", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Namespace holding the per-schedule trigger CronJobs
    #[arg(
        long,
        global = true,
        env = "LATTICE_TRIGGER_NAMESPACE",
        default_value = DEFAULT_TRIGGER_NAMESPACE
    )]
    trigger_namespace: String,

    /// Delay before re-checking a schedule whose latest backup is running
    #[arg(
        long,
        global = true,
        env = "LATTICE_RECHECK_INTERVAL_SECS",
        default_value_t = DEFAULT_RECHECK_INTERVAL_SECS
    )]
    recheck_interval_secs: u64,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ScheduleVmBackup controller (default mode)
    Controller,

    /// Run one cron trigger for a schedule
    ///
    /// Invoked by the schedule's CronJob. Retries with backoff while the
    /// previous backup is still in progress.
    Trigger {
        /// Schedule namespace
        #[arg(long)]
        namespace: String,

        /// Schedule name
        #[arg(long)]
        name: String,

        /// Give up after this many seconds; set to the cron period
        #[arg(
            long,
            env = "LATTICE_TRIGGER_DEADLINE_SECS",
            default_value_t = DEFAULT_TRIGGER_DEADLINE_SECS
        )]
        deadline_secs: u64,
    },

    /// Print the ScheduleVmBackup CRD manifest and exit
    Crd,
}

impl GlobalArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            trigger_namespace: self.trigger_namespace.clone(),
            recheck_interval: Duration::from_secs(self.recheck_interval_secs),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            trigger_deadline: Duration::from_secs(DEFAULT_TRIGGER_DEADLINE_SECS),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.global.log_format,
    })?;

    let config = cli.global.controller_config();
    match cli.command {
        Some(Commands::Crd) => {
            let crd = serde_yaml::to_string(&ScheduleVmBackup::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Some(Commands::Trigger {
            namespace,
            name,
            deadline_secs,
        }) => {
            let config = ControllerConfig {
                trigger_deadline: Duration::from_secs(deadline_secs),
                ..config
            };
            run_trigger(config, &namespace, &name).await
        }
        Some(Commands::Controller) | None => run_controller(config).await,
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    tracing::info!(
        trigger_namespace = %config.trigger_namespace,
        recheck_secs = config.recheck_interval.as_secs(),
        "starting ScheduleVmBackup controller"
    );

    let ctx = Arc::new(Context::new(client.clone(), config));
    let schedules: Api<ScheduleVmBackup> = Api::all(client.clone());
    let backups: Api<VirtualMachineBackup> = Api::all(client);

    Controller::new(
        schedules,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        backups,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        |backup| ScheduleRef::from_backup(&backup).map(|r| r.object_ref()),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("ScheduleVmBackup"))
    .await;

    tracing::info!("controller shut down");
    Ok(())
}

async fn run_trigger(config: ControllerConfig, namespace: &str, name: &str) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;
    let ctx = Context::new(client, config);

    let outcome = trigger_until_applied(&ctx, namespace, name, Utc::now())
        .await
        .map_err(|e| anyhow::anyhow!("trigger for {}/{} failed: {}", namespace, name, e))?;
    tracing::info!(?outcome, "trigger applied");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

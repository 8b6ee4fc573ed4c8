mod crd_lifecycle;
mod driver_ui;
mod error;
mod events;
mod pod_monitor;
mod spark_controller;
mod status;
mod store;
mod submission;
mod util;
mod work_queue;

use crate::crd_lifecycle::{CrdLifecycle, ExternallyManagedCrd, KubeCrdLifecycle};
use crate::driver_ui::KubeUiAccess;
use crate::events::TracingEventRecorder;
use crate::pod_monitor::SparkPodMonitor;
use crate::spark_controller::{Ctx, SparkApplicationController};
use crate::status::KubeApplicationApi;
use crate::store::ApplicationCache;
use crate::submission::SparkSubmitRunner;
use clap::Parser;
use stackable_operator::cli::ProductOperatorRun;
use stackable_operator::k8s_openapi::api::core::v1::Pod;
use stackable_operator::kube::api::ListParams;
use stackable_operator::kube::runtime::watcher;
use stackable_operator::kube::CustomResourceExt;
use stackable_spark_k8s_crd::constants::APP_NAME;
use stackable_spark_k8s_crd::SparkApplication;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about = built_info::PKG_DESCRIPTION, author = stackable_operator::cli::AUTHOR)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print CRD objects
    Crd,
    /// Run operator
    Run(SparkOperatorRun),
}

#[derive(clap::Parser)]
struct SparkOperatorRun {
    #[clap(flatten)]
    common: ProductOperatorRun,

    /// Number of workers submitting SparkApplications
    #[clap(long, env, default_value = "10")]
    controller_threads: usize,

    /// Maximum number of spark-submit processes running at the same time
    #[clap(long, env, default_value = "3")]
    submission_threads: usize,

    /// The spark-submit executable used to launch applications
    #[clap(long, env, default_value = "/stackable/spark/bin/spark-submit")]
    spark_submit: String,

    /// Install the SparkApplication CRD on startup and delete it on shutdown
    #[clap(long, env, parse(try_from_str), default_value = "true")]
    install_crd: bool,
}

/// The API server as seen from inside the cluster, in the form `spark-submit` expects
fn master_url() -> String {
    match (
        std::env::var("KUBERNETES_SERVICE_HOST"),
        std::env::var("KUBERNETES_SERVICE_PORT"),
    ) {
        (Ok(host), Ok(port)) => format!("k8s://https://{}:{}", host, port),
        _ => "k8s://https://kubernetes.default.svc".to_string(),
    }
}

/// Cancels `shutdown` on SIGTERM or SIGINT
fn install_shutdown_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => println!("{}", serde_yaml::to_string(&SparkApplication::crd())?,),
        Command::Run(SparkOperatorRun {
            common,
            controller_threads,
            submission_threads,
            spark_submit,
            install_crd,
        }) => {
            stackable_operator::logging::initialize_logging(
                "SPARK_K8S_OPERATOR_LOG",
                APP_NAME,
                common.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                built_info::PKG_DESCRIPTION,
                built_info::PKG_VERSION,
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let watch_namespace = common.watch_namespace;
            let client =
                stackable_operator::client::create_client(Some("spark.stackable.tech".to_string()))
                    .await?;
            let kube_client = client.as_kube_client();

            let shutdown = CancellationToken::new();
            install_shutdown_handler(shutdown.clone())?;

            let (app_state_tx, app_state_rx) = mpsc::channel(submission_threads.max(1));
            let (pod_state_tx, pod_state_rx) = mpsc::unbounded_channel();

            let (runner, submissions) = SparkSubmitRunner::new(
                submission_threads,
                spark_submit,
                app_state_tx,
                shutdown.clone(),
            );
            let runner_task = tokio::spawn(submissions);
            let monitor =
                SparkPodMonitor::new(watch_namespace.get_api::<Pod>(&client), pod_state_tx);
            let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

            let cache = ApplicationCache::new();
            let controller = Arc::new(SparkApplicationController::new(Ctx {
                store: Arc::new(cache.clone()),
                api: Arc::new(KubeApplicationApi::new(kube_client.clone())),
                submitter: Arc::new(runner),
                ui_access: Arc::new(KubeUiAccess::new(kube_client.clone())),
                recorder: Arc::new(TracingEventRecorder),
                master_url: master_url(),
            }));
            let crds: Box<dyn CrdLifecycle> = if install_crd {
                Box::new(KubeCrdLifecycle::new(kube_client))
            } else {
                Box::new(ExternallyManagedCrd)
            };
            let events = watcher(
                watch_namespace.get_api::<SparkApplication>(&client),
                ListParams::default(),
            );

            let result = controller
                .run(
                    crds.as_ref(),
                    cache,
                    events,
                    controller_threads,
                    app_state_rx,
                    pod_state_rx,
                    shutdown.clone(),
                )
                .await;
            shutdown.cancel();
            let (runner_result, monitor_result) = tokio::join!(runner_task, monitor_task);
            runner_result?;
            monitor_result?;
            result?;
        }
    }

    Ok(())
}

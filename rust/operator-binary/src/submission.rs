//! Submission of [`SparkApplication`]s through `spark-submit`

use crate::error::{Error, MissingMetadataSnafu, NoAppIdSnafu, NoMainApplicationFileSnafu};
use crate::spark_controller::application_key;
use snafu::{ensure, OptionExt, ResultExt};
use stackable_operator::k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use stackable_spark_k8s_crd::{
    constants::*, ApplicationStateType, SparkApplication,
};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one submission attempt, reported back to the controller
#[derive(Clone, Debug, PartialEq)]
pub struct AppStateUpdate {
    pub namespace: String,
    pub name: String,
    /// The app id of the submission this result belongs to
    pub app_id: Option<String>,
    pub state: ApplicationStateType,
    pub error_message: Option<String>,
    pub submission_time: Option<Time>,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub command_args: Vec<String>,
    pub app: SparkApplication,
}

impl Submission {
    pub fn new(command_args: Vec<String>, app: SparkApplication) -> Self {
        Submission { command_args, app }
    }
}

/// Accepts submissions and executes them in the background
pub trait SubmissionSink: Send + Sync {
    fn submit(&self, submission: Submission);
}

/// Builds the `spark-submit` arguments for `app`, which must already carry its `appId`
pub fn build_submission_command_args(
    app: &SparkApplication,
    master_url: &str,
) -> Result<Vec<String>, Error> {
    let key = application_key(
        app.metadata.namespace.as_deref().unwrap_or_default(),
        app.metadata.name.as_deref().unwrap_or_default(),
    );
    let namespace = app
        .app_namespace()
        .context(MissingMetadataSnafu { key: key.clone() })?;
    let name = app
        .app_name()
        .context(MissingMetadataSnafu { key: key.clone() })?;
    let app_id = app.app_id().context(NoAppIdSnafu { key: key.clone() })?;
    let spec = &app.spec;
    ensure!(
        !spec.main_application_file.is_empty(),
        NoMainApplicationFileSnafu { key }
    );

    let mut args = vec![
        "--master".to_string(),
        master_url.to_string(),
        "--deploy-mode".to_string(),
        spec.mode.to_string(),
    ];
    if let Some(main_class) = &spec.main_class {
        args.push("--class".to_string());
        args.push(main_class.clone());
    }

    // BTreeMap keeps the generated arguments stable between attempts
    let mut conf = BTreeMap::new();
    conf.insert(SPARK_APP_NAME_CONF.to_string(), name.to_string());
    conf.insert(SPARK_NAMESPACE_CONF.to_string(), namespace.to_string());
    if let Some(image) = &spec.image {
        conf.insert(SPARK_CONTAINER_IMAGE_CONF.to_string(), image.clone());
    }
    if let Some(config_map) = &spec.spark_config_map {
        conf.insert(SPARK_CONFIG_MAP_CONF.to_string(), config_map.clone());
    }
    if let Some(config_map) = &spec.hadoop_config_map {
        conf.insert(HADOOP_CONFIG_MAP_CONF.to_string(), config_map.clone());
    }

    let driver = &spec.driver;
    for (key, value) in [
        (SPARK_DRIVER_CORES_CONF, &driver.cores),
        (SPARK_DRIVER_CORE_LIMIT_CONF, &driver.core_limit),
        (SPARK_DRIVER_MEMORY_CONF, &driver.memory),
        (SPARK_DRIVER_IMAGE_CONF, &driver.image),
        (SPARK_DRIVER_SERVICE_ACCOUNT_CONF, &driver.service_account),
    ] {
        if let Some(value) = value {
            conf.insert(key.to_string(), value.clone());
        }
    }

    let executor = &spec.executor;
    if let Some(instances) = executor.instances {
        conf.insert(SPARK_EXECUTOR_INSTANCES_CONF.to_string(), instances.to_string());
    }
    for (key, value) in [
        (SPARK_EXECUTOR_CORES_CONF, &executor.cores),
        (SPARK_EXECUTOR_MEMORY_CONF, &executor.memory),
        (SPARK_EXECUTOR_IMAGE_CONF, &executor.image),
    ] {
        if let Some(value) = value {
            conf.insert(key.to_string(), value.clone());
        }
    }

    for (key, files) in [
        (SPARK_JARS_CONF, &spec.deps.jars),
        (SPARK_FILES_CONF, &spec.deps.files),
        (SPARK_PY_FILES_CONF, &spec.deps.py_files),
    ] {
        if !files.is_empty() {
            conf.insert(key.to_string(), files.join(","));
        }
    }

    // The pod monitor relies on these labels to find the owning application
    for (prefix, user_labels) in [
        (SPARK_DRIVER_LABEL_PREFIX, &driver.labels),
        (SPARK_EXECUTOR_LABEL_PREFIX, &executor.labels),
    ] {
        for (label, value) in user_labels {
            conf.insert(format!("{}{}", prefix, label), value.clone());
        }
        conf.insert(
            format!("{}{}", prefix, SPARK_APP_NAME_LABEL),
            name.to_string(),
        );
        conf.insert(format!("{}{}", prefix, SPARK_APP_ID_LABEL), app_id.to_string());
    }

    for (key, value) in &spec.spark_conf {
        conf.insert(key.clone(), value.clone());
    }
    for (key, value) in &spec.hadoop_conf {
        conf.insert(format!("{}{}", SPARK_HADOOP_CONF_PREFIX, key), value.clone());
    }
    // spark-submit has to return once the driver is created, pod phases are tracked separately
    conf.insert(
        SPARK_WAIT_APP_COMPLETION_CONF.to_string(),
        "false".to_string(),
    );

    for (key, value) in conf {
        args.push("--conf".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.main_application_file.clone());
    args.extend(spec.arguments.iter().cloned());
    Ok(args)
}

/// Runs `spark-submit` for queued submissions, at most `workers` at a time
pub struct SparkSubmitRunner {
    queue: mpsc::UnboundedSender<Submission>,
}

impl SparkSubmitRunner {
    /// Creates the runner handle and the future that executes the submissions
    ///
    /// The returned future owns `updates` and drops it once it has been cancelled and all
    /// running submissions finished, which closes the channel for the consumer.
    pub fn new(
        workers: usize,
        spark_submit: String,
        updates: mpsc::Sender<AppStateUpdate>,
        shutdown: CancellationToken,
    ) -> (Self, impl std::future::Future<Output = ()>) {
        let (queue, submissions) = mpsc::unbounded_channel();
        let run = run_submissions(workers, spark_submit, submissions, updates, shutdown);
        (SparkSubmitRunner { queue }, run)
    }
}

impl SubmissionSink for SparkSubmitRunner {
    fn submit(&self, submission: Submission) {
        if self.queue.send(submission).is_err() {
            warn!("Submission runner has stopped, dropping submission");
        }
    }
}

async fn run_submissions(
    workers: usize,
    spark_submit: String,
    mut submissions: mpsc::UnboundedReceiver<Submission>,
    updates: mpsc::Sender<AppStateUpdate>,
    shutdown: CancellationToken,
) {
    info!("Starting the spark-submit runner with {} workers", workers);
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut running = Vec::new();

    loop {
        let submission = tokio::select! {
            _ = shutdown.cancelled() => break,
            submission = submissions.recv() => match submission {
                Some(submission) => submission,
                None => break,
            },
        };
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let spark_submit = spark_submit.clone();
        let updates = updates.clone();
        running.push(tokio::spawn(async move {
            let update = run_spark_submit(&spark_submit, submission).await;
            drop(permit);
            if updates.send(update).await.is_err() {
                debug!("Application state channel closed, dropping submission result");
            }
        }));
        running.retain(|handle| !handle.is_finished());
    }

    if shutdown.is_cancelled() {
        for handle in &running {
            handle.abort();
        }
    }
    futures::future::join_all(running).await;
    info!("Stopped the spark-submit runner");
}

async fn run_spark_submit(spark_submit: &str, submission: Submission) -> AppStateUpdate {
    let app = &submission.app;
    let namespace = app.metadata.namespace.clone().unwrap_or_default();
    let name = app.metadata.name.clone().unwrap_or_default();
    let app_id = app.app_id().map(String::from);
    info!(
        "Submitting SparkApplication {}/{}: {} {}",
        namespace,
        name,
        spark_submit,
        submission.command_args.join(" ")
    );

    let output = Command::new(spark_submit)
        .args(&submission.command_args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    let error_message = match output {
        Ok(output) if output.status.success() => None,
        Ok(output) => Some(format!(
            "spark-submit exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(err) => Some(format!("failed to run {}: {}", spark_submit, err)),
    };

    match error_message {
        None => AppStateUpdate {
            namespace,
            name,
            app_id,
            state: ApplicationStateType::Submitted,
            error_message: None,
            submission_time: Some(Time(Utc::now())),
        },
        Some(error_message) => {
            warn!(
                "Submission of SparkApplication {}/{} failed: {}",
                namespace, name, error_message
            );
            AppStateUpdate {
                namespace,
                name,
                app_id,
                state: ApplicationStateType::FailedSubmission,
                error_message: Some(error_message),
                submission_time: None,
            }
        }
    }
}

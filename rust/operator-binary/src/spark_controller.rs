//! Drives [`SparkApplication`]s from creation through submission to termination
//!
//! New applications observed by the watch are put on a [`WorkQueue`] and submitted by a pool
//! of workers. Submission results and pod phase changes arrive on two channels, each drained
//! by exactly one consumer. All of them write the application status through
//! [`update_status_with_retries`], which is what resolves races between them.

use crate::crd_lifecycle::CrdLifecycle;
use crate::driver_ui::UiAccess;
use crate::error::{Error, InvalidKeySnafu};
use crate::events::{EventReason, EventRecorder};
use crate::pod_monitor::{
    DriverStateUpdate, ExecutorStateUpdate, PodStateUpdate, POD_PHASE_FAILED, POD_PHASE_PENDING,
    POD_PHASE_RUNNING, POD_PHASE_SUCCEEDED,
};
use crate::status::{update_status_with_retries, ApplicationApi};
use crate::store::{ApplicationCache, ApplicationEventHandler, ApplicationStore};
use crate::submission::{
    build_submission_command_args, AppStateUpdate, Submission, SubmissionSink,
};
use crate::work_queue::WorkQueue;
use fnv::FnvHasher;
use futures::Stream;
use snafu::OptionExt;
use stackable_operator::kube::runtime::watcher;
use stackable_spark_k8s_crd::{
    ApplicationStateType, ExecutorState, RestartPolicy, SparkApplication, SparkApplicationStatus,
};
use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub fn application_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Splits a `namespace/name` key into its parts
pub fn split_application_key(key: &str) -> Result<(&str, &str), Error> {
    key.split_once('/')
        .filter(|(namespace, name)| {
            !namespace.is_empty() && !name.is_empty() && !name.contains('/')
        })
        .context(InvalidKeySnafu { key })
}

fn key_of(app: &SparkApplication) -> String {
    application_key(
        app.metadata.namespace.as_deref().unwrap_or_default(),
        app.metadata.name.as_deref().unwrap_or_default(),
    )
}

pub fn driver_pod_phase_to_application_state(pod_phase: &str) -> ApplicationStateType {
    match pod_phase {
        POD_PHASE_PENDING => ApplicationStateType::Submitted,
        POD_PHASE_RUNNING => ApplicationStateType::Running,
        POD_PHASE_SUCCEEDED => ApplicationStateType::Completed,
        POD_PHASE_FAILED => ApplicationStateType::Failed,
        _ => ApplicationStateType::Unknown,
    }
}

/// Whether an application that ended up in `state` gets submitted again
pub fn should_restart(state: ApplicationStateType, policy: RestartPolicy) -> bool {
    match policy {
        RestartPolicy::Never | RestartPolicy::Undefined => false,
        RestartPolicy::OnFailure => state == ApplicationStateType::Failed,
        RestartPolicy::Always => true,
    }
}

/// A fresh id of the form `<name>-<hash>`, different for every submission of the same object
pub fn build_app_id(app: &SparkApplication) -> String {
    let name = app.metadata.name.as_deref().unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.write(app.metadata.namespace.as_deref().unwrap_or_default().as_bytes());
    hasher.write(app.metadata.uid.as_deref().unwrap_or_default().as_bytes());
    hasher.write(nanos.to_string().as_bytes());
    // xor-fold the 64-bit FNV-1a hash down to 32 bits
    let hash = hasher.finish();
    format!("{}-{}", name, ((hash >> 32) ^ hash) as u32)
}

/// Whether an observation tagged with `app_id` belongs to the submission recorded in
/// `status`, untagged observations are always accepted
fn is_current_submission(app_id: Option<&str>, status: &SparkApplicationStatus) -> bool {
    match app_id {
        Some(app_id) => status.app_id.as_deref() == Some(app_id),
        None => true,
    }
}

/// Like [`is_current_submission`] for a persisted application, whose status may have been
/// written by a newer submission in the meantime
fn is_current_submission_of(app_id: Option<&str>, app: &SparkApplication) -> bool {
    match app_id {
        Some(app_id) => app.app_id() == Some(app_id),
        None => true,
    }
}

pub struct Ctx {
    pub store: Arc<dyn ApplicationStore>,
    pub api: Arc<dyn ApplicationApi>,
    pub submitter: Arc<dyn SubmissionSink>,
    pub ui_access: Arc<dyn UiAccess>,
    pub recorder: Arc<dyn EventRecorder>,
    /// Passed to `spark-submit` as `--master`
    pub master_url: String,
}

pub struct SparkApplicationController {
    ctx: Ctx,
    queue: WorkQueue,
}

impl SparkApplicationController {
    pub fn new(ctx: Ctx) -> Self {
        SparkApplicationController {
            ctx,
            queue: WorkQueue::new(),
        }
    }

    /// Runs the controller until `shutdown` fires
    ///
    /// The CRD is installed before anything is watched and removed again once all workers
    /// and consumers have stopped. The consumers only stop after the senders of their
    /// channels are gone, so whoever owns them has to observe `shutdown` as well.
    #[allow(clippy::too_many_arguments)]
    pub async fn run<S>(
        self: Arc<Self>,
        crds: &dyn CrdLifecycle,
        cache: ApplicationCache,
        events: S,
        workers: usize,
        app_state_updates: mpsc::Receiver<AppStateUpdate>,
        pod_state_updates: mpsc::UnboundedReceiver<PodStateUpdate>,
        shutdown: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Stream<Item = Result<watcher::Event<SparkApplication>, watcher::Error>>
            + Send
            + 'static,
    {
        info!("Starting the SparkApplication controller");
        crds.install().await?;

        let watch = tokio::spawn({
            let cache = cache.clone();
            let handler: Arc<dyn ApplicationEventHandler> = self.clone();
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = cache.run(events, handler) => {}
                }
            }
        });

        info!("Waiting for the SparkApplication cache to sync");
        if let Err(err) = cache.wait_for_sync(CACHE_SYNC_TIMEOUT).await {
            watch.abort();
            self.remove_crd(crds).await;
            return Err(err);
        }

        info!("Starting {} workers", workers);
        let mut tasks = Vec::with_capacity(workers + 2);
        for _ in 0..workers {
            let controller = self.clone();
            tasks.push(tokio::spawn(async move { controller.run_worker().await }));
        }
        let controller = self.clone();
        tasks.push(tokio::spawn(async move {
            controller.process_app_state_updates(app_state_updates).await
        }));
        let controller = self.clone();
        tasks.push(tokio::spawn(async move {
            controller.process_pod_state_updates(pod_state_updates).await
        }));

        shutdown.cancelled().await;
        info!("Stopping the SparkApplication controller");
        self.queue.shut_down();
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!("controller task failed: {}", err);
            }
        }
        if let Err(err) = watch.await {
            error!("SparkApplication watch failed: {}", err);
        }

        self.remove_crd(crds).await;
        info!("Stopped the SparkApplication controller");
        Ok(())
    }

    async fn remove_crd(&self, crds: &dyn CrdLifecycle) {
        if let Err(err) = crds.remove().await {
            error!("failed to remove the SparkApplication CRD: {}", err);
        }
    }

    async fn run_worker(&self) {
        while self.process_next_item().await {}
    }

    /// Handles one key from the queue, `false` once the queue was shut down
    async fn process_next_item(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        debug!(
            "Processing SparkApplication {}, {} more queued",
            key,
            self.queue.len()
        );

        match self.sync_spark_application(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(err) => {
                error!("failed to sync SparkApplication {}: {}", key, err);
                self.queue.add(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    async fn sync_spark_application(&self, key: &str) -> Result<(), Error> {
        split_application_key(key)?;
        let app = match self.ctx.store.get_by_key(key) {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!("SparkApplication {} no longer exists, skipping", key);
                return Ok(());
            }
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        self.submit_app(&app, false).await;
        Ok(())
    }

    /// Assigns a new app id to `app` and hands it to the submission runner
    ///
    /// Returns the application as persisted, `None` if the status could not be written.
    pub async fn submit_app(
        &self,
        app: &SparkApplication,
        resubmission: bool,
    ) -> Option<SparkApplication> {
        let key = key_of(app);
        let app_id = build_app_id(app);
        let ui_service = match self.ctx.ui_access.ensure_ui_service(app).await {
            Ok(ui_service) => Some(ui_service),
            Err(err) => {
                warn!("failed to create the driver UI service for {}: {}", key, err);
                None
            }
        };

        let updated = update_status_with_retries(
            self.ctx.api.as_ref(),
            app,
            app.clone(),
            |status: &mut SparkApplicationStatus| {
                if resubmission {
                    *status = SparkApplicationStatus::default();
                }
                status.app_id = Some(app_id.clone());
                status.application_state.state = ApplicationStateType::New;
                if let Some(ui_service) = &ui_service {
                    status.driver_info.web_ui_service_name = Some(ui_service.name.clone());
                    status.driver_info.web_ui_port = Some(ui_service.node_port);
                }
            },
        )
        .await?;

        match build_submission_command_args(&updated, &self.ctx.master_url) {
            Ok(command_args) => {
                debug!("Queueing submission of SparkApplication {} as {}", key, app_id);
                self.ctx
                    .submitter
                    .submit(Submission::new(command_args, updated.clone()));
            }
            Err(err) => error!("failed to build the submission for {}: {}", key, err),
        }
        Some(updated)
    }

    /// Looks up an application for a status update, `None` if it's gone or unreadable
    fn get_application(&self, namespace: &str, name: &str) -> Option<SparkApplication> {
        let key = application_key(namespace, name);
        match self.ctx.store.get_by_key(&key) {
            Ok(Some(app)) => Some(app),
            Ok(None) => {
                debug!("SparkApplication {} not found, ignoring update", key);
                None
            }
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                error!("failed to get SparkApplication {}: {}", key, err);
                None
            }
        }
    }

    pub async fn process_app_state_updates(&self, mut updates: mpsc::Receiver<AppStateUpdate>) {
        while let Some(update) = updates.recv().await {
            self.process_single_app_state_update(&update).await;
        }
        debug!("Application state channel closed");
    }

    /// Driver and executor updates are handled strictly in the order they were sent
    pub async fn process_pod_state_updates(
        &self,
        mut updates: mpsc::UnboundedReceiver<PodStateUpdate>,
    ) {
        while let Some(update) = updates.recv().await {
            match update {
                PodStateUpdate::Driver(update) => {
                    if let Some(updated) = self.process_single_driver_state_update(&update).await
                    {
                        if updated.state().is_terminated() {
                            self.handle_restart(&updated).await;
                        }
                    }
                }
                PodStateUpdate::Executor(update) => {
                    self.process_single_executor_state_update(&update).await
                }
            }
        }
        debug!("Pod state channel closed");
    }

    async fn process_single_app_state_update(&self, update: &AppStateUpdate) {
        debug!(
            "Received application state update for SparkApplication {}/{}: {}",
            update.namespace, update.name, update.state
        );
        let app = match self.get_application(&update.namespace, &update.name) {
            Some(app) => app,
            None => return,
        };

        let updated =
            update_status_with_retries(self.ctx.api.as_ref(), &app, app.clone(), |status| {
                if !is_current_submission(update.app_id.as_deref(), status) {
                    return;
                }
                // The driver may already have been observed, never move it back
                if update.state != ApplicationStateType::Submitted
                    || status.application_state.state == ApplicationStateType::New
                {
                    status.application_state.state = update.state;
                }
                status.application_state.error_message = update.error_message.clone();
                if let Some(submission_time) = &update.submission_time {
                    status.submission_time = Some(submission_time.clone());
                }
            })
            .await;

        let current = updated
            .filter(|updated| is_current_submission_of(update.app_id.as_deref(), updated));
        if let Some(updated) = current {
            if updated.state() == ApplicationStateType::FailedSubmission {
                self.ctx.recorder.record(
                    &updated,
                    EventReason::SparkApplicationSubmissionFailure,
                    format!(
                        "SparkApplication {} failed submission: {}",
                        update.name,
                        update.error_message.as_deref().unwrap_or_default()
                    ),
                );
            }
        }
    }

    async fn process_single_driver_state_update(
        &self,
        update: &DriverStateUpdate,
    ) -> Option<SparkApplication> {
        debug!(
            "Received driver state update for SparkApplication {}/{}: {}",
            update.app_namespace, update.app_name, update.pod_phase
        );
        let app = self.get_application(&update.app_namespace, &update.app_name)?;

        let node_ip = match update.node_name.as_deref() {
            Some(node_name) if !node_name.is_empty() => {
                self.ctx.ui_access.node_external_ip(node_name).await
            }
            _ => None,
        };
        let state = driver_pod_phase_to_application_state(&update.pod_phase);

        let updated =
            update_status_with_retries(self.ctx.api.as_ref(), &app, app.clone(), |status| {
                if !is_current_submission(update.app_id.as_deref(), status) {
                    return;
                }
                status.driver_info.pod_name = Some(update.pod_name.clone());
                if let Some(node_ip) = &node_ip {
                    let address = match status.driver_info.web_ui_port {
                        Some(port) => format!("{}:{}", node_ip, port),
                        None => node_ip.clone(),
                    };
                    status.driver_info.web_ui_address = Some(address);
                }
                status.application_state.state = state;
                if let Some(completion_time) = &update.completion_time {
                    status.completion_time = Some(completion_time.clone());
                }
            })
            .await?;
        if !is_current_submission_of(update.app_id.as_deref(), &updated) {
            debug!(
                "Ignoring driver pod {} of an earlier submission of SparkApplication {}/{}",
                update.pod_name, update.app_namespace, update.app_name
            );
            return None;
        }

        if updated.state().is_terminated() {
            self.ctx.recorder.record(
                &updated,
                EventReason::SparkApplicationTermination,
                format!(
                    "SparkApplication {} terminated with state: {}",
                    update.app_name,
                    updated.state()
                ),
            );
        }
        Some(updated)
    }

    async fn process_single_executor_state_update(&self, update: &ExecutorStateUpdate) {
        debug!(
            "Received state update for executor {} of SparkApplication {}/{}: {}",
            update.executor_id, update.app_namespace, update.app_name, update.state
        );
        if update.state == ExecutorState::Pending {
            return;
        }
        let app = match self.get_application(&update.app_namespace, &update.app_name) {
            Some(app) => app,
            None => return,
        };

        update_status_with_retries(self.ctx.api.as_ref(), &app, app.clone(), |status| {
            if !is_current_submission(update.app_id.as_deref(), status) {
                return;
            }
            status
                .executor_state
                .insert(update.pod_name.clone(), update.state);
        })
        .await;
    }

    async fn handle_restart(&self, app: &SparkApplication) {
        let policy = app.spec.restart_policy;
        if !should_restart(app.state(), policy) {
            return;
        }

        info!(
            "SparkApplication {} ended with state {}, restarting it due to RestartPolicy {}",
            key_of(app),
            app.state(),
            policy
        );
        self.ctx.recorder.record(
            app,
            EventReason::SparkApplicationResubmission,
            format!(
                "Re-submitting SparkApplication: {}",
                app.metadata.name.as_deref().unwrap_or_default()
            ),
        );
        self.submit_app(app, true).await;
    }
}

impl ApplicationEventHandler for SparkApplicationController {
    fn on_add(&self, app: &SparkApplication) {
        let name = app.metadata.name.as_deref().unwrap_or_default();
        self.ctx.recorder.record(
            app,
            EventReason::SparkApplicationSubmission,
            format!("Submitting SparkApplication: {}", name),
        );
        self.queue.add(&key_of(app));
    }

    fn on_delete(&self, app: &SparkApplication) {
        let name = app.metadata.name.as_deref().unwrap_or_default();
        self.ctx.recorder.record(
            app,
            EventReason::SparkApplicationDeletion,
            format!("Deleting SparkApplication: {}", name),
        );
        let key = key_of(app);
        self.queue.forget(&key);
        self.queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_ui::tests::FakeUiAccess;
    use crate::status::tests::{test_app, FakeApplicationApi};
    use async_trait::async_trait;
    use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use stackable_operator::k8s_openapi::chrono::{TimeZone, Utc};
    use stackable_spark_k8s_crd::{ApplicationState, DriverInfo};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const KEY: &str = "ns1/wordcount";

    impl ApplicationStore for FakeApplicationApi {
        fn get_by_key(&self, key: &str) -> Result<Option<SparkApplication>, Error> {
            Ok(self.stored(key))
        }
    }

    #[derive(Default)]
    struct RecordingSubmissions {
        submissions: Mutex<Vec<Submission>>,
    }

    impl RecordingSubmissions {
        fn count(&self) -> usize {
            self.submissions.lock().unwrap().len()
        }
    }

    impl SubmissionSink for RecordingSubmissions {
        fn submit(&self, submission: Submission) {
            self.submissions.lock().unwrap().push(submission);
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        events: Mutex<Vec<(EventReason, String)>>,
    }

    impl RecordingEvents {
        fn reasons(&self) -> Vec<EventReason> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(reason, _)| *reason)
                .collect()
        }
    }

    impl EventRecorder for RecordingEvents {
        fn record(&self, _app: &SparkApplication, reason: EventReason, message: String) {
            self.events.lock().unwrap().push((reason, message));
        }
    }

    #[derive(Default)]
    struct FakeCrds {
        installed: Mutex<bool>,
        removed: Mutex<bool>,
    }

    #[async_trait]
    impl CrdLifecycle for FakeCrds {
        async fn install(&self) -> Result<(), Error> {
            *self.installed.lock().unwrap() = true;
            Ok(())
        }

        async fn remove(&self) -> Result<(), Error> {
            *self.removed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct Harness {
        controller: Arc<SparkApplicationController>,
        api: Arc<FakeApplicationApi>,
        submissions: Arc<RecordingSubmissions>,
        events: Arc<RecordingEvents>,
    }

    fn harness_with_store(
        api: Arc<FakeApplicationApi>,
        store: Arc<dyn ApplicationStore>,
    ) -> Harness {
        let submissions = Arc::new(RecordingSubmissions::default());
        let events = Arc::new(RecordingEvents::default());
        let ui_access = FakeUiAccess {
            node_ips: BTreeMap::from([("node-1".to_string(), "203.0.113.7".to_string())]),
            ..FakeUiAccess::default()
        };
        let controller = Arc::new(SparkApplicationController::new(Ctx {
            store,
            api: api.clone(),
            submitter: submissions.clone(),
            ui_access: Arc::new(ui_access),
            recorder: events.clone(),
            master_url: "k8s://https://10.96.0.1:443".to_string(),
        }));
        Harness {
            controller,
            api,
            submissions,
            events,
        }
    }

    fn harness(apps: &[SparkApplication]) -> Harness {
        let api = Arc::new(FakeApplicationApi::default());
        for app in apps {
            api.insert(app.clone());
        }
        harness_with_store(api.clone(), api)
    }

    fn driver_update(phase: &str) -> DriverStateUpdate {
        DriverStateUpdate {
            app_namespace: "ns1".to_string(),
            app_name: "wordcount".to_string(),
            app_id: Some("wordcount-1".to_string()),
            pod_name: "wordcount-driver".to_string(),
            pod_phase: phase.to_string(),
            node_name: Some("node-1".to_string()),
            completion_time: match phase {
                POD_PHASE_SUCCEEDED | POD_PHASE_FAILED => {
                    Some(Time(Utc.ymd(2022, 7, 1).and_hms(10, 0, 0)))
                }
                _ => None,
            },
        }
    }

    fn executor_update(state: ExecutorState) -> ExecutorStateUpdate {
        ExecutorStateUpdate {
            app_namespace: "ns1".to_string(),
            app_name: "wordcount".to_string(),
            app_id: Some("wordcount-1".to_string()),
            pod_name: "wordcount-exec-1".to_string(),
            executor_id: "1".to_string(),
            state,
        }
    }

    fn app_with_state(state: ApplicationStateType, policy: RestartPolicy) -> SparkApplication {
        let mut app = test_app("ns1", "wordcount");
        app.spec.restart_policy = policy;
        app.status = Some(SparkApplicationStatus {
            app_id: Some("wordcount-1".to_string()),
            application_state: ApplicationState {
                state,
                error_message: None,
            },
            driver_info: DriverInfo {
                web_ui_port: Some(31040),
                ..DriverInfo::default()
            },
            ..SparkApplicationStatus::default()
        });
        app
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition was not met in time");
    }

    #[test]
    fn test_application_keys() {
        assert_eq!(application_key("ns1", "wordcount"), KEY);
        assert_eq!(split_application_key(KEY).unwrap(), ("ns1", "wordcount"));
        assert!(split_application_key("wordcount").is_err());
        assert!(split_application_key("/wordcount").is_err());
        assert!(split_application_key("ns1/a/b").is_err());
    }

    #[test]
    fn test_driver_pod_phase_to_application_state() {
        assert_eq!(
            driver_pod_phase_to_application_state("Pending"),
            ApplicationStateType::Submitted
        );
        assert_eq!(
            driver_pod_phase_to_application_state("Running"),
            ApplicationStateType::Running
        );
        assert_eq!(
            driver_pod_phase_to_application_state("Succeeded"),
            ApplicationStateType::Completed
        );
        assert_eq!(
            driver_pod_phase_to_application_state("Failed"),
            ApplicationStateType::Failed
        );
        assert_eq!(
            driver_pod_phase_to_application_state("Evicted"),
            ApplicationStateType::Unknown
        );
    }

    #[test]
    fn test_should_restart() {
        use ApplicationStateType::{Completed, Failed};
        use RestartPolicy::*;

        for state in [Completed, Failed] {
            assert!(!should_restart(state, Never));
            assert!(!should_restart(state, Undefined));
            assert!(should_restart(state, Always));
        }
        assert!(should_restart(Failed, OnFailure));
        assert!(!should_restart(Completed, OnFailure));
    }

    #[test]
    fn test_build_app_id() {
        let app = test_app("ns1", "wordcount");
        let app_id = build_app_id(&app);
        let hash = app_id.strip_prefix("wordcount-").unwrap();
        assert!(hash.parse::<u32>().is_ok());
    }

    #[tokio::test]
    async fn test_submit_app() {
        let h = harness(&[test_app("ns1", "wordcount")]);

        let updated = h
            .controller
            .submit_app(&test_app("ns1", "wordcount"), false)
            .await
            .unwrap();

        let status = updated.status.as_ref().unwrap();
        let app_id = status.app_id.as_deref().unwrap();
        assert!(app_id.starts_with("wordcount-"));
        assert_eq!(status.application_state.state, ApplicationStateType::New);
        assert_eq!(
            status.driver_info.web_ui_service_name.as_deref(),
            Some("wordcount-ui-svc")
        );
        assert_eq!(status.driver_info.web_ui_port, Some(31040));
        assert_eq!(h.api.stored(KEY).unwrap().status, updated.status);

        let submissions = h.submissions.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].app.app_id(), Some(app_id));
        assert!(submissions[0]
            .command_args
            .iter()
            .any(|arg| arg.ends_with(&format!("={}", app_id))));
    }

    #[tokio::test]
    async fn test_resubmission_clears_status() {
        let mut app = app_with_state(ApplicationStateType::Failed, RestartPolicy::Always);
        if let Some(status) = app.status.as_mut() {
            status.application_state.error_message = Some("driver OOMKilled".to_string());
            status.completion_time = Some(Time(Utc.ymd(2022, 7, 1).and_hms(10, 0, 0)));
            status.submission_time = Some(Time(Utc.ymd(2022, 7, 1).and_hms(9, 0, 0)));
            status.driver_info.pod_name = Some("wordcount-driver".to_string());
            status.driver_info.web_ui_address = Some("203.0.113.7:31040".to_string());
            status
                .executor_state
                .insert("wordcount-exec-1".to_string(), ExecutorState::Failed);
        }
        let h = harness(&[app.clone()]);

        let updated = h.controller.submit_app(&app, true).await.unwrap();

        let status = updated.status.unwrap();
        let app_id = status.app_id.clone().unwrap();
        assert_ne!(app_id, "wordcount-1");
        assert_eq!(
            status,
            SparkApplicationStatus {
                app_id: Some(app_id),
                driver_info: DriverInfo {
                    web_ui_service_name: Some("wordcount-ui-svc".to_string()),
                    web_ui_port: Some(31040),
                    ..DriverInfo::default()
                },
                ..SparkApplicationStatus::default()
            }
        );
        assert_eq!(h.submissions.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_application_is_not_submitted() {
        let mut app = test_app("ns1", "wordcount");
        app.spec.main_application_file = String::new();
        let h = harness(&[app.clone()]);

        let updated = h.controller.submit_app(&app, false).await.unwrap();

        assert_eq!(updated.state(), ApplicationStateType::New);
        assert!(updated.app_id().is_some());
        assert_eq!(h.submissions.count(), 0);
    }

    #[tokio::test]
    async fn test_submit_app_of_deleted_application() {
        let h = harness(&[]);

        let updated = h
            .controller
            .submit_app(&test_app("ns1", "wordcount"), false)
            .await;

        assert_eq!(updated, None);
        assert_eq!(h.submissions.count(), 0);
    }

    #[tokio::test]
    async fn test_worker_submits_queued_application() {
        let h = harness(&[test_app("ns1", "wordcount")]);
        h.controller.queue.add_immediate(KEY);

        assert!(h.controller.process_next_item().await);

        assert_eq!(h.submissions.count(), 1);
        assert_eq!(h.controller.queue.num_requeues(KEY), 0);
        assert_eq!(h.controller.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_worker_skips_missing_application() {
        let h = harness(&[]);
        h.controller.queue.add_immediate(KEY);

        assert!(h.controller.process_next_item().await);

        assert_eq!(h.submissions.count(), 0);
        assert_eq!(h.api.update_calls(), 0);
        assert_eq!(h.controller.queue.num_requeues(KEY), 0);
    }

    #[tokio::test]
    async fn test_worker_requeues_invalid_key() {
        let h = harness(&[]);
        h.controller.queue.add_immediate("wordcount");

        assert!(h.controller.process_next_item().await);

        assert_eq!(h.controller.queue.num_requeues("wordcount"), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let h = harness(&[]);
        h.controller.queue.shut_down();
        assert!(!h.controller.process_next_item().await);
    }

    #[tokio::test]
    async fn test_watch_events() {
        let h = harness(&[]);
        let app = test_app("ns1", "wordcount");

        h.controller.on_add(&app);
        h.controller.on_delete(&app);

        assert_eq!(
            h.events.reasons(),
            vec![
                EventReason::SparkApplicationSubmission,
                EventReason::SparkApplicationDeletion
            ]
        );
        assert_eq!(h.controller.queue.num_requeues(KEY), 0);
        assert_eq!(h.api.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_app_state_update() {
        let h = harness(&[app_with_state(ApplicationStateType::New, RestartPolicy::Never)]);
        let submission_time = Time(Utc.ymd(2022, 7, 1).and_hms(9, 0, 0));

        h.controller
            .process_single_app_state_update(&AppStateUpdate {
                namespace: "ns1".to_string(),
                name: "wordcount".to_string(),
                app_id: Some("wordcount-1".to_string()),
                state: ApplicationStateType::Submitted,
                error_message: None,
                submission_time: Some(submission_time.clone()),
            })
            .await;

        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::Submitted);
        assert_eq!(status.submission_time, Some(submission_time));
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_failed_submission_is_recorded_without_restart() {
        let h = harness(&[app_with_state(ApplicationStateType::New, RestartPolicy::Always)]);

        h.controller
            .process_single_app_state_update(&AppStateUpdate {
                namespace: "ns1".to_string(),
                name: "wordcount".to_string(),
                app_id: Some("wordcount-1".to_string()),
                state: ApplicationStateType::FailedSubmission,
                error_message: Some("spark-submit exited with 1".to_string()),
                submission_time: None,
            })
            .await;

        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(
            status.application_state,
            ApplicationState {
                state: ApplicationStateType::FailedSubmission,
                error_message: Some("spark-submit exited with 1".to_string()),
            }
        );
        assert_eq!(
            h.events.reasons(),
            vec![EventReason::SparkApplicationSubmissionFailure]
        );
        assert_eq!(h.submissions.count(), 0);
    }

    #[tokio::test]
    async fn test_driver_state_update() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Submitted,
            RestartPolicy::Never,
        )]);

        let updated = h
            .controller
            .process_single_driver_state_update(&driver_update(POD_PHASE_RUNNING))
            .await
            .unwrap();

        let status = updated.status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::Running);
        assert_eq!(status.driver_info.pod_name.as_deref(), Some("wordcount-driver"));
        assert_eq!(
            status.driver_info.web_ui_address.as_deref(),
            Some("203.0.113.7:31040")
        );
        assert_eq!(status.completion_time, None);
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_driver_on_unknown_node_leaves_address_unset() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Submitted,
            RestartPolicy::Never,
        )]);
        let mut update = driver_update(POD_PHASE_RUNNING);
        update.node_name = Some("node-9".to_string());

        let updated = h
            .controller
            .process_single_driver_state_update(&update)
            .await
            .unwrap();

        assert_eq!(updated.status.unwrap().driver_info.web_ui_address, None);
    }

    #[tokio::test]
    async fn test_driver_state_update_of_deleted_application() {
        let h = harness(&[]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_FAILED)))
            .unwrap();
        drop(tx);

        h.controller.process_pod_state_updates(rx).await;

        assert_eq!(h.api.update_calls(), 0);
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_failed_driver_is_restarted_on_failure() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Running,
            RestartPolicy::OnFailure,
        )]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_FAILED)))
            .unwrap();
        drop(tx);

        h.controller.process_pod_state_updates(rx).await;

        assert_eq!(
            h.events.reasons(),
            vec![
                EventReason::SparkApplicationTermination,
                EventReason::SparkApplicationResubmission
            ]
        );
        assert_eq!(h.submissions.count(), 1);
        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::New);
        assert_eq!(status.completion_time, None);
        assert_ne!(status.app_id.as_deref(), Some("wordcount-1"));
    }

    #[tokio::test]
    async fn test_completed_driver_is_not_restarted_on_failure() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Running,
            RestartPolicy::OnFailure,
        )]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_SUCCEEDED)))
            .unwrap();
        drop(tx);

        h.controller.process_pod_state_updates(rx).await;

        assert_eq!(
            h.events.reasons(),
            vec![EventReason::SparkApplicationTermination]
        );
        assert_eq!(h.submissions.count(), 0);
        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::Completed);
        assert!(status.completion_time.is_some());
    }

    #[tokio::test]
    async fn test_completed_driver_is_restarted_always() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Running,
            RestartPolicy::Always,
        )]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_SUCCEEDED)))
            .unwrap();
        drop(tx);

        h.controller.process_pod_state_updates(rx).await;

        assert_eq!(
            h.events.reasons(),
            vec![
                EventReason::SparkApplicationTermination,
                EventReason::SparkApplicationResubmission
            ]
        );
        assert_eq!(h.submissions.count(), 1);
        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::New);
        assert_ne!(status.app_id.as_deref(), Some("wordcount-1"));
    }

    #[tokio::test]
    async fn test_repeated_terminal_driver_update_restarts_once() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Running,
            RestartPolicy::OnFailure,
        )]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_FAILED)))
            .unwrap();
        tx.send(PodStateUpdate::Driver(driver_update(POD_PHASE_FAILED)))
            .unwrap();
        drop(tx);

        h.controller.process_pod_state_updates(rx).await;

        assert_eq!(h.submissions.count(), 1);
        assert_eq!(
            h.events.reasons(),
            vec![
                EventReason::SparkApplicationTermination,
                EventReason::SparkApplicationResubmission
            ]
        );
        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::New);
        assert_eq!(status.driver_info.pod_name, None);
    }

    #[tokio::test]
    async fn test_late_submission_result_keeps_driver_state() {
        let h = harness(&[app_with_state(ApplicationStateType::New, RestartPolicy::Never)]);
        let submission_time = Time(Utc.ymd(2022, 7, 1).and_hms(9, 0, 0));

        h.controller
            .process_single_driver_state_update(&driver_update(POD_PHASE_SUCCEEDED))
            .await
            .unwrap();
        h.controller
            .process_single_app_state_update(&AppStateUpdate {
                namespace: "ns1".to_string(),
                name: "wordcount".to_string(),
                app_id: Some("wordcount-1".to_string()),
                state: ApplicationStateType::Submitted,
                error_message: None,
                submission_time: Some(submission_time.clone()),
            })
            .await;

        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(status.application_state.state, ApplicationStateType::Completed);
        assert_eq!(status.submission_time, Some(submission_time));
    }

    #[tokio::test]
    async fn test_result_of_earlier_submission_is_ignored() {
        let mut app = app_with_state(ApplicationStateType::New, RestartPolicy::Always);
        if let Some(status) = app.status.as_mut() {
            status.app_id = Some("wordcount-2".to_string());
        }
        let h = harness(&[app]);

        h.controller
            .process_single_app_state_update(&AppStateUpdate {
                namespace: "ns1".to_string(),
                name: "wordcount".to_string(),
                app_id: Some("wordcount-1".to_string()),
                state: ApplicationStateType::FailedSubmission,
                error_message: Some("spark-submit exited with 1".to_string()),
                submission_time: None,
            })
            .await;
        h.controller
            .process_single_executor_state_update(&executor_update(ExecutorState::Failed))
            .await;

        assert_eq!(h.api.update_calls(), 0);
        assert_eq!(h.api.stored(KEY).unwrap().state(), ApplicationStateType::New);
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_sync_timeout_removes_crd() {
        let h = harness(&[]);
        let crds = FakeCrds::default();
        let (_app_tx, app_rx) = mpsc::channel(1);
        let (_pod_tx, pod_rx) = mpsc::unbounded_channel();
        let events =
            futures::stream::pending::<Result<watcher::Event<SparkApplication>, watcher::Error>>();

        let err = h
            .controller
            .clone()
            .run(
                &crds,
                ApplicationCache::new(),
                events,
                1,
                app_rx,
                pod_rx,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CacheSyncTimeout));
        assert!(*crds.installed.lock().unwrap());
        assert!(*crds.removed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_pending_executors_are_not_recorded() {
        let h = harness(&[app_with_state(
            ApplicationStateType::Running,
            RestartPolicy::Never,
        )]);

        h.controller
            .process_single_executor_state_update(&executor_update(ExecutorState::Pending))
            .await;
        assert_eq!(h.api.update_calls(), 0);

        h.controller
            .process_single_executor_state_update(&executor_update(ExecutorState::Running))
            .await;
        let status = h.api.stored(KEY).unwrap().status.unwrap();
        assert_eq!(
            status.executor_state,
            BTreeMap::from([("wordcount-exec-1".to_string(), ExecutorState::Running)])
        );
        assert!(h.events.reasons().is_empty());
    }

    /// A wordcount application in ns1 goes from creation to completion through the whole
    /// controller, with a watch cache that never sees the status writes
    #[tokio::test]
    async fn test_wordcount_lifecycle() {
        let mut app = test_app("ns1", "wordcount");
        app.spec.restart_policy = RestartPolicy::Never;
        let api = Arc::new(FakeApplicationApi::with_app(&app));
        let cache = ApplicationCache::new();
        let h = harness_with_store(api, Arc::new(cache.clone()));
        let crds = Arc::new(FakeCrds::default());
        let (app_tx, app_rx) = mpsc::channel(4);
        let (pod_tx, pod_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let events = futures::StreamExt::chain(
            futures::stream::iter(vec![Ok(watcher::Event::Restarted(vec![app]))]),
            futures::stream::pending::<
                Result<watcher::Event<SparkApplication>, watcher::Error>,
            >(),
        );
        let run = tokio::spawn({
            let controller = h.controller.clone();
            let crds = crds.clone();
            let shutdown = shutdown.clone();
            async move {
                controller
                    .run(crds.as_ref(), cache, events, 2, app_rx, pod_rx, shutdown)
                    .await
            }
        });

        eventually(|| h.submissions.count() == 1).await;
        assert!(*crds.installed.lock().unwrap());
        let app_id = h.api.stored(KEY).unwrap().app_id().unwrap().to_string();
        assert!(app_id.starts_with("wordcount-"));

        app_tx
            .send(AppStateUpdate {
                namespace: "ns1".to_string(),
                name: "wordcount".to_string(),
                app_id: Some(app_id.clone()),
                state: ApplicationStateType::Submitted,
                error_message: None,
                submission_time: Some(Time(Utc::now())),
            })
            .await
            .unwrap();
        eventually(|| h.api.stored(KEY).unwrap().state() == ApplicationStateType::Submitted)
            .await;

        let driver = |phase| DriverStateUpdate {
            app_id: Some(app_id.clone()),
            ..driver_update(phase)
        };
        pod_tx
            .send(PodStateUpdate::Driver(driver(POD_PHASE_RUNNING)))
            .unwrap();
        pod_tx
            .send(PodStateUpdate::Executor(ExecutorStateUpdate {
                app_id: Some(app_id.clone()),
                ..executor_update(ExecutorState::Running)
            }))
            .unwrap();
        pod_tx
            .send(PodStateUpdate::Driver(driver(POD_PHASE_SUCCEEDED)))
            .unwrap();
        eventually(|| h.api.stored(KEY).unwrap().state() == ApplicationStateType::Completed)
            .await;

        let stored = h.api.stored(KEY).unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.app_id.as_deref(), Some(app_id.as_str()));
        assert!(status.submission_time.is_some());
        assert!(status.completion_time.is_some());
        assert_eq!(status.driver_info.pod_name.as_deref(), Some("wordcount-driver"));
        assert_eq!(
            status.driver_info.web_ui_address.as_deref(),
            Some("203.0.113.7:31040")
        );
        assert_eq!(
            status.executor_state.get("wordcount-exec-1"),
            Some(&ExecutorState::Running)
        );
        assert_eq!(h.submissions.count(), 1);
        assert_eq!(
            h.events.reasons(),
            vec![
                EventReason::SparkApplicationSubmission,
                EventReason::SparkApplicationTermination
            ]
        );

        shutdown.cancel();
        drop(app_tx);
        drop(pod_tx);
        run.await.unwrap().unwrap();
        assert!(*crds.removed.lock().unwrap());
    }
}

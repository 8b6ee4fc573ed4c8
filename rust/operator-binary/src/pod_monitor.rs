//! Watches driver and executor pods and reports their phase changes
//!
//! Pods are recognised by the `spark-role` label set through `spark-submit`. Every observed
//! pod is turned into a [`PodStateUpdate`] and sent to the controller, which is the only
//! component allowed to write application status.

use futures::{Stream, StreamExt};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time,
    },
    kube::{api::ListParams, runtime::watcher, Api},
};
use stackable_spark_k8s_crd::{
    constants::{
        SPARK_APP_ID_LABEL, SPARK_APP_NAME_LABEL, SPARK_DRIVER_ROLE, SPARK_EXECUTOR_ID_LABEL,
        SPARK_EXECUTOR_ROLE, SPARK_ROLE_LABEL,
    },
    ExecutorState,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POD_PHASE_PENDING: &str = "Pending";
pub const POD_PHASE_RUNNING: &str = "Running";
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";

#[derive(Clone, Debug, PartialEq)]
pub struct DriverStateUpdate {
    pub app_namespace: String,
    pub app_name: String,
    /// The submission that launched the pod, `None` for pods without the app id label
    pub app_id: Option<String>,
    pub pod_name: String,
    pub pod_phase: String,
    pub node_name: Option<String>,
    pub completion_time: Option<Time>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorStateUpdate {
    pub app_namespace: String,
    pub app_name: String,
    pub app_id: Option<String>,
    pub pod_name: String,
    pub executor_id: String,
    pub state: ExecutorState,
}

/// Driver and executor observations share one channel so their relative order is kept
#[derive(Clone, Debug, PartialEq)]
pub enum PodStateUpdate {
    Driver(DriverStateUpdate),
    Executor(ExecutorStateUpdate),
}

pub fn executor_pod_phase_to_executor_state(pod_phase: &str) -> ExecutorState {
    match pod_phase {
        POD_PHASE_PENDING => ExecutorState::Pending,
        POD_PHASE_RUNNING => ExecutorState::Running,
        POD_PHASE_SUCCEEDED => ExecutorState::Completed,
        POD_PHASE_FAILED => ExecutorState::Failed,
        _ => ExecutorState::Unknown,
    }
}

/// Converts an observed pod into an update, `None` for pods not launched for an application
pub fn pod_state_update(pod: &Pod) -> Option<PodStateUpdate> {
    let labels = pod.metadata.labels.as_ref()?;
    let app_name = labels.get(SPARK_APP_NAME_LABEL)?.clone();
    let app_id = labels.get(SPARK_APP_ID_LABEL).cloned();
    let app_namespace = pod.metadata.namespace.clone()?;
    let pod_name = pod.metadata.name.clone()?;
    let pod_phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_default();

    match labels.get(SPARK_ROLE_LABEL).map(String::as_str) {
        Some(SPARK_DRIVER_ROLE) => {
            let completion_time = match pod_phase.as_str() {
                POD_PHASE_SUCCEEDED | POD_PHASE_FAILED => driver_completion_time(pod),
                _ => None,
            };
            Some(PodStateUpdate::Driver(DriverStateUpdate {
                app_namespace,
                app_name,
                app_id,
                pod_name,
                node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
                pod_phase,
                completion_time,
            }))
        }
        Some(SPARK_EXECUTOR_ROLE) => Some(PodStateUpdate::Executor(ExecutorStateUpdate {
            app_namespace,
            app_name,
            app_id,
            pod_name,
            executor_id: labels
                .get(SPARK_EXECUTOR_ID_LABEL)
                .cloned()
                .unwrap_or_default(),
            state: executor_pod_phase_to_executor_state(&pod_phase),
        })),
        _ => None,
    }
}

/// When a terminated driver pod finished, derived only from the pod so repeated
/// observations agree
fn driver_completion_time(pod: &Pod) -> Option<Time> {
    container_finish_time(pod).or_else(|| ready_transition_time(pod))
}

/// The latest time any container of `pod` terminated
fn container_finish_time(pod: &Pod) -> Option<Time> {
    pod.status
        .as_ref()?
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|status| status.state.as_ref()?.terminated.as_ref()?.finished_at.clone())
        .max_by_key(|time| time.0)
}

/// Pods that never ran a container to completion, like evicted ones, still record when
/// they stopped being ready
fn ready_transition_time(pod: &Pod) -> Option<Time> {
    pod.status
        .as_ref()?
        .conditions
        .iter()
        .flatten()
        .find(|condition| condition.type_ == "Ready")?
        .last_transition_time
        .clone()
}

pub struct SparkPodMonitor {
    pods: Api<Pod>,
    updates: UnboundedSender<PodStateUpdate>,
}

impl SparkPodMonitor {
    pub fn new(pods: Api<Pod>, updates: UnboundedSender<PodStateUpdate>) -> Self {
        SparkPodMonitor { pods, updates }
    }

    /// Reports pod changes until `shutdown` fires, dropping the sender on return
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting the Spark pod monitor");
        let events = watcher(
            self.pods.clone(),
            ListParams::default().labels(SPARK_ROLE_LABEL),
        );
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = forward_pod_events(events, &self.updates) => {}
        }
        info!("Stopped the Spark pod monitor");
    }
}

async fn forward_pod_events<S>(events: S, updates: &UnboundedSender<PodStateUpdate>)
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        let pods = match event {
            Ok(watcher::Event::Applied(pod)) => vec![pod],
            Ok(watcher::Event::Restarted(pods)) => pods,
            // Pod removal carries no new phase
            Ok(watcher::Event::Deleted(_)) => continue,
            Err(err) => {
                warn!("Spark pod watch failed: {}", err);
                continue;
            }
        };

        for update in pods.iter().filter_map(pod_state_update) {
            debug!("Observed {:?}", update);
            if updates.send(update).is_err() {
                return;
            }
        }
    }
}

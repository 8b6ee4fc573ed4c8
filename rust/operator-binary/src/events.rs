use stackable_spark_k8s_crd::{constants::CONTROLLER_NAME, SparkApplication};
use tracing::info;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum EventReason {
    SparkApplicationSubmission,
    SparkApplicationDeletion,
    SparkApplicationTermination,
    SparkApplicationSubmissionFailure,
    SparkApplicationResubmission,
}

/// Sink for human readable events about an application's lifecycle
pub trait EventRecorder: Send + Sync {
    fn record(&self, app: &SparkApplication, reason: EventReason, message: String);
}

/// Records events as structured log lines
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn record(&self, app: &SparkApplication, reason: EventReason, message: String) {
        info!(
            controller = CONTROLLER_NAME,
            reason = %reason,
            namespace = app.metadata.namespace.as_deref().unwrap_or_default(),
            name = app.metadata.name.as_deref().unwrap_or_default(),
            "{}",
            message
        );
    }
}

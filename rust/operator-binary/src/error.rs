use snafu::Snafu;
use stackable_operator::kube;
use std::time::Duration;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("SparkApplication {} was not found", key))]
    NotFound { key: String },
    #[snafu(display("SparkApplication {} was modified concurrently", key))]
    Conflict { key: String },
    #[snafu(display("failed to get SparkApplication {}", key))]
    GetApplication { source: kube::Error, key: String },
    #[snafu(display("failed to update status of SparkApplication {}", key))]
    UpdateStatus { source: kube::Error, key: String },
    #[snafu(display("failed to serialize status of SparkApplication {}", key))]
    SerializeStatus {
        source: serde_json::Error,
        key: String,
    },
    #[snafu(display("invalid SparkApplication key {}", key))]
    InvalidKey { key: String },
    #[snafu(display("SparkApplication {} is missing metadata", key))]
    MissingMetadata {
        source: stackable_spark_k8s_crd::Error,
        key: String,
    },
    #[snafu(display("SparkApplication {} has no appId, cannot build submission", key))]
    NoAppId { key: String },
    #[snafu(display("SparkApplication {} has no mainApplicationFile", key))]
    NoMainApplicationFile { key: String },
    #[snafu(display("failed to build driver UI service for {}", key))]
    BuildUiService {
        source: stackable_operator::error::Error,
        key: String,
    },
    #[snafu(display("failed to apply driver UI service for {}", key))]
    ApplyUiService { source: kube::Error, key: String },
    #[snafu(display("driver UI service for {} has no node port assigned", key))]
    NoUiNodePort { key: String },
    #[snafu(display("failed to apply CustomResourceDefinition {}", name))]
    InstallCrd { source: kube::Error, name: String },
    #[snafu(display(
        "CustomResourceDefinition {} was not established within {:?}",
        name,
        timeout
    ))]
    CrdNotEstablished { name: String, timeout: Duration },
    #[snafu(display("failed to delete CustomResourceDefinition {}", name))]
    RemoveCrd { source: kube::Error, name: String },
    #[snafu(display("timed out waiting for the SparkApplication cache to sync"))]
    CacheSyncTimeout,
}

impl Error {
    /// Deleted applications surface as not found and are never worth retrying
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

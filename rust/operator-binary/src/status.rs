//! Optimistic-concurrency status updates for [`SparkApplication`]s
//!
//! Every status change goes through [`update_status_with_retries`]. The mutation is passed
//! in as a closure so it can be replayed against a freshly fetched object whenever the API
//! server rejects a write because the local copy was stale.

use crate::error::{
    ConflictSnafu, Error, GetApplicationSnafu, NotFoundSnafu, SerializeStatusSnafu,
    UpdateStatusSnafu,
};
use crate::spark_controller::application_key;
use async_trait::async_trait;
use snafu::ResultExt;
use stackable_operator::kube::{
    self,
    api::{Api, PostParams},
};
use stackable_spark_k8s_crd::{SparkApplication, SparkApplicationStatus};
use tracing::{error, trace};

pub const MAXIMUM_UPDATE_RETRIES: usize = 3;

/// Authoritative reads and writes of [`SparkApplication`]s, as opposed to the watch cache
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<SparkApplication, Error>;

    /// Persists the status of `app`, failing with [`Error::Conflict`] if `app` carries an
    /// outdated resource version
    async fn update_status(&self, app: &SparkApplication) -> Result<SparkApplication, Error>;
}

/// [`ApplicationApi`] backed by the Kubernetes API server
pub struct KubeApplicationApi {
    client: kube::Client,
}

impl KubeApplicationApi {
    pub fn new(client: kube::Client) -> Self {
        KubeApplicationApi { client }
    }

    fn api(&self, namespace: &str) -> Api<SparkApplication> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ApplicationApi for KubeApplicationApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<SparkApplication, Error> {
        let key = application_key(namespace, name);
        match self.api(namespace).get(name).await {
            Ok(app) => Ok(app),
            Err(kube::Error::Api(response)) if response.code == 404 => NotFoundSnafu { key }.fail(),
            Err(source) => Err(source).context(GetApplicationSnafu { key }),
        }
    }

    async fn update_status(&self, app: &SparkApplication) -> Result<SparkApplication, Error> {
        let namespace = app.metadata.namespace.as_deref().unwrap_or_default();
        let name = app.metadata.name.as_deref().unwrap_or_default();
        let key = application_key(namespace, name);
        let data = serde_json::to_vec(app).context(SerializeStatusSnafu { key: key.clone() })?;

        match self
            .api(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
        {
            Ok(app) => Ok(app),
            Err(kube::Error::Api(response)) if response.code == 409 => ConflictSnafu { key }.fail(),
            Err(kube::Error::Api(response)) if response.code == 404 => NotFoundSnafu { key }.fail(),
            Err(source) => Err(source).context(UpdateStatusSnafu { key }),
        }
    }
}

/// Applies `update` to the status of `to_update` and persists the result.
///
/// Returns `None` if the mutation did not change the status compared to `original`, or if
/// the object could not be persisted within [`MAXIMUM_UPDATE_RETRIES`] attempts. Failed
/// attempts re-fetch the latest object and apply `update` to that, so `update` must only
/// depend on the status it is given.
pub async fn update_status_with_retries<F>(
    api: &dyn ApplicationApi,
    original: &SparkApplication,
    mut to_update: SparkApplication,
    update: F,
) -> Option<SparkApplication>
where
    F: Fn(&mut SparkApplicationStatus),
{
    let namespace = original.metadata.namespace.clone().unwrap_or_default();
    let name = original.metadata.name.clone().unwrap_or_default();
    let key = application_key(&namespace, &name);

    let mut attempt = 1;
    loop {
        let err = match try_update(api, original, &mut to_update, &update).await {
            Ok(updated) => return updated,
            Err(err) => err,
        };

        if attempt >= MAXIMUM_UPDATE_RETRIES {
            error!(
                "failed to update SparkApplication {} after {} attempts: {}",
                key, attempt, err
            );
            return None;
        }
        trace!(
            "update of SparkApplication {} failed on attempt {}, refreshing: {}",
            key,
            attempt,
            err
        );

        to_update = match api.get(&namespace, &name).await {
            Ok(latest) => latest,
            Err(err) => {
                error!("failed to get SparkApplication {}: {}", key, err);
                return None;
            }
        };
        attempt += 1;
    }
}

async fn try_update<F>(
    api: &dyn ApplicationApi,
    original: &SparkApplication,
    to_update: &mut SparkApplication,
    update: &F,
) -> Result<Option<SparkApplication>, Error>
where
    F: Fn(&mut SparkApplicationStatus),
{
    update(to_update.status.get_or_insert_with(Default::default));

    // A missing status is the same as an empty one
    if original.status.clone().unwrap_or_default() == to_update.status.clone().unwrap_or_default()
    {
        return Ok(None);
    }

    api.update_status(to_update).await.map(Some)
}

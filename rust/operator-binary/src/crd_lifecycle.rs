//! Installation and removal of the [`SparkApplication`] CustomResourceDefinition

use crate::error::{CrdNotEstablishedSnafu, Error, InstallCrdSnafu, RemoveCrdSnafu};
use async_trait::async_trait;
use snafu::ResultExt;
use stackable_operator::{
    k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    kube::{
        self,
        api::{DeleteParams, Patch, PatchParams},
        runtime::wait::{await_condition, conditions},
        Api, CustomResourceExt,
    },
};
use stackable_spark_k8s_crd::{constants::FIELD_MANAGER_SCOPE, SparkApplication};
use std::time::Duration;
use tracing::info;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Hooks run before the controller starts watching and after it stopped
#[async_trait]
pub trait CrdLifecycle: Send + Sync {
    async fn install(&self) -> Result<(), Error>;
    async fn remove(&self) -> Result<(), Error>;
}

pub struct KubeCrdLifecycle {
    client: kube::Client,
}

impl KubeCrdLifecycle {
    pub fn new(client: kube::Client) -> Self {
        KubeCrdLifecycle { client }
    }

    fn api(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl CrdLifecycle for KubeCrdLifecycle {
    async fn install(&self) -> Result<(), Error> {
        let name = SparkApplication::crd_name();
        info!("Creating CustomResourceDefinition {}", name);
        self.api()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER_SCOPE).force(),
                &Patch::Apply(SparkApplication::crd()),
            )
            .await
            .context(InstallCrdSnafu { name })?;

        let established = await_condition(self.api(), name, conditions::is_crd_established());
        match tokio::time::timeout(ESTABLISH_TIMEOUT, established).await {
            Ok(Ok(_)) => Ok(()),
            _ => CrdNotEstablishedSnafu {
                name,
                timeout: ESTABLISH_TIMEOUT,
            }
            .fail(),
        }
    }

    async fn remove(&self) -> Result<(), Error> {
        let name = SparkApplication::crd_name();
        info!("Deleting CustomResourceDefinition {}", name);
        self.api()
            .delete(name, &DeleteParams::default())
            .await
            .context(RemoveCrdSnafu { name })?;
        Ok(())
    }
}

/// Leaves CRD management to the cluster administrator
pub struct ExternallyManagedCrd;

#[async_trait]
impl CrdLifecycle for ExternallyManagedCrd {
    async fn install(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn remove(&self) -> Result<(), Error> {
        Ok(())
    }
}

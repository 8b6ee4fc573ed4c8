//! Access to the Spark driver web UI from outside the cluster

use crate::error::{
    ApplyUiServiceSnafu, BuildUiServiceSnafu, Error, MissingMetadataSnafu, NoUiNodePortSnafu,
};
use crate::spark_controller::application_key;
use crate::util::apply_owned;
use async_trait::async_trait;
use snafu::{OptionExt, ResultExt};
use stackable_operator::{
    builder::ObjectMetaBuilder,
    k8s_openapi::{
        api::core::v1::{Node, Service, ServicePort, ServiceSpec},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::{self, Api},
};
use stackable_spark_k8s_crd::{
    constants::{FIELD_MANAGER_SCOPE, SPARK_UI_PORT, SPARK_UI_PORT_NAME},
    SparkApplication,
};
use tracing::warn;

/// The `Service` exposing the driver web UI of an application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UiService {
    pub name: String,
    pub node_port: i32,
}

#[async_trait]
pub trait UiAccess: Send + Sync {
    /// Makes sure a `Service` for the driver UI of `app` exists, this is idempotent
    async fn ensure_ui_service(&self, app: &SparkApplication) -> Result<UiService, Error>;

    /// The external IP of a node, `None` if it can't be determined
    async fn node_external_ip(&self, node_name: &str) -> Option<String>;
}

pub struct KubeUiAccess {
    client: kube::Client,
}

impl KubeUiAccess {
    pub fn new(client: kube::Client) -> Self {
        KubeUiAccess { client }
    }
}

#[async_trait]
impl UiAccess for KubeUiAccess {
    async fn ensure_ui_service(&self, app: &SparkApplication) -> Result<UiService, Error> {
        let key = app_key(app);
        let service = build_ui_service(app)?;
        let applied = apply_owned(&self.client, FIELD_MANAGER_SCOPE, &service)
            .await
            .context(ApplyUiServiceSnafu { key: key.clone() })?;

        let node_port = applied
            .spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .find_map(|port| port.node_port)
            .context(NoUiNodePortSnafu { key })?;
        Ok(UiService {
            name: applied.metadata.name.unwrap_or_default(),
            node_port,
        })
    }

    async fn node_external_ip(&self, node_name: &str) -> Option<String> {
        let node = match Api::<Node>::all(self.client.clone()).get(node_name).await {
            Ok(node) => node,
            Err(err) => {
                warn!("failed to get node {}: {}", node_name, err);
                return None;
            }
        };
        node_external_ip(&node)
    }
}

fn app_key(app: &SparkApplication) -> String {
    application_key(
        app.metadata.namespace.as_deref().unwrap_or_default(),
        app.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// The NodePort [`Service`] in front of the driver pod of `app`
pub fn build_ui_service(app: &SparkApplication) -> Result<Service, Error> {
    let key = app_key(app);
    app.app_namespace()
        .context(MissingMetadataSnafu { key: key.clone() })?;
    app.app_name()
        .context(MissingMetadataSnafu { key: key.clone() })?;

    Ok(Service {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(app)
            .name(app.ui_service_name().unwrap_or_default())
            .ownerreference_from_resource(app, None, Some(true))
            .context(BuildUiServiceSnafu { key })?
            .with_labels(app.selector_labels())
            .build(),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(SPARK_UI_PORT_NAME.to_string()),
                port: SPARK_UI_PORT.into(),
                target_port: Some(IntOrString::Int(SPARK_UI_PORT.into())),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            selector: Some(app.driver_selector_labels()),
            type_: Some("NodePort".to_string()),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

fn node_external_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .iter()
        .flatten()
        .find(|address| address.type_ == "ExternalIP")
        .map(|address| address.address.clone())
}

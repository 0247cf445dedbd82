//! The target of all operations: a multi-component stateful cluster.
//!
//! Only the parts of the cluster spec that operations read or mutate are modelled here. Turning a
//! component spec into workloads is the job of the component layer behind
//! [`ComponentSynthesizer`](crate::collaborators::ComponentSynthesizer).

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ResourceRequirements, ServicePort},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "apps.stackable.tech",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cl",
    status = "ClusterStatus",
    namespaced,
    derive = "PartialEq",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub component_specs: Vec<ClusterComponentSpec>,

    #[serde(default)]
    pub shardings: Vec<ClusterSharding>,

    /// Cluster level services, independent of a single component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterComponentService>,

    /// Order in which components are rolled. Each entry is a comma separated group of component
    /// names which may be updated together.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_order: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_def: Option<String>,

    pub replicas: i32,

    /// Named overrides applied to a subset of the pods of this component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceTemplate>,

    /// Pod names which are taken offline, their ordinals are skipped during name generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<ClusterComponentVolumeClaimTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterComponentService>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

impl ClusterComponentSpec {
    pub fn instance_template(&self, name: &str) -> Option<&InstanceTemplate> {
        self.instances.iter().find(|template| template.name == name)
    }

    pub fn volume_claim_template(&self, name: &str) -> Option<&ClusterComponentVolumeClaimTemplate> {
        self.volume_claim_templates
            .iter()
            .find(|vct| vct.name == name)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    pub name: String,

    /// Defaults to 1 if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Explicit ordinals to use for the pods of this template instead of counting up from 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinals: Option<Ordinals>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<ClusterComponentVolumeClaimTemplate>,
}

impl InstanceTemplate {
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ordinals {
    #[serde(default)]
    pub ranges: Vec<OrdinalRange>,

    #[serde(default)]
    pub discrete: Vec<i32>,
}

/// An inclusive range of ordinals.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdinalRange {
    pub start: i32,
    pub end: i32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentVolumeClaimTemplate {
    pub name: String,
    pub storage: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentService {
    pub name: String,

    /// `ClusterIP`, `NodePort` or `LoadBalancer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Only route to pods holding this role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ClusterComponentService {
    pub fn is_load_balancer(&self) -> bool {
        self.service_type.as_deref() == Some("LoadBalancer")
    }
}

/// A component template replicated into `shards` independent components.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSharding {
    pub name: String,
    pub template: ClusterComponentSpec,
    pub shards: i32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    #[serde(default)]
    pub components: BTreeMap<String, ClusterComponentStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,

    /// Failure messages of individual objects, keyed like `Pod/<name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ClusterPhase {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl ClusterPhase {
    /// Phases in which the cluster is (at least partially) serving.
    pub const UP_RUNNING: &'static [Self] = &[Self::Running, Self::Failed, Self::Abnormal, Self::Updating];

    pub fn is_stopped_or_stopping(&self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ComponentPhase {
    Creating,
    Running,
    Updating,
    Starting,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl ComponentPhase {
    pub fn is_failed_or_abnormal(&self) -> bool {
        matches!(self, Self::Failed | Self::Abnormal)
    }

    /// A phase the component settles in once the workload layer is done.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Stopped | Self::Failed | Self::Abnormal
        )
    }
}

impl Cluster {
    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    /// Returns the spec of a component, falling back to the template of a sharding of that name.
    pub fn component_spec(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.spec
            .component_specs
            .iter()
            .find(|spec| spec.name == name)
            .or_else(|| self.sharding(name).map(|sharding| &sharding.template))
    }

    pub fn sharding(&self, name: &str) -> Option<&ClusterSharding> {
        self.spec
            .shardings
            .iter()
            .find(|sharding| sharding.name == name)
    }

    pub fn component_status(&self, full_component_name: &str) -> Option<&ClusterComponentStatus> {
        self.status
            .as_ref()
            .and_then(|status| status.components.get(full_component_name))
    }

    pub fn component_phase(&self, full_component_name: &str) -> Option<ComponentPhase> {
        self.component_status(full_component_name)
            .and_then(|status| status.phase)
    }

    /// Names of all components and shardings, in spec order.
    pub fn component_names(&self) -> Vec<String> {
        self.spec
            .component_specs
            .iter()
            .map(|spec| spec.name.clone())
            .chain(self.spec.shardings.iter().map(|sharding| sharding.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parse_cluster_with_sharding() {
        let cluster: Cluster = serde_yaml::from_str(indoc! {"
            apiVersion: apps.stackable.tech/v1alpha1
            kind: Cluster
            metadata:
              name: redis
              namespace: default
            spec:
              componentSpecs:
                - name: proxy
                  replicas: 2
                  instances:
                    - name: big
              shardings:
                - name: shard
                  shards: 3
                  template:
                    name: shard
                    replicas: 2
            status:
              phase: Running
              components:
                proxy:
                  phase: Running
        "})
        .expect("valid cluster");

        assert_eq!(cluster.phase(), Some(ClusterPhase::Running));
        assert_eq!(cluster.component_spec("proxy").map(|c| c.replicas), Some(2));
        assert_eq!(cluster.component_spec("shard").map(|c| c.replicas), Some(2));
        assert_eq!(
            cluster
                .component_spec("proxy")
                .and_then(|c| c.instance_template("big"))
                .map(InstanceTemplate::replicas),
            Some(1)
        );
        assert_eq!(cluster.component_names(), vec!["proxy", "shard"]);
        assert_eq!(
            cluster.component_phase("proxy"),
            Some(ComponentPhase::Running)
        );
    }
}

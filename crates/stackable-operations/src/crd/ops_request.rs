//! The [`OpsRequest`] custom resource, the user facing unit of work.
//!
//! The spec carries an immutable [`Operation`], one typed payload list per operation type. The
//! status is the only externally observable contract of the engine: phase, progress string,
//! per-component progress details and conditions.

use std::{borrow::Cow, collections::BTreeMap};

use jiff::Timestamp;
use k8s_openapi::{
    api::core::v1::ResourceRequirements,
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
};
use kube::CustomResource;
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};

use crate::crd::cluster::{ClusterComponentService, InstanceTemplate};

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "operations.stackable.tech",
    version = "v1alpha1",
    kind = "OpsRequest",
    plural = "opsrequests",
    shortname = "ops",
    status = "OpsRequestStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    /// Name of the [`Cluster`](crate::crd::cluster::Cluster) in the same namespace.
    pub cluster_name: String,

    #[serde(flatten)]
    pub operation: Operation,

    /// Skips the queue and the cluster phase check, and aborts conflicting earlier requests.
    #[serde(default)]
    pub force: bool,

    /// Reverts a running request, or drops a pending one.
    #[serde(default)]
    pub cancel: bool,

    /// Name of another request in the same namespace which has to succeed first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,

    /// The request is aborted if it has not completed this many seconds after it started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// How long to wait for the cluster to enter an allowed phase before failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_condition_deadline_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_succeed: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_unsuccessful_completion: Option<u64>,
}

/// The operation to perform, tagged by `type`.
///
/// The schema is written by hand: structural CRD schemas need a single definition of `type`, so
/// it is published as one object with `type` and every payload as optional siblings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    HorizontalScaling {
        horizontal_scaling: Vec<HorizontalScaling>,
    },

    #[serde(rename_all = "camelCase")]
    VerticalScaling {
        vertical_scaling: Vec<VerticalScaling>,
    },

    #[serde(rename_all = "camelCase")]
    VolumeExpansion {
        volume_expansion: Vec<VolumeExpansion>,
    },

    Restart {
        #[serde(default)]
        restart: Vec<ComponentOps>,
    },

    Stop {
        #[serde(default)]
        stop: Vec<ComponentOps>,
    },

    Start {
        #[serde(default)]
        start: Vec<ComponentOps>,
    },

    Switchover {
        switchover: Vec<Switchover>,
    },

    Expose {
        expose: Vec<Expose>,
    },

    Reconfigure {
        reconfigure: Vec<Reconfigure>,
    },

    #[serde(rename_all = "camelCase")]
    RebuildInstance {
        rebuild_from: Vec<RebuildInstance>,
    },

    Custom {
        custom: CustomOps,
    },
}

impl JsonSchema for Operation {
    fn schema_name() -> Cow<'static, str> {
        "Operation".into()
    }

    fn inline_schema() -> bool {
        true
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        let ops_type = generator.subschema_for::<OpsType>();
        let horizontal_scaling = generator.subschema_for::<Vec<HorizontalScaling>>();
        let vertical_scaling = generator.subschema_for::<Vec<VerticalScaling>>();
        let volume_expansion = generator.subschema_for::<Vec<VolumeExpansion>>();
        let component_ops = generator.subschema_for::<Vec<ComponentOps>>();
        let switchover = generator.subschema_for::<Vec<Switchover>>();
        let expose = generator.subschema_for::<Vec<Expose>>();
        let reconfigure = generator.subschema_for::<Vec<Reconfigure>>();
        let rebuild_from = generator.subschema_for::<Vec<RebuildInstance>>();
        let custom = generator.subschema_for::<CustomOps>();
        json_schema!({
            "type": "object",
            "required": ["type"],
            "properties": {
                "type": ops_type,
                "horizontalScaling": horizontal_scaling,
                "verticalScaling": vertical_scaling,
                "volumeExpansion": volume_expansion,
                "restart": component_ops,
                "stop": component_ops,
                "start": component_ops,
                "switchover": switchover,
                "expose": expose,
                "reconfigure": reconfigure,
                "rebuildFrom": rebuild_from,
                "custom": custom,
            },
        })
    }
}

impl Operation {
    pub fn ops_type(&self) -> OpsType {
        match self {
            Self::HorizontalScaling { .. } => OpsType::HorizontalScaling,
            Self::VerticalScaling { .. } => OpsType::VerticalScaling,
            Self::VolumeExpansion { .. } => OpsType::VolumeExpansion,
            Self::Restart { .. } => OpsType::Restart,
            Self::Stop { .. } => OpsType::Stop,
            Self::Start { .. } => OpsType::Start,
            Self::Switchover { .. } => OpsType::Switchover,
            Self::Expose { .. } => OpsType::Expose,
            Self::Reconfigure { .. } => OpsType::Reconfigure,
            Self::RebuildInstance { .. } => OpsType::RebuildInstance,
            Self::Custom { .. } => OpsType::Custom,
        }
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
    strum::EnumIter,
    strum::EnumString,
)]
pub enum OpsType {
    HorizontalScaling,
    VerticalScaling,
    VolumeExpansion,
    Restart,
    Stop,
    Start,
    Switchover,
    Expose,
    Reconfigure,
    RebuildInstance,
    Custom,
}

/// Implemented by every per-component payload.
pub trait ComponentPayload {
    fn component_name(&self) -> &str;
}

macro_rules! impl_component_payload {
    ($($payload:ty),+ $(,)?) => {
        $(
            impl ComponentPayload for $payload {
                fn component_name(&self) -> &str {
                    &self.component_name
                }
            }
        )+
    };
}

impl_component_payload!(
    ComponentOps,
    HorizontalScaling,
    VerticalScaling,
    VolumeExpansion,
    Switchover,
    Expose,
    Reconfigure,
    RebuildInstance,
    CustomOpsComponent,
);

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOps {
    pub component_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    pub component_name: String,

    /// Target shard count, only valid for shardings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_out: Option<ScaleOut>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_in: Option<ScaleIn>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaChanger {
    /// Total number of replicas to add or remove. Derived from the other fields if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_changes: Option<i32>,

    /// Replica changes of individual instance templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceReplicasTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReplicasTemplate {
    pub name: String,
    pub replica_changes: i32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOut {
    #[serde(flatten)]
    pub replica_changer: ReplicaChanger,

    /// Instance templates added to the component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_instances: Vec<InstanceTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances_to_online: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleIn {
    #[serde(flatten)]
    pub replica_changer: ReplicaChanger,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub online_instances_to_offline: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalScaling {
    pub component_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceResourceTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResourceTemplate {
    pub name: String,
    pub resources: ResourceRequirements,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExpansion {
    pub component_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<OpsRequestVolumeClaimTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceVolumeClaimTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestVolumeClaimTemplate {
    pub name: String,
    pub storage: Quantity,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceVolumeClaimTemplate {
    pub name: String,
    pub volume_claim_templates: Vec<OpsRequestVolumeClaimTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Switchover {
    pub component_name: String,

    /// The pod to promote, or `*` to let the lifecycle action pick one.
    pub instance_name: String,
}

impl Switchover {
    pub const ANY_INSTANCE: &'static str = "*";

    /// The explicitly requested candidate, if any.
    pub fn candidate(&self) -> Option<&str> {
        (self.instance_name != Self::ANY_INSTANCE).then_some(self.instance_name.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expose {
    /// Empty for cluster level services.
    #[serde(default)]
    pub component_name: String,

    pub switch: ExposeSwitch,

    pub services: Vec<ClusterComponentService>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ExposeSwitch {
    #[default]
    Enable,
    Disable,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconfigure {
    pub component_name: String,
    pub parameters: Vec<ParameterPair>,
}

/// A parameter to set, or to remove if `value` is not set.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPair {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildInstance {
    pub component_name: String,

    pub instances: Vec<Instance>,

    /// Rebuild the pods in place from a backup instead of replacing them with new pods.
    #[serde(default)]
    pub in_place: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOps {
    /// Name of the [`OpsDefinition`](crate::crd::ops_definition::OpsDefinition) to run.
    pub ops_definition_name: String,

    pub components: Vec<CustomOpsComponent>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOpsComponent {
    pub component_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<CustomParameter>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomParameter {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    #[serde(default)]
    pub phase: OpsPhase,

    /// `completed/expected`, e.g. `2/5`.
    #[serde(default)]
    pub progress: String,

    /// Generation of the cluster after the operation applied its changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_generation: Option<i64>,

    #[serde(default)]
    pub last_configuration: LastConfiguration,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, OpsRequestComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<OpsCondition>,
}

impl OpsRequestStatus {
    /// Sets the condition of the given type, keeping the transition time if the status did not
    /// change.
    pub fn set_condition(&mut self, condition: OpsCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|existing| existing.type_ == condition.type_)
        {
            Some(existing) => {
                let last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.take()
                } else {
                    condition.last_transition_time.clone()
                };
                *existing = OpsCondition {
                    last_transition_time,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }

    pub fn condition(&self, type_: OpsConditionType) -> Option<&OpsCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == type_)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum OpsPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Cancelling,
    Succeed,
    Failed,
    Cancelled,
    Aborted,
}

impl OpsPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed | Self::Failed | Self::Cancelled | Self::Aborted
        )
    }

    /// Whether a request in this phase may move to `next`. Staying in the same phase is always
    /// allowed, leaving a terminal phase never is.
    pub fn can_transition_to(&self, next: Self) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => matches!(
                next,
                Self::Creating | Self::Cancelled | Self::Failed | Self::Aborted
            ),
            Self::Creating => matches!(
                next,
                Self::Running | Self::Cancelling | Self::Failed | Self::Aborted
            ),
            Self::Running => matches!(
                next,
                Self::Succeed | Self::Failed | Self::Cancelling | Self::Aborted
            ),
            Self::Cancelling => matches!(next, Self::Cancelled | Self::Failed | Self::Aborted),
            Self::Succeed | Self::Failed | Self::Cancelled | Self::Aborted => false,
        }
    }
}

/// Pre-operation snapshot of every component the operation touches.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, LastComponentConfiguration>,
}

/// The snapshot of a single component.
///
/// `replicas` is always captured, so that expected pod sets can be derived for every admitted
/// request.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastComponentConfiguration {
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_claim_templates: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterComponentService>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<crate::crd::cluster::ComponentPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_details: Vec<ProgressDetail>,
}

/// The tracked status of one object (usually a pod) within an operation.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetail {
    /// E.g. `Pod/mycluster-mysql-0`.
    pub object_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,

    pub status: ProgressStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Time>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
pub enum ProgressStatus {
    #[default]
    Pending,
    Processing,
    Succeed,
    Failed,
}

impl ProgressStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsCondition {
    #[serde(rename = "type")]
    pub type_: OpsConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl OpsCondition {
    pub fn new(
        type_: OpsConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(Time(Timestamp::now())),
        }
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
)]
pub enum OpsConditionType {
    Validated,
    WaitForProgressing,
    Progressing,
    Cancelling,
    Cancelled,
    Succeed,
    Failed,
    Aborted,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl OpsRequest {
    pub fn ops_type(&self) -> OpsType {
        self.spec.operation.ops_type()
    }

    pub fn phase(&self) -> OpsPhase {
        self.status.as_ref().map(|status| status.phase).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut OpsRequestStatus {
        self.status.get_or_insert_with(OpsRequestStatus::default)
    }

    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.status
            .as_ref()
            .and_then(|status| status.start_timestamp.as_ref())
            .map(|time| time.0)
    }

    pub fn completion_timestamp(&self) -> Option<Timestamp> {
        self.status
            .as_ref()
            .and_then(|status| status.completion_timestamp.as_ref())
            .map(|time| time.0)
    }

    pub fn last_component_configuration(
        &self,
        component_name: &str,
    ) -> Option<&LastComponentConfiguration> {
        self.status
            .as_ref()
            .and_then(|status| status.last_configuration.components.get(component_name))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::CustomResourceExt as _;
    use rstest::rstest;
    use strum::IntoEnumIterator as _;

    use super::*;

    #[test]
    fn parse_horizontal_scaling_request() {
        let ops: OpsRequest = serde_yaml::from_str(indoc! {"
            apiVersion: operations.stackable.tech/v1alpha1
            kind: OpsRequest
            metadata:
              name: scale-out
              namespace: default
            spec:
              clusterName: mycluster
              type: HorizontalScaling
              force: true
              horizontalScaling:
                - componentName: mysql
                  scaleOut:
                    replicaChanges: 2
                    offlineInstancesToOnline:
                      - mycluster-mysql-3
                  scaleIn:
                    instances:
                      - name: big
                        replicaChanges: 1
        "})
        .expect("valid request");

        assert_eq!(ops.ops_type(), OpsType::HorizontalScaling);
        assert!(ops.spec.force);
        assert_eq!(ops.phase(), OpsPhase::Pending);

        let Operation::HorizontalScaling { horizontal_scaling } = &ops.spec.operation else {
            panic!("expected a horizontal scaling operation");
        };
        let scale_out = horizontal_scaling[0].scale_out.as_ref().expect("scale out");
        assert_eq!(scale_out.replica_changer.replica_changes, Some(2));
        assert_eq!(scale_out.offline_instances_to_online, vec![
            "mycluster-mysql-3"
        ]);
        let scale_in = horizontal_scaling[0].scale_in.as_ref().expect("scale in");
        assert_eq!(scale_in.replica_changer.instances, vec![InstanceReplicasTemplate {
            name: "big".to_owned(),
            replica_changes: 1
        }]);
    }

    #[test]
    fn crd_publishes_one_type_property() {
        let crd = OpsRequest::crd();
        let schema = crd.spec.versions[0]
            .schema
            .as_ref()
            .and_then(|validation| validation.open_api_v3_schema.as_ref())
            .expect("CRD has a schema");
        let spec = &schema.properties.as_ref().expect("root properties")["spec"];
        let properties = spec.properties.as_ref().expect("spec properties");

        for property in ["clusterName", "type", "horizontalScaling", "restart", "rebuildFrom"] {
            assert!(properties.contains_key(property), "missing {property}");
        }
        let types = properties["type"].enum_.as_ref().expect("type is an enum");
        assert_eq!(types.len(), OpsType::iter().count());
    }

    #[test]
    fn parse_stop_without_components() {
        let ops: OpsRequest = serde_yaml::from_str(indoc! {"
            apiVersion: operations.stackable.tech/v1alpha1
            kind: OpsRequest
            metadata:
              name: stop
            spec:
              clusterName: mycluster
              type: Stop
        "})
        .expect("valid request");

        assert_eq!(ops.spec.operation, Operation::Stop { stop: vec![] });
    }

    #[rstest]
    #[case::pending_to_creating(OpsPhase::Pending, OpsPhase::Creating, true)]
    #[case::pending_to_cancelled(OpsPhase::Pending, OpsPhase::Cancelled, true)]
    #[case::creating_to_running(OpsPhase::Creating, OpsPhase::Running, true)]
    #[case::running_to_cancelling(OpsPhase::Running, OpsPhase::Cancelling, true)]
    #[case::cancelling_to_cancelled(OpsPhase::Cancelling, OpsPhase::Cancelled, true)]
    #[case::running_to_aborted(OpsPhase::Running, OpsPhase::Aborted, true)]
    #[case::same_phase(OpsPhase::Running, OpsPhase::Running, true)]
    #[case::succeed_to_running(OpsPhase::Succeed, OpsPhase::Running, false)]
    #[case::aborted_to_running(OpsPhase::Aborted, OpsPhase::Running, false)]
    #[case::failed_to_succeed(OpsPhase::Failed, OpsPhase::Succeed, false)]
    #[case::running_to_pending(OpsPhase::Running, OpsPhase::Pending, false)]
    #[case::cancelling_to_succeed(OpsPhase::Cancelling, OpsPhase::Succeed, false)]
    fn phase_transitions(#[case] from: OpsPhase, #[case] to: OpsPhase, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn set_condition_keeps_transition_time_of_unchanged_status() {
        let mut status = OpsRequestStatus::default();
        let mut first = OpsCondition::new(
            OpsConditionType::Validated,
            ConditionStatus::True,
            "ValidateOpsRequestPassed",
            "first",
        );
        let original_time = Time("2024-01-01T00:00:00Z".parse().expect("valid timestamp"));
        first.last_transition_time = Some(original_time.clone());
        status.set_condition(first);
        status.set_condition(OpsCondition::new(
            OpsConditionType::Validated,
            ConditionStatus::True,
            "ValidateOpsRequestPassed",
            "second",
        ));

        assert_eq!(status.conditions.len(), 1);
        let condition = status
            .condition(OpsConditionType::Validated)
            .expect("condition is set");
        assert_eq!(condition.message.as_deref(), Some("second"));
        assert_eq!(condition.last_transition_time, Some(original_time));
    }
}

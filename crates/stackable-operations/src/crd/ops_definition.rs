//! [`OpsDefinition`] describes a user defined operation as a sequence of named actions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "operations.stackable.tech",
    version = "v1alpha1",
    kind = "OpsDefinition",
    plural = "opsdefinitions",
    shortname = "opsdef",
    namespaced,
    derive = "PartialEq",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OpsDefinitionSpec {
    /// Parameters accepted by the actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterDefinition>,

    /// Executed in order, for every targeted component.
    pub actions: Vec<OpsAction>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    pub name: String,

    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsAction {
    pub name: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// What happens to the remaining actions of a component if an action fails.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum FailurePolicy {
    /// Skip the remaining actions and fail the request.
    #[default]
    Fail,

    /// Continue with the next action.
    Ignore,
}

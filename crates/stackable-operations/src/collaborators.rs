//! Subsystems the engine drives but does not implement.
//!
//! The component layer, the lifecycle action runner and the backup/restore subsystem are
//! injected as trait objects through [`OpsContext`](crate::operations::OpsContext). All calls
//! may be repeated on every reconciliation, implementations have to be idempotent.

use async_trait::async_trait;
use snafu::Snafu;

use crate::crd::{
    cluster::Cluster,
    ops_definition::OpsAction,
    ops_request::{CustomParameter, Instance},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{what} not found"))]
    NotFound { what: String },

    #[snafu(display("action {action:?} failed: {message}"))]
    ActionFailed { action: String, message: String },

    #[snafu(display("{subsystem} is unavailable: {message}"))]
    Unavailable { subsystem: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A replication role declared by a component definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaRole {
    pub name: String,

    /// Whether a pod holding this role is the leader the others replicate from.
    pub is_leader: bool,
}

/// The workload level view of a component, as produced by the component layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynthesizedComponent {
    pub cluster_name: String,
    pub namespace: String,

    /// The full component name, including the shard suffix for sharding members.
    pub name: String,

    pub component_def: Option<String>,
    pub roles: Vec<ReplicaRole>,

    /// How long a pod has to be ready before it counts as available.
    pub min_ready_seconds: i32,

    /// Parameters only applied on process start.
    pub static_parameters: Vec<String>,

    /// Whether the component definition declares a switchover lifecycle action.
    pub has_switchover_action: bool,
}

impl SynthesizedComponent {
    pub fn leader_role(&self) -> Option<&ReplicaRole> {
        self.roles.iter().find(|role| role.is_leader)
    }
}

#[async_trait]
pub trait ComponentSynthesizer: Send + Sync {
    /// Synthesizes the component (or sharding member) `component_name` of `cluster`.
    async fn synthesize(
        &self,
        cluster: &Cluster,
        component_name: &str,
    ) -> Result<SynthesizedComponent>;

    /// Full component names of all current members of a sharding.
    async fn list_sharding_components(
        &self,
        cluster: &Cluster,
        sharding_name: &str,
    ) -> Result<Vec<String>>;
}

/// Outcome of a long running action, polled on every reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Running,
    Succeed,
    Failed(String),
}

/// Everything needed to run one action of an ops definition against one component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomActionRequest {
    pub ops_request_name: String,
    pub component: SynthesizedComponent,
    pub action: OpsAction,
    pub parameters: Vec<CustomParameter>,
}

#[async_trait]
pub trait LifecycleActionRunner: Send + Sync {
    /// Moves leadership away from the current leader, to `candidate` if given.
    async fn switchover(
        &self,
        component: &SynthesizedComponent,
        candidate: Option<&str>,
    ) -> Result<()>;

    async fn run_custom_action(&self, request: &CustomActionRequest) -> Result<ActionStatus>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed(String),
}

#[async_trait]
pub trait BackupRestore: Send + Sync {
    /// Restores the data of `instance` in place, from `backup_name` if given.
    async fn rebuild_in_place(
        &self,
        ops_request_name: &str,
        component: &SynthesizedComponent,
        instance: &Instance,
        backup_name: Option<&str>,
    ) -> Result<RestoreStatus>;
}

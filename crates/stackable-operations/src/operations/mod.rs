//! The operations engine.
//!
//! [`OpsManager`] drives every [`OpsRequest`] through its phases. Behaviour specific to an
//! operation type lives in an [`OpsHandler`], which is registered together with its static
//! [`OpsBehaviour`] in the [`OpsRegistry`] handed to the manager on construction.
//!
//! ```text
//! Pending -> Creating -> Running -> Succeed | Failed
//!               |           |
//!               +-----------+-> Cancelling -> Cancelled
//!
//! any non-terminal phase -> Aborted
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    client::Client,
    collaborators::{BackupRestore, ComponentSynthesizer, LifecycleActionRunner},
    crd::{
        cluster::{Cluster, ClusterPhase},
        ops_definition::OpsDefinition,
        ops_request::{OpsCondition, OpsPhase, OpsRequest, OpsType},
    },
};

pub mod component_ops;
pub mod conditions;
mod custom;
mod error;
mod expose;
mod horizontal_scaling;
mod manager;
pub mod progress;
pub mod queue;
mod rebuild_instance;
mod reconfigure;
mod restart;
mod start;
mod stop;
mod switchover;
mod util;
mod vertical_scaling;
mod volume_expansion;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, ErrorKind, Result};
pub use manager::OpsManager;

/// Requeue delay while an operation is making progress.
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(1);

/// Requeue delay while waiting for the cluster to enter an allowed phase.
pub const PRECONDITION_REQUEUE_AFTER: Duration = Duration::from_secs(1);

/// Requeue delay while waiting for a dependency to complete.
pub const DEPENDENCY_REQUEUE_AFTER: Duration = Duration::from_secs(3);

pub const SWITCHOVER_REQUEUE_AFTER: Duration = Duration::from_secs(1);

pub const EXPOSE_REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Volume expansions are aborted after this long unless the request sets its own timeout.
pub const VOLUME_EXPANSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The subsystems an operation interacts with.
#[derive(Clone)]
pub struct OpsContext {
    pub client: Client,
    pub synthesizer: Arc<dyn ComponentSynthesizer>,
    pub lifecycle: Arc<dyn LifecycleActionRunner>,
    pub backup: Arc<dyn BackupRestore>,
}

/// The objects a single pass over a request works on.
///
/// Every write replaces the written object with the version returned by the store, so that the
/// next write in the same pass carries the current resource version.
#[derive(Clone, Debug)]
pub struct OpsResource {
    pub ops: OpsRequest,
    pub cluster: Cluster,
    pub ops_definition: Option<OpsDefinition>,
}

impl OpsResource {
    pub fn namespace(&self) -> &str {
        self.ops.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn ops_name(&self) -> &str {
        self.ops.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn cluster_name(&self) -> &str {
        &self.ops.spec.cluster_name
    }
}

/// The type specific part of an operation.
///
/// All methods may run several times for the same request, e.g. after a failed status write.
/// They must produce the same result when they do.
#[async_trait]
pub trait OpsHandler: Send + Sync {
    /// Checks the request against the current cluster before it is admitted.
    async fn validate(&self, _ctx: &OpsContext, _res: &OpsResource) -> Result<()> {
        Ok(())
    }

    /// The condition recorded when the request moves to `Creating`.
    async fn action_started_condition(
        &self,
        ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition>;

    /// Snapshots everything the request is about to change into
    /// `status.lastConfiguration`. Called once, right before the request moves to `Creating`.
    async fn save_last_configuration(&self, ctx: &OpsContext, res: &mut OpsResource)
    -> Result<()>;

    /// Applies the changes of the request.
    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()>;

    /// Tracks the progress of the request and returns the phase it should move to, together with
    /// the delay before it should be looked at again.
    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)>;

    /// Reverts the changes of the request from `status.lastConfiguration`.
    async fn cancel(&self, _ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        error::fatal(format!(
            "cancelling a {} operation is not supported, it needs manual intervention",
            res.ops.ops_type()
        ))
    }
}

/// The static policy of an operation type.
#[derive(Clone)]
pub struct OpsBehaviour {
    /// The cluster phases a request may be admitted in. Empty means any phase.
    pub from_cluster_phases: Vec<ClusterPhase>,

    /// The phase the cluster moves to while the operation runs. Operation types sharing a
    /// resulting phase exclude each other.
    pub to_cluster_phase: Option<ClusterPhase>,

    /// Requests exclude every other cluster scoped request of the same cluster.
    pub queue_by_cluster: bool,

    /// Requests only exclude requests of the same type.
    pub queue_by_self: bool,

    pub is_cluster_creation: bool,

    /// Whether [`OpsHandler::cancel`] is able to revert the operation.
    pub cancelable: bool,

    /// Applies when the request does not set `timeoutSeconds`.
    pub default_timeout: Option<Duration>,

    pub handler: Arc<dyn OpsHandler>,
}

impl OpsBehaviour {
    fn new(handler: impl OpsHandler + 'static) -> Self {
        Self {
            from_cluster_phases: Vec::new(),
            to_cluster_phase: None,
            queue_by_cluster: false,
            queue_by_self: false,
            is_cluster_creation: false,
            cancelable: false,
            default_timeout: None,
            handler: Arc::new(handler),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queue_by_cluster || self.queue_by_self
    }
}

/// Maps every supported operation type to its behaviour. Built once and never changed.
#[derive(Clone, Default)]
pub struct OpsRegistry {
    behaviours: BTreeMap<OpsType, OpsBehaviour>,
}

impl OpsRegistry {
    pub fn register(mut self, ops_type: OpsType, behaviour: OpsBehaviour) -> Self {
        self.behaviours.insert(ops_type, behaviour);
        self
    }

    pub fn get(&self, ops_type: OpsType) -> Option<&OpsBehaviour> {
        self.behaviours.get(&ops_type)
    }

    pub fn to_cluster_phase(&self, ops_type: OpsType) -> Option<ClusterPhase> {
        self.get(ops_type)
            .and_then(|behaviour| behaviour.to_cluster_phase)
    }

    /// All operation types shipped with this crate.
    pub fn with_builtin_handlers() -> Self {
        let up_running = ClusterPhase::UP_RUNNING.to_vec();
        Self::default()
            .register(OpsType::HorizontalScaling, OpsBehaviour {
                from_cluster_phases: up_running.clone(),
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                cancelable: true,
                ..OpsBehaviour::new(horizontal_scaling::HorizontalScalingHandler)
            })
            .register(OpsType::VerticalScaling, OpsBehaviour {
                from_cluster_phases: up_running.clone(),
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                cancelable: true,
                ..OpsBehaviour::new(vertical_scaling::VerticalScalingHandler)
            })
            .register(OpsType::VolumeExpansion, OpsBehaviour {
                queue_by_self: true,
                default_timeout: Some(VOLUME_EXPANSION_TIMEOUT),
                ..OpsBehaviour::new(volume_expansion::VolumeExpansionHandler)
            })
            .register(OpsType::Restart, OpsBehaviour {
                from_cluster_phases: up_running.clone(),
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                ..OpsBehaviour::new(restart::RestartHandler)
            })
            .register(OpsType::Stop, OpsBehaviour {
                from_cluster_phases: up_running.clone(),
                to_cluster_phase: Some(ClusterPhase::Stopping),
                queue_by_cluster: true,
                ..OpsBehaviour::new(stop::StopHandler)
            })
            .register(OpsType::Start, OpsBehaviour {
                from_cluster_phases: vec![
                    ClusterPhase::Stopped,
                    ClusterPhase::Failed,
                    ClusterPhase::Abnormal,
                ],
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                ..OpsBehaviour::new(start::StartHandler)
            })
            .register(OpsType::Switchover, OpsBehaviour {
                from_cluster_phases: up_running.clone(),
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                ..OpsBehaviour::new(switchover::SwitchoverHandler)
            })
            .register(OpsType::Expose, OpsBehaviour {
                queue_by_self: true,
                ..OpsBehaviour::new(expose::ExposeHandler)
            })
            .register(OpsType::Reconfigure, OpsBehaviour {
                from_cluster_phases: up_running,
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                ..OpsBehaviour::new(reconfigure::ReconfigureHandler)
            })
            .register(OpsType::RebuildInstance, OpsBehaviour {
                from_cluster_phases: vec![
                    ClusterPhase::Abnormal,
                    ClusterPhase::Failed,
                    ClusterPhase::Updating,
                ],
                to_cluster_phase: Some(ClusterPhase::Updating),
                queue_by_cluster: true,
                ..OpsBehaviour::new(rebuild_instance::RebuildInstanceHandler)
            })
            .register(
                OpsType::Custom,
                OpsBehaviour::new(custom::CustomOpsHandler),
            )
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator as _;

    use super::*;

    #[test]
    fn every_type_has_a_builtin_handler() {
        let registry = OpsRegistry::with_builtin_handlers();
        for ops_type in OpsType::iter() {
            assert!(registry.get(ops_type).is_some(), "{ops_type} is not registered");
        }
    }

    #[test]
    fn scaling_and_restart_share_a_resulting_phase() {
        let registry = OpsRegistry::with_builtin_handlers();
        assert_eq!(
            registry.to_cluster_phase(OpsType::HorizontalScaling),
            registry.to_cluster_phase(OpsType::Restart)
        );
        assert_eq!(registry.to_cluster_phase(OpsType::Expose), None);
    }
}

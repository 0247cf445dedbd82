use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use tracing::{debug, info, warn};

use crate::{
    constants::{OPS_REQUEST_FINALIZER, QUEUE_END_TIME_ANNOTATION},
    crd::{
        cluster::Cluster,
        now,
        ops_definition::OpsDefinition,
        ops_request::{Operation, OpsCondition, OpsConditionType, OpsPhase, OpsRequest},
    },
    operations::{
        DEFAULT_REQUEUE_AFTER, DEPENDENCY_REQUEUE_AFTER, ErrorKind, OpsBehaviour, OpsContext,
        OpsRegistry, OpsResource, PRECONDITION_REQUEUE_AFTER,
        conditions::{self, REASON_TIMED_OUT},
        error::Result,
        queue::{dequeue_ops_request, enqueue_ops_request},
        util::update_ha_config,
    },
};

/// Drives [`OpsRequest`]s through their phases.
///
/// Every call works on freshly read objects and only relies on state persisted in the request
/// status and the queue annotation of the cluster.
#[derive(Clone)]
pub struct OpsManager {
    registry: OpsRegistry,
}

/// The outcome of trying to admit a pending request.
enum Admission {
    Admitted,
    Waiting(Option<Duration>),
    Completed,
}

impl OpsManager {
    pub fn new(registry: OpsRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &OpsRegistry {
        &self.registry
    }

    /// Handles one trigger of `ops`. Returns the delay after which the request wants to be looked
    /// at again, if any.
    pub async fn reconcile_ops_request(
        &self,
        ctx: &OpsContext,
        ops: OpsRequest,
    ) -> Result<Option<Duration>> {
        if ops.metadata.deletion_timestamp.is_some() {
            self.handle_deletion(ctx, ops).await?;
            return Ok(None);
        }
        if ops.phase().is_terminal() {
            return handle_ttl(ctx, &ops).await;
        }
        let mut ops = ensure_finalizer(ctx, ops).await?;

        let namespace = ops.metadata.namespace.clone().unwrap_or_default();
        let Some(cluster) = ctx
            .client
            .get_opt::<Cluster>(&ops.spec.cluster_name, &namespace)
            .await?
        else {
            let message = format!("spec.clusterName {} is not found", ops.spec.cluster_name);
            patch_ops_phase(ctx, &mut ops, OpsPhase::Failed, vec![
                conditions::validate_failed(conditions::REASON_CLUSTER_NOT_FOUND, message),
            ])
            .await?;
            return Ok(None);
        };

        let ops_definition = match &ops.spec.operation {
            Operation::Custom { custom } => {
                ctx.client
                    .get_opt::<OpsDefinition>(&custom.ops_definition_name, &namespace)
                    .await?
            }
            _ => None,
        };

        let mut res = OpsResource {
            ops,
            cluster,
            ops_definition,
        };

        let Some(behaviour) = self.registry.get(res.ops.ops_type()) else {
            let message = format!("ops type {} is not supported", res.ops.ops_type());
            patch_ops_phase(ctx, &mut res.ops, OpsPhase::Failed, vec![
                conditions::validate_failed(conditions::REASON_OPS_TYPE_NOT_SUPPORTED, message),
            ])
            .await?;
            return Ok(None);
        };

        if res.ops.spec.cancel
            && matches!(res.ops.phase(), OpsPhase::Creating | OpsPhase::Running)
        {
            self.handle_cancel(ctx, &mut res, behaviour).await?;
        }

        match res.ops.phase() {
            OpsPhase::Pending | OpsPhase::Creating => self.do_ops(ctx, &mut res, behaviour).await,
            OpsPhase::Running | OpsPhase::Cancelling => {
                self.reconcile(ctx, &mut res, behaviour).await
            }
            OpsPhase::Succeed | OpsPhase::Failed | OpsPhase::Cancelled | OpsPhase::Aborted => {
                Ok(None)
            }
        }
    }

    /// Admits a pending request and applies its changes.
    pub async fn do_ops(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
        behaviour: &OpsBehaviour,
    ) -> Result<Option<Duration>> {
        if res.ops.phase() == OpsPhase::Pending {
            if res.ops.spec.cancel {
                let condition = conditions::cancelled(&res.ops);
                self.patch_ops_status(ctx, res, OpsPhase::Cancelled, vec![condition])
                    .await?;
                return Ok(None);
            }
            match self.admit(ctx, res, behaviour).await? {
                Admission::Admitted => {}
                Admission::Waiting(requeue_after) => return Ok(requeue_after),
                Admission::Completed => return Ok(None),
            }
        }

        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            ops_type = %res.ops.ops_type(),
            "applying OpsRequest"
        );
        if let Err(error) = behaviour.handler.action(ctx, res).await {
            return match error.kind() {
                ErrorKind::Fatal => {
                    let condition = conditions::failed(error.report());
                    self.patch_ops_status(ctx, res, OpsPhase::Failed, vec![condition])
                        .await?;
                    Ok(None)
                }
                ErrorKind::NeedWaiting => {
                    debug!(
                        ops_request = res.ops_name(),
                        reason = %error,
                        "OpsRequest action has to wait"
                    );
                    Ok(Some(error.requeue_after().unwrap_or(DEFAULT_REQUEUE_AFTER)))
                }
                ErrorKind::Transient => Err(error),
            };
        }

        res.ops.status_mut().cluster_generation = res.cluster.metadata.generation;
        self.patch_ops_status(ctx, res, OpsPhase::Running, Vec::new())
            .await?;
        Ok(Some(DEFAULT_REQUEUE_AFTER))
    }

    /// Tracks a running request until it completes, times out or is cancelled.
    pub async fn reconcile(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
        behaviour: &OpsBehaviour,
    ) -> Result<Option<Duration>> {
        let (phase, requeue_after) = match behaviour.handler.reconcile_action(ctx, res).await {
            Ok(result) => result,
            Err(error) => {
                return match error.kind() {
                    ErrorKind::Fatal => {
                        let condition = conditions::failed(error.report());
                        self.patch_ops_status(ctx, res, OpsPhase::Failed, vec![condition])
                            .await?;
                        update_ha_config(ctx, &res.ops, "true").await?;
                        Ok(None)
                    }
                    ErrorKind::NeedWaiting => {
                        Ok(Some(error.requeue_after().unwrap_or(DEFAULT_REQUEUE_AFTER)))
                    }
                    ErrorKind::Transient => Err(error),
                };
            }
        };

        match phase {
            OpsPhase::Succeed | OpsPhase::Failed => {
                let (phase, condition) = if res.ops.phase() == OpsPhase::Cancelling {
                    (OpsPhase::Cancelled, conditions::cancelled(&res.ops))
                } else if phase == OpsPhase::Succeed {
                    (OpsPhase::Succeed, conditions::succeed(&res.ops))
                } else {
                    (
                        OpsPhase::Failed,
                        conditions::failed(format!(
                            "Failed to process the OpsRequest: {}, not all objects reached \
                             their expected state",
                            res.ops_name()
                        )),
                    )
                };
                self.patch_ops_status(ctx, res, phase, vec![condition]).await?;
                update_ha_config(ctx, &res.ops, "true").await?;
                handle_ttl(ctx, &res.ops).await
            }
            _ => {
                let timeout = res
                    .ops
                    .spec
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .or(behaviour.default_timeout);
                if let (Some(timeout), Some(started)) = (timeout, res.ops.start_timestamp()) {
                    if elapsed_since(started) >= signed(timeout) {
                        let condition = conditions::aborted(
                            REASON_TIMED_OUT,
                            format!(
                                "OpsRequest {} timed out after {}s",
                                res.ops_name(),
                                timeout.as_secs()
                            ),
                        );
                        self.patch_ops_status(ctx, res, OpsPhase::Aborted, vec![condition])
                            .await?;
                        update_ha_config(ctx, &res.ops, "true").await?;
                        return Ok(None);
                    }
                }
                Ok(Some(requeue_after))
            }
        }
    }

    /// Moves the request to `phase`, recording `conditions`. Leaving the queue is part of
    /// every move into a terminal phase.
    ///
    /// Moves that are not allowed from the current phase are skipped.
    pub async fn patch_ops_status(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
        phase: OpsPhase,
        conditions: Vec<OpsCondition>,
    ) -> Result<()> {
        let current = res.ops.phase();
        if !current.can_transition_to(phase) {
            warn!(
                ops_request = res.ops_name(),
                from = %current,
                to = %phase,
                "refusing to change the OpsRequest phase"
            );
            return Ok(());
        }
        if phase.is_terminal() {
            dequeue_ops_request(ctx, &self.registry, res).await?;
        }
        patch_ops_phase(ctx, &mut res.ops, phase, conditions).await
    }

    async fn admit(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
        behaviour: &OpsBehaviour,
    ) -> Result<Admission> {
        if let Err(error) = behaviour.handler.validate(ctx, res).await {
            return match error.kind() {
                ErrorKind::Fatal => {
                    let condition =
                        conditions::validate_failed(conditions::REASON_VALIDATE_FAILED, error.report());
                    self.patch_ops_status(ctx, res, OpsPhase::Failed, vec![condition])
                        .await?;
                    Ok(Admission::Completed)
                }
                ErrorKind::NeedWaiting => Ok(Admission::Waiting(error.requeue_after())),
                ErrorKind::Transient => Err(error),
            };
        }

        if behaviour.is_queued()
            && enqueue_ops_request(ctx, &self.registry, res, behaviour.queue_by_self).await?
        {
            let message = format!(
                "OpsRequest {} is waiting in the queue of cluster {}",
                res.ops_name(),
                res.cluster_name()
            );
            record_condition(
                ctx,
                &mut res.ops,
                conditions::wait_for_progressing(conditions::REASON_WAIT_FOR_QUEUE, message),
            )
            .await?;
            return Ok(Admission::Waiting(None));
        }

        if let Some(admission) = self.check_dependency(ctx, res).await? {
            return Ok(admission);
        }

        let cluster_phase = res.cluster.phase();
        let phase_allowed = res.ops.spec.force
            || behaviour.is_cluster_creation
            || behaviour.from_cluster_phases.is_empty()
            || cluster_phase.is_some_and(|phase| behaviour.from_cluster_phases.contains(&phase));
        if !phase_allowed {
            let cluster_phase = cluster_phase.map(|phase| phase.to_string()).unwrap_or_default();
            if !precondition_deadline_expired(&res.ops) {
                let message = format!(
                    "waiting for Cluster.status.phase to leave {cluster_phase} before running \
                     OpsRequest.spec.type={}",
                    res.ops.ops_type()
                );
                record_condition(
                    ctx,
                    &mut res.ops,
                    conditions::wait_for_progressing(
                        conditions::REASON_WAIT_FOR_CLUSTER_PHASE,
                        message,
                    ),
                )
                .await?;
                return Ok(Admission::Waiting(Some(PRECONDITION_REQUEUE_AFTER)));
            }
            let message = format!(
                "OpsRequest.spec.type={} is forbidden when Cluster.status.phase={cluster_phase}",
                res.ops.ops_type()
            );
            let condition =
                conditions::validate_failed(conditions::REASON_OPS_REQUEST_FORBIDDEN, message);
            self.patch_ops_status(ctx, res, OpsPhase::Failed, vec![condition])
                .await?;
            return Ok(Admission::Completed);
        }

        update_ha_config(ctx, &res.ops, "false").await?;
        let handler = &behaviour.handler;
        let started = match handler.save_last_configuration(ctx, res).await {
            Ok(()) => handler.action_started_condition(ctx, res).await,
            Err(error) => Err(error),
        };
        let started = match started {
            Ok(started) => started,
            Err(error) if error.kind() == ErrorKind::Fatal => {
                let condition = conditions::failed(error.report());
                self.patch_ops_status(ctx, res, OpsPhase::Failed, vec![condition])
                    .await?;
                return Ok(Admission::Completed);
            }
            Err(error) => return Err(error),
        };

        let validated = conditions::validate_passed(&res.ops);
        self.patch_ops_status(ctx, res, OpsPhase::Creating, vec![validated, started])
            .await?;
        Ok(Admission::Admitted)
    }

    /// Returns an admission result if the dependency of the request keeps it from being admitted.
    async fn check_dependency(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<Option<Admission>> {
        let Some(depends_on) = res.ops.spec.depends_on.clone() else {
            return Ok(None);
        };
        let dependency = ctx
            .client
            .get_opt::<OpsRequest>(&depends_on, res.namespace())
            .await?;
        match dependency.as_ref().map(OpsRequest::phase) {
            Some(OpsPhase::Succeed) => Ok(None),
            None | Some(OpsPhase::Failed | OpsPhase::Cancelled | OpsPhase::Aborted) => {
                let phase = dependency
                    .as_ref()
                    .map_or_else(|| "not found".to_owned(), |ops| ops.phase().to_string());
                let condition = conditions::dependency_unsuccessful(format!(
                    "OpsRequest {} is cancelled because the OpsRequest it depends on, \
                     {depends_on}, is {phase}",
                    res.ops_name()
                ));
                self.patch_ops_status(ctx, res, OpsPhase::Cancelled, vec![condition])
                    .await?;
                Ok(Some(Admission::Completed))
            }
            Some(phase) => {
                let message = format!(
                    "waiting for the OpsRequest {depends_on} to succeed, it is currently {phase}"
                );
                record_condition(
                    ctx,
                    &mut res.ops,
                    conditions::wait_for_progressing(
                        conditions::REASON_WAIT_FOR_DEPENDENCY,
                        message,
                    ),
                )
                .await?;
                Ok(Some(Admission::Waiting(Some(DEPENDENCY_REQUEUE_AFTER))))
            }
        }
    }

    async fn handle_cancel(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
        behaviour: &OpsBehaviour,
    ) -> Result<()> {
        let already_rejected = res
            .ops
            .status
            .as_ref()
            .and_then(|status| status.condition(OpsConditionType::Cancelling))
            .is_some_and(|condition| {
                condition.reason.as_deref() == Some(conditions::REASON_CANCEL_REJECTED)
            });
        if already_rejected {
            return Ok(());
        }

        let rejected = if behaviour.cancelable {
            match behaviour.handler.cancel(ctx, res).await {
                Ok(()) => None,
                Err(error) if error.kind() == ErrorKind::Fatal => Some(error.report()),
                Err(error) => return Err(error),
            }
        } else {
            Some(format!(
                "cancelling a {} operation is not supported, it needs manual intervention",
                res.ops.ops_type()
            ))
        };

        if let Some(message) = rejected {
            warn!(
                ops_request = res.ops_name(),
                reason = %message,
                "rejected cancelling the OpsRequest"
            );
            return record_condition(ctx, &mut res.ops, conditions::cancel_rejected(message))
                .await;
        }

        let status = res.ops.status_mut();
        for component in status.components.values_mut() {
            component.progress_details.clear();
        }
        status.cancel_timestamp = Some(now());
        let condition = conditions::cancelling(&res.ops);
        self.patch_ops_status(ctx, res, OpsPhase::Cancelling, vec![condition])
            .await
    }

    async fn handle_deletion(&self, ctx: &OpsContext, mut ops: OpsRequest) -> Result<()> {
        let has_finalizer = ops
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == OPS_REQUEST_FINALIZER));
        if !has_finalizer {
            return Ok(());
        }

        let namespace = ops.metadata.namespace.clone().unwrap_or_default();
        if let Some(cluster) = ctx
            .client
            .get_opt::<Cluster>(&ops.spec.cluster_name, &namespace)
            .await?
        {
            let mut res = OpsResource {
                ops,
                cluster,
                ops_definition: None,
            };
            dequeue_ops_request(ctx, &self.registry, &mut res).await?;
            ops = res.ops;
        }

        if let Some(finalizers) = ops.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != OPS_REQUEST_FINALIZER);
        }
        ctx.client.update(&ops).await?;
        info!(
            ops_request = ops.metadata.name.as_deref().unwrap_or_default(),
            "released deleted OpsRequest"
        );
        Ok(())
    }
}

/// Moves `ops` to `phase` without touching the queue.
async fn patch_ops_phase(
    ctx: &OpsContext,
    ops: &mut OpsRequest,
    phase: OpsPhase,
    conditions: Vec<OpsCondition>,
) -> Result<()> {
    let previous = ops.phase();
    if !previous.can_transition_to(phase) {
        return Ok(());
    }
    let status = ops.status_mut();
    for condition in conditions {
        status.set_condition(condition);
    }
    status.phase = phase;
    if phase == OpsPhase::Creating && status.start_timestamp.is_none() {
        status.start_timestamp = Some(now());
    }
    if phase.is_terminal() {
        status.completion_timestamp = Some(now());
    }
    *ops = ctx.client.update_status(&*ops).await?;

    if previous != phase {
        info!(
            ops_request = ops.metadata.name.as_deref().unwrap_or_default(),
            cluster = %ops.spec.cluster_name,
            from = %previous,
            to = %phase,
            "OpsRequest phase changed"
        );
    }
    Ok(())
}

/// Sets `condition` unless an identical one is already recorded.
async fn record_condition(
    ctx: &OpsContext,
    ops: &mut OpsRequest,
    condition: OpsCondition,
) -> Result<()> {
    let unchanged = ops
        .status
        .as_ref()
        .and_then(|status| status.condition(condition.type_))
        .is_some_and(|existing| {
            existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
        });
    if unchanged {
        return Ok(());
    }
    ops.status_mut().set_condition(condition);
    *ops = ctx.client.update_status(&*ops).await?;
    Ok(())
}

async fn ensure_finalizer(ctx: &OpsContext, mut ops: OpsRequest) -> Result<OpsRequest> {
    let finalizers = ops.metadata.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|finalizer| finalizer == OPS_REQUEST_FINALIZER) {
        return Ok(ops);
    }
    finalizers.push(OPS_REQUEST_FINALIZER.to_owned());
    Ok(ctx.client.update(&ops).await?)
}

/// Deletes a completed request once its time to live expired. Returns the remaining time to
/// live otherwise.
async fn handle_ttl(ctx: &OpsContext, ops: &OpsRequest) -> Result<Option<Duration>> {
    let ttl_seconds = if ops.phase() == OpsPhase::Succeed {
        ops.spec.ttl_seconds_after_succeed
    } else {
        ops.spec.ttl_seconds_after_unsuccessful_completion
    };
    let (Some(ttl_seconds), Some(completed)) = (ttl_seconds, ops.completion_timestamp()) else {
        return Ok(None);
    };

    let ttl = signed(Duration::from_secs(ttl_seconds));
    let elapsed = elapsed_since(completed);
    if elapsed < ttl {
        return Ok(Some((ttl - elapsed).unsigned_abs()));
    }
    ctx.client.delete(ops).await?;
    info!(
        ops_request = ops.metadata.name.as_deref().unwrap_or_default(),
        "deleted OpsRequest after its time to live expired"
    );
    Ok(None)
}

/// Whether the request waited long enough for the cluster to enter an allowed phase. Measured
/// from the time the request left the queue, or from its creation.
fn precondition_deadline_expired(ops: &OpsRequest) -> bool {
    let Some(deadline_seconds) = ops.spec.pre_condition_deadline_seconds else {
        return true;
    };
    let queue_end_time = ops
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(QUEUE_END_TIME_ANNOTATION))
        .and_then(|value| value.parse::<Timestamp>().ok());
    let Some(base) = queue_end_time.or_else(|| {
        ops.metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0)
    }) else {
        return true;
    };
    elapsed_since(base) >= signed(Duration::from_secs(deadline_seconds))
}

fn elapsed_since(timestamp: Timestamp) -> SignedDuration {
    Timestamp::now().duration_since(timestamp)
}

fn signed(duration: Duration) -> SignedDuration {
    SignedDuration::try_from(duration).unwrap_or(SignedDuration::MAX)
}

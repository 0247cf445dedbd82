//! Rolling restart of components, stage by stage along `Cluster.spec.updateOrder`.
//!
//! A component is restarted by stamping [`RESTART_ANNOTATION`] on its spec, the workload layer
//! recreates its pods. The next stage is only stamped once every pod of the previous stage came
//! back.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::{
    constants::RESTART_ANNOTATION,
    crd::{
        cluster::{Cluster, ClusterComponentSpec},
        ops_request::{
            ComponentOps, LastComponentConfiguration, Operation, OpsCondition, OpsPhase,
            OpsRequest, OpsType,
        },
    },
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{
            ComponentOpsSet, collect_component_progress, finish_component_progress,
            validate_component_names,
        },
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::handle_restart_progress,
        util::{abort_earlier_ops_with_same_kind, overlapping_components},
    },
};

pub struct RestartHandler;

fn payloads(ops: &OpsRequest) -> Result<&[ComponentOps]> {
    match &ops.spec.operation {
        Operation::Restart { restart } => Ok(restart),
        other => unexpected_operation(other.ops_type(), OpsType::Restart),
    }
}

/// Groups the targeted components into the stages they are restarted in.
///
/// Each entry of `updateOrder` is a comma separated list of components restarted together.
/// Targets the order does not mention form a final stage.
pub(crate) fn restart_stages(cluster: &Cluster, targets: &[String]) -> Vec<Vec<String>> {
    let mut stages = Vec::new();
    let mut staged = Vec::new();
    for entry in &cluster.spec.update_order {
        let stage = entry
            .split(',')
            .map(str::trim)
            .filter(|name| targets.iter().any(|target| target == name))
            .filter(|name| !staged.iter().any(|staged: &String| staged == *name))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if !stage.is_empty() {
            staged.extend(stage.iter().cloned());
            stages.push(stage);
        }
    }
    let rest = targets
        .iter()
        .filter(|target| !staged.contains(target))
        .cloned()
        .collect::<Vec<_>>();
    if !rest.is_empty() {
        stages.push(rest);
    }
    stages
}

/// The value stamped on restarted components, unique per request.
fn restart_value(ops: &OpsRequest) -> Result<String> {
    match ops.start_timestamp() {
        Some(started) => Ok(started.to_string()),
        None => fatal(format!(
            "OpsRequest {:?} has no start timestamp",
            ops.metadata.name.as_deref().unwrap_or_default()
        )),
    }
}

fn is_restarted(spec: &ClusterComponentSpec, value: &str) -> bool {
    spec.annotations.get(RESTART_ANNOTATION).map(String::as_str) == Some(value)
}

/// Stamps the restart annotation on the given components. Returns whether anything changed.
fn stamp_restart(cluster: &mut Cluster, component_names: &[String], value: &str) -> Result<bool> {
    let stage = component_names
        .iter()
        .map(|name| ComponentOps {
            component_name: name.clone(),
        })
        .collect::<Vec<_>>();
    let mut changed = false;
    ComponentOpsSet::new(&stage).update_components_and_shardings(cluster, |spec, _| {
        if !is_restarted(spec, value) {
            spec.annotations
                .insert(RESTART_ANNOTATION.to_owned(), value.to_owned());
            changed = true;
        }
        Ok(())
    })?;
    Ok(changed)
}

#[async_trait]
impl OpsHandler for RestartHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        validate_component_names(
            &res.cluster,
            payloads(&res.ops)?
                .iter()
                .map(|restart| restart.component_name.as_str()),
        )
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        Ok(conditions::progressing(
            "RestartStarted",
            format!("Start to restart components in Cluster: {}", res.cluster_name()),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        set.save_last_configurations(&mut res.ops, &res.cluster, |spec, _| {
            LastComponentConfiguration {
                replicas: spec.replicas,
                instances: spec.instances.clone(),
                offline_instances: spec.offline_instances.clone(),
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        let targets = set.component_names().map(str::to_owned).collect::<Vec<_>>();
        abort_earlier_ops_with_same_kind(ctx, res, &[OpsType::Restart], |earlier| {
            let earlier_targets = payloads(earlier)?
                .iter()
                .map(|restart| restart.component_name.clone())
                .collect::<Vec<_>>();
            Ok(overlapping_components(&targets, &earlier_targets))
        })
        .await?;

        let value = restart_value(&res.ops)?;
        let stages = restart_stages(&res.cluster, &targets);
        let Some(first) = stages.first() else {
            return Ok(());
        };
        if stamp_restart(&mut res.cluster, first, &value)? {
            res.cluster = ctx.client.update(&res.cluster).await?;
            info!(
                ops_request = res.ops_name(),
                components = ?first,
                "restarting first stage"
            );
        }
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        let targets = set.component_names().map(str::to_owned).collect::<Vec<_>>();
        let mut resources = set.build_progress_resources(ctx, res).await?;
        let tally = collect_component_progress(res, &mut resources, |res, resource, status| {
            handle_restart_progress(res, resource, status)
        })?;

        let value = restart_value(&res.ops)?;
        for stage in restart_stages(&res.cluster, &targets) {
            let stamped = stage.iter().all(|name| {
                res.cluster
                    .component_spec(name)
                    .is_some_and(|spec| is_restarted(spec, &value))
            });
            if !stamped {
                if stamp_restart(&mut res.cluster, &stage, &value)? {
                    res.cluster = ctx.client.update(&res.cluster).await?;
                    info!(
                        ops_request = res.ops_name(),
                        components = ?stage,
                        "previous stage restarted, restarting next stage"
                    );
                }
                break;
            }
            if stage.iter().any(|name| tally.incomplete.contains(name)) {
                break;
            }
        }

        finish_component_progress(ctx, res, tally).await
    }
}

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use tracing::info;

use crate::{
    crd::{
        cluster::Cluster,
        ops_request::{
            ComponentOps, LastComponentConfiguration, Operation, OpsCondition, OpsPhase,
            OpsRequest, OpsType,
        },
    },
    instance,
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{
            ComponentOpsSet, ProgressResource, reconcile_component_progress,
            validate_component_names,
        },
        conditions,
        error::{Result, unexpected_operation},
        progress::handle_scale_progress,
        util::{abort_earlier_ops_with_same_kind, overlapping_components},
    },
};

pub struct StopHandler;

/// The components a `Stop` or `Start` request of type `expected` targets. No components means
/// all components and shardings of the cluster.
pub(super) fn start_stop_targets(
    ops: &OpsRequest,
    cluster: &Cluster,
    expected: OpsType,
) -> Result<Vec<ComponentOps>> {
    let components = match (&ops.spec.operation, expected) {
        (Operation::Stop { stop }, OpsType::Stop) => stop,
        (Operation::Start { start }, OpsType::Start) => start,
        (other, _) => return unexpected_operation(other.ops_type(), expected),
    };
    if !components.is_empty() {
        return Ok(components.clone());
    }
    Ok(cluster
        .component_names()
        .into_iter()
        .map(|component_name| ComponentOps { component_name })
        .collect())
}

pub(super) fn validate_start_stop(res: &OpsResource, ops_type: OpsType) -> Result<()> {
    let targets = start_stop_targets(&res.ops, &res.cluster, ops_type)?;
    validate_component_names(
        &res.cluster,
        targets.iter().map(|target| target.component_name.as_str()),
    )
}

pub(super) fn save_start_stop_configuration(
    res: &mut OpsResource,
    ops_type: OpsType,
) -> Result<()> {
    let targets = start_stop_targets(&res.ops, &res.cluster, ops_type)?;
    let set = ComponentOpsSet::new(&targets);
    set.save_last_configurations(&mut res.ops, &res.cluster, |spec, _| {
        LastComponentConfiguration {
            replicas: spec.replicas,
            instances: spec.instances.clone(),
            offline_instances: spec.offline_instances.clone(),
            stop: spec.stop,
            ..LastComponentConfiguration::default()
        }
    });
    Ok(())
}

/// Aborts earlier `Start` and `Stop` requests touching one of the same components.
pub(super) async fn abort_earlier_start_stop(
    ctx: &OpsContext,
    res: &mut OpsResource,
    ops_type: OpsType,
) -> Result<()> {
    let cluster = res.cluster.clone();
    let targets = start_stop_targets(&res.ops, &cluster, ops_type)?
        .into_iter()
        .map(|target| target.component_name)
        .collect::<Vec<_>>();
    abort_earlier_ops_with_same_kind(ctx, res, &[OpsType::Start, OpsType::Stop], |earlier| {
        let earlier_targets = start_stop_targets(earlier, &cluster, earlier.ops_type())?
            .into_iter()
            .map(|target| target.component_name)
            .collect::<Vec<_>>();
        Ok(overlapping_components(&targets, &earlier_targets))
    })
    .await
}

/// All pods of a component as recorded in the snapshot of the request.
pub(super) fn snapshot_pods(
    res: &OpsResource,
    resource: &ProgressResource<ComponentOps>,
) -> Result<BTreeMap<String, String>> {
    let Some(last) = res
        .ops
        .last_component_configuration(&resource.component_name)
    else {
        return Ok(BTreeMap::new());
    };
    Ok(instance::generate_pod_name_set(
        res.cluster_name(),
        &resource.full_component_name,
        last.replicas,
        &last.instances,
        &last.offline_instances,
    )?)
}

#[async_trait]
impl OpsHandler for StopHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        validate_start_stop(res, OpsType::Stop)
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        Ok(conditions::progressing(
            "StopStarted",
            format!("Start to stop the Cluster: {}", res.cluster_name()),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        save_start_stop_configuration(res, OpsType::Stop)
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        abort_earlier_start_stop(ctx, res, OpsType::Stop).await?;
        let targets = start_stop_targets(&res.ops, &res.cluster, OpsType::Stop)?;
        let set = ComponentOpsSet::new(&targets);
        set.update_components_and_shardings(&mut res.cluster, |spec, _| {
            spec.stop = Some(true);
            Ok(())
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "stopping components"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let targets = start_stop_targets(&res.ops, &res.cluster, OpsType::Stop)?;
        let set = ComponentOpsSet::new(&targets);
        let mut resources = set.build_progress_resources(ctx, res).await?;
        reconcile_component_progress(ctx, res, &mut resources, |res, resource, status| {
            resource.deleted_pods = snapshot_pods(res, resource)?;
            Ok(handle_scale_progress(res, resource, status))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::crd::cluster::ClusterSpec;

    #[test]
    fn no_components_means_all_components() {
        let cluster: Cluster = serde_yaml::from_str(indoc! {"
            apiVersion: apps.stackable.tech/v1alpha1
            kind: Cluster
            metadata:
              name: mycluster
              namespace: default
            spec:
              componentSpecs:
                - name: mysql
                  replicas: 3
              shardings:
                - name: shard
                  shards: 2
                  template:
                    name: shard
                    replicas: 1
        "})
        .expect("valid cluster");
        let ops: OpsRequest = serde_yaml::from_str(indoc! {"
            apiVersion: operations.stackable.tech/v1alpha1
            kind: OpsRequest
            metadata:
              name: stop
              namespace: default
            spec:
              clusterName: mycluster
              type: Stop
        "})
        .expect("valid request");

        let targets = start_stop_targets(&ops, &cluster, OpsType::Stop).unwrap();
        assert_eq!(
            targets
                .iter()
                .map(|target| target.component_name.as_str())
                .collect::<Vec<_>>(),
            vec!["mysql", "shard"]
        );
    }

    #[test]
    fn mismatched_request_names_the_expected_type() {
        let ops: OpsRequest = serde_yaml::from_str(indoc! {"
            apiVersion: operations.stackable.tech/v1alpha1
            kind: OpsRequest
            metadata:
              name: stop
              namespace: default
            spec:
              clusterName: mycluster
              type: Stop
        "})
        .expect("valid request");

        let cluster = Cluster::new("mycluster", ClusterSpec::default());

        let error = start_stop_targets(&ops, &cluster, OpsType::Start).unwrap_err();
        assert_eq!(
            error.to_string(),
            "expected an operation of type Start, but got Stop"
        );
    }
}

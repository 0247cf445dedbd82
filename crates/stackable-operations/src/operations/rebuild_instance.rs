//! Rebuilds broken instances of a component.
//!
//! In place rebuilds hand the instance to the backup/restore subsystem and wait for the restored
//! pod to come up again. Horizontal rebuilds scale the component out by one pod per instance
//! first, and take the broken instances offline once all replacements are available.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::{
    collaborators::{self, RestoreStatus, SynthesizedComponent},
    crd::{
        cluster::{ClusterComponentSpec, ComponentPhase, InstanceTemplate},
        ops_request::{
            Instance, LastComponentConfiguration, Operation, OpsCondition, OpsPhase, OpsRequest,
            OpsType, ProgressDetail, ProgressStatus, RebuildInstance,
        },
    },
    instance,
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{
            ComponentOpsSet, ProgressTally, finish_component_progress, list_component_pods,
            validate_component_names,
        },
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::{
            find_pod, find_progress_detail, pod_failure, pod_is_up, pod_object_key,
            set_progress_detail,
        },
    },
};

pub struct RebuildInstanceHandler;

const WAITING_FOR_INSTANCE_READY: &str = "Waiting for the rebuilding instance to be ready";

fn payloads(ops: &OpsRequest) -> Result<&[RebuildInstance]> {
    match &ops.spec.operation {
        Operation::RebuildInstance { rebuild_from } => Ok(rebuild_from),
        other => unexpected_operation(other.ops_type(), OpsType::RebuildInstance),
    }
}

fn instance_names(rebuild: &RebuildInstance) -> impl Iterator<Item = &String> {
    rebuild.instances.iter().map(|instance| &instance.name)
}

/// Replicas and instance templates of the component while the replacements run next to the
/// instances they replace.
fn scaled_out_values(
    cluster_name: &str,
    last: &LastComponentConfiguration,
    rebuild: &RebuildInstance,
) -> (i32, Vec<InstanceTemplate>) {
    let counts =
        instance::count_by_template(cluster_name, &rebuild.component_name, instance_names(rebuild));
    let added = counts.values().sum::<i32>();
    let templates = last
        .instances
        .iter()
        .map(|template| InstanceTemplate {
            replicas: Some(
                template.replicas() + counts.get(&template.name).copied().unwrap_or_default(),
            ),
            ..template.clone()
        })
        .collect();
    (last.replicas + added, templates)
}

/// Maps every instance rebuilt horizontally to the pod replacing it.
fn replacement_pods(
    cluster_name: &str,
    last: &LastComponentConfiguration,
    rebuild: &RebuildInstance,
) -> Result<BTreeMap<String, String>> {
    let component_name = &rebuild.component_name;
    let before = instance::generate_pod_name_set(
        cluster_name,
        component_name,
        last.replicas,
        &last.instances,
        &last.offline_instances,
    )?;
    let (replicas, templates) = scaled_out_values(cluster_name, last, rebuild);
    let after = instance::generate_pod_name_set(
        cluster_name,
        component_name,
        replicas,
        &templates,
        &last.offline_instances,
    )?;

    let mut new_pods = BTreeMap::<&str, Vec<&String>>::new();
    for (pod_name, template_name) in &after {
        if !before.contains_key(pod_name) {
            new_pods
                .entry(template_name.as_str())
                .or_default()
                .push(pod_name);
        }
    }

    let mut replacements = BTreeMap::new();
    for name in instance_names(rebuild) {
        let template_name = instance::instance_template_name(cluster_name, component_name, name);
        let Some(replacement) = new_pods
            .get_mut(template_name.as_str())
            .filter(|pods| !pods.is_empty())
            .map(|pods| pods.remove(0))
        else {
            return fatal(format!(
                "no replacement pod could be derived for instance {name:?}"
            ));
        };
        replacements.insert(name.clone(), replacement.clone());
    }
    Ok(replacements)
}

fn is_scaled_out(spec: &ClusterComponentSpec, last: &LastComponentConfiguration) -> bool {
    spec.replicas != last.replicas
}

fn is_taken_offline(spec: &ClusterComponentSpec, rebuild: &RebuildInstance) -> bool {
    instance_names(rebuild).all(|name| spec.offline_instances.contains(name))
}

fn apply_scale_out(
    spec: &mut ClusterComponentSpec,
    cluster_name: &str,
    last: &LastComponentConfiguration,
    rebuild: &RebuildInstance,
) {
    let (replicas, templates) = scaled_out_values(cluster_name, last, rebuild);
    spec.replicas = replicas;
    spec.instances = templates;
}

fn apply_take_offline(
    spec: &mut ClusterComponentSpec,
    last: &LastComponentConfiguration,
    rebuild: &RebuildInstance,
) {
    spec.replicas = last.replicas;
    spec.instances.clone_from(&last.instances);
    for name in instance_names(rebuild) {
        if !spec.offline_instances.contains(name) {
            spec.offline_instances.push(name.clone());
        }
    }
}

/// Fails if a targeted instance is still serving, unless the request is forced.
fn ensure_rebuildable(
    res: &OpsResource,
    rebuild: &RebuildInstance,
    component: &SynthesizedComponent,
    pods: &[Pod],
) -> Result<()> {
    if res.ops.spec.force {
        return Ok(());
    }
    let name = &rebuild.component_name;
    if let Some(phase) = res.cluster.component_phase(name) {
        if !matches!(
            phase,
            ComponentPhase::Failed | ComponentPhase::Abnormal | ComponentPhase::Updating
        ) {
            return fatal(format!("the phase of component {name:?} can not be {phase}"));
        }
    }
    for instance in &rebuild.instances {
        if find_pod(pods, &instance.name).is_some_and(|pod| pod_is_up(&res.ops, component, pod)) {
            return fatal(format!(
                "instance {:?} is available, can not rebuild it",
                instance.name
            ));
        }
    }
    Ok(())
}

async fn rebuild_in_place(
    ctx: &OpsContext,
    res: &OpsResource,
    rebuild: &RebuildInstance,
    instance: &Instance,
    component: &SynthesizedComponent,
    pods: &[Pod],
) -> Result<ProgressDetail> {
    let object_key = pod_object_key(&instance.name);
    let status = match ctx
        .backup
        .rebuild_in_place(
            res.ops_name(),
            component,
            instance,
            rebuild.backup_name.as_deref(),
        )
        .await
    {
        Ok(status) => status,
        Err(
            error @ (collaborators::Error::NotFound { .. }
            | collaborators::Error::ActionFailed { .. }),
        ) => RestoreStatus::Failed(error.to_string()),
        Err(error) => return Err(error.into()),
    };

    Ok(match status {
        RestoreStatus::InProgress => ProgressDetail::new(
            object_key,
            ProgressStatus::Processing,
            format!("Start to rebuild pod {}", instance.name),
        ),
        RestoreStatus::Failed(message) => ProgressDetail::new(
            object_key,
            ProgressStatus::Failed,
            format!("Failed to rebuild pod {}: {message}", instance.name),
        ),
        RestoreStatus::Completed => match find_pod(pods, &instance.name) {
            Some(pod) if pod_is_up(&res.ops, component, pod) => ProgressDetail::new(
                object_key,
                ProgressStatus::Succeed,
                format!("Rebuild pod {} successfully", instance.name),
            ),
            _ => ProgressDetail::new(
                object_key,
                ProgressStatus::Processing,
                WAITING_FOR_INSTANCE_READY,
            ),
        },
    })
}

/// The progress of replacing `old` by `new`.
fn replacement_detail(
    res: &OpsResource,
    component: &SynthesizedComponent,
    pods: &[Pod],
    old: &str,
    new: &str,
    taken_offline: bool,
) -> ProgressDetail {
    let object_key = pod_object_key(old);
    match find_pod(pods, new) {
        None => ProgressDetail::new(
            object_key,
            ProgressStatus::Processing,
            format!("Waiting for the replacement pod {new} to be created"),
        ),
        Some(pod) if pod_is_up(&res.ops, component, pod) => {
            if taken_offline && find_pod(pods, old).is_none() {
                ProgressDetail::new(
                    object_key,
                    ProgressStatus::Succeed,
                    format!("Rebuild pod {old} successfully, replaced by {new}"),
                )
            } else {
                ProgressDetail::new(
                    object_key,
                    ProgressStatus::Processing,
                    format!("Waiting for pod {old} to be taken offline"),
                )
            }
        }
        Some(pod) => match pod_failure(&res.cluster, &component.name, pod) {
            Some(failure) => ProgressDetail::new(
                object_key,
                ProgressStatus::Failed,
                format!("Failed to rebuild pod {old}, replacement {new} failed: {failure}"),
            ),
            None => ProgressDetail::new(
                object_key,
                ProgressStatus::Processing,
                format!("Waiting for the replacement pod {new} to be ready"),
            ),
        },
    }
}

#[async_trait]
impl OpsHandler for RebuildInstanceHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|rebuild| rebuild.component_name.as_str()),
        )?;

        for rebuild in payloads {
            let name = &rebuild.component_name;
            if res.cluster.sharding(name).is_some() {
                return fatal(format!(
                    "rebuilding instances of sharding {name:?} is not supported"
                ));
            }
            let Some(spec) = res.cluster.component_spec(name) else {
                continue;
            };
            if rebuild.instances.is_empty() {
                return fatal(format!("no instances given for component {name:?}"));
            }
            if !rebuild.in_place && rebuild.backup_name.is_some() {
                return fatal(format!(
                    "a backup can only be used to rebuild the instances of component {name:?} \
                     in place"
                ));
            }

            let pod_names = instance::generate_pod_names(
                res.cluster_name(),
                name,
                spec.replicas,
                &spec.instances,
                &spec.offline_instances,
            )?;
            let mut seen = BTreeSet::new();
            for instance_name in instance_names(rebuild) {
                if !seen.insert(instance_name) {
                    return fatal(format!("instance {instance_name:?} is given twice"));
                }
                if !pod_names.contains(instance_name) {
                    return fatal(format!(
                        "instance {instance_name:?} not found in component {name:?}"
                    ));
                }
            }
        }
        Ok(())
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        Ok(conditions::progressing(
            "RebuildInstanceStarted",
            format!("Start to rebuild the instances in Cluster: {}", res.cluster_name()),
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
        let payloads = payloads(&res.ops)?.to_vec();
        let mut scale_out = Vec::new();
        for rebuild in &payloads {
            let name = &rebuild.component_name;
            if !rebuild.in_place {
                let (Some(spec), Some(last)) = (
                    res.cluster.component_spec(name),
                    res.ops.last_component_configuration(name),
                ) else {
                    return fatal(format!(
                        "no last configuration recorded for component {name:?}"
                    ));
                };
                if is_scaled_out(spec, last) || is_taken_offline(spec, rebuild) {
                    continue;
                }
            }

            let component = ctx.synthesizer.synthesize(&res.cluster, name).await?;
            let pods = list_component_pods(ctx, res, name).await?;
            ensure_rebuildable(res, rebuild, &component, &pods)?;
            if !rebuild.in_place {
                scale_out.push(rebuild.clone());
            }
        }
        if scale_out.is_empty() {
            return Ok(());
        }

        let cluster_name = res.cluster_name().to_owned();
        let set = ComponentOpsSet::new(&scale_out);
        let ops = &res.ops;
        set.update_components_and_shardings(&mut res.cluster, |spec, rebuild| {
            let Some(last) = ops.last_component_configuration(&spec.name) else {
                return fatal(format!(
                    "no last configuration recorded for component {:?}",
                    spec.name
                ));
            };
            apply_scale_out(spec, &cluster_name, last, rebuild);
            Ok(())
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "scaled out replacements for rebuilt instances"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let payloads = payloads(&res.ops)?.to_vec();
        let mut tally = ProgressTally::default();
        let mut take_offline = Vec::new();
        for rebuild in &payloads {
            let name = &rebuild.component_name;
            let previous = res
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(name))
                .cloned();
            let mut status = previous.clone().unwrap_or_default();
            status.phase = res.cluster.component_phase(name);

            let component = ctx.synthesizer.synthesize(&res.cluster, name).await?;
            let pods = list_component_pods(ctx, res, name).await?;
            let mut expect = 0;
            let mut completed = 0;
            if rebuild.in_place {
                for instance in &rebuild.instances {
                    let object_key = pod_object_key(&instance.name);
                    expect += 1;
                    if find_progress_detail(&status, &object_key)
                        .is_some_and(|detail| detail.status.is_completed())
                    {
                        completed += 1;
                        continue;
                    }
                    let detail =
                        rebuild_in_place(ctx, res, rebuild, instance, &component, &pods).await?;
                    completed += i32::from(detail.status.is_completed());
                    set_progress_detail(&mut status, detail);
                }
            } else {
                let (Some(spec), Some(last)) = (
                    res.cluster.component_spec(name),
                    res.ops.last_component_configuration(name),
                ) else {
                    return fatal(format!(
                        "no last configuration recorded for component {name:?}"
                    ));
                };
                let taken_offline = is_taken_offline(spec, rebuild);
                let mut replacements_up = true;
                for (old, new) in replacement_pods(res.cluster_name(), last, rebuild)? {
                    replacements_up &= find_pod(&pods, &new)
                        .is_some_and(|pod| pod_is_up(&res.ops, &component, pod));
                    let detail =
                        replacement_detail(res, &component, &pods, &old, &new, taken_offline);
                    let object_key = detail.object_key.clone();
                    set_progress_detail(&mut status, detail);
                    expect += 1;
                    completed += i32::from(
                        find_progress_detail(&status, &object_key)
                            .is_some_and(|detail| detail.status.is_completed()),
                    );
                }
                if replacements_up && !taken_offline {
                    take_offline.push(rebuild.clone());
                }
            }
            tally.add(name, expect, completed);

            if previous.as_ref() != Some(&status) {
                tally.changed = true;
                res.ops.status_mut().components.insert(name.clone(), status);
            }
        }

        if !take_offline.is_empty() {
            let set = ComponentOpsSet::new(&take_offline);
            let ops = &res.ops;
            set.update_components_and_shardings(&mut res.cluster, |spec, rebuild| {
                let Some(last) = ops.last_component_configuration(&spec.name) else {
                    return fatal(format!(
                        "no last configuration recorded for component {:?}",
                        spec.name
                    ));
                };
                apply_take_offline(spec, last, rebuild);
                Ok(())
            })?;
            res.cluster = ctx.client.update(&res.cluster).await?;
            info!(
                ops_request = res.ops_name(),
                cluster = res.cluster_name(),
                "taking rebuilt instances offline"
            );
        }

        finish_component_progress(ctx, res, tally).await
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn last() -> LastComponentConfiguration {
        serde_yaml::from_str(indoc! {"
            replicas: 4
            instances:
              - name: big
                replicas: 1
            offlineInstances:
              - mycluster-mysql-1
        "})
        .expect("valid snapshot")
    }

    fn rebuild(names: &[&str]) -> RebuildInstance {
        RebuildInstance {
            component_name: "mysql".to_owned(),
            instances: names
                .iter()
                .map(|name| Instance {
                    name: (*name).to_owned(),
                    target_node_name: None,
                })
                .collect(),
            in_place: false,
            backup_name: None,
        }
    }

    #[test]
    fn replacements_are_created_within_the_same_template() {
        let rebuild = rebuild(&["mycluster-mysql-2", "mycluster-mysql-big-0"]);
        let replacements = replacement_pods("mycluster", &last(), &rebuild).unwrap();
        assert_eq!(
            replacements,
            BTreeMap::from([
                ("mycluster-mysql-2".to_owned(), "mycluster-mysql-4".to_owned()),
                ("mycluster-mysql-big-0".to_owned(), "mycluster-mysql-big-1".to_owned()),
            ])
        );
    }

    #[test]
    fn taking_instances_offline_keeps_the_replacements() {
        let last = last();
        let rebuild = rebuild(&["mycluster-mysql-2"]);
        let mut spec = ClusterComponentSpec {
            name: "mysql".to_owned(),
            replicas: last.replicas,
            instances: last.instances.clone(),
            offline_instances: last.offline_instances.clone(),
            ..ClusterComponentSpec::default()
        };

        apply_scale_out(&mut spec, "mycluster", &last, &rebuild);
        assert!(is_scaled_out(&spec, &last));
        let scaled_out = instance::generate_pod_names(
            "mycluster",
            "mysql",
            spec.replicas,
            &spec.instances,
            &spec.offline_instances,
        )
        .unwrap();
        assert_eq!(scaled_out, vec![
            "mycluster-mysql-0",
            "mycluster-mysql-2",
            "mycluster-mysql-3",
            "mycluster-mysql-4",
            "mycluster-mysql-big-0",
        ]);

        apply_take_offline(&mut spec, &last, &rebuild);
        assert!(is_taken_offline(&spec, &rebuild));
        let rebuilt = instance::generate_pod_names(
            "mycluster",
            "mysql",
            spec.replicas,
            &spec.instances,
            &spec.offline_instances,
        )
        .unwrap();
        assert_eq!(rebuilt, vec![
            "mycluster-mysql-0",
            "mycluster-mysql-3",
            "mycluster-mysql-4",
            "mycluster-mysql-big-0",
        ]);
    }
}

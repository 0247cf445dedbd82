//! Horizontal scaling: replica counts, instance templates, offline instances and shard counts.
//!
//! Everything is derived from the snapshot taken on admission, so the expected component values
//! (and with them the created and deleted pods) are the same no matter how often they are
//! computed.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use tracing::info;

use crate::{
    crd::{
        cluster::InstanceTemplate,
        ops_request::{
            HorizontalScaling, InstanceReplicasTemplate, LastComponentConfiguration, Operation,
            OpsCondition, OpsPhase, OpsRequest, OpsType, ReplicaChanger,
        },
    },
    instance,
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{
            ComponentOpsSet, collect_component_progress, finish_component_progress,
            validate_component_names,
        },
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::handle_scale_progress,
        util::abort_earlier_ops_with_same_kind,
    },
};

pub struct HorizontalScalingHandler;

fn payloads(ops: &OpsRequest) -> Result<&[HorizontalScaling]> {
    match &ops.spec.operation {
        Operation::HorizontalScaling { horizontal_scaling } => Ok(horizontal_scaling),
        other => unexpected_operation(other.ops_type(), OpsType::HorizontalScaling),
    }
}

/// The component values a horizontal scaling results in.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExpectedValues {
    pub replicas: i32,
    pub instances: Vec<InstanceTemplate>,
    pub offline_instances: Vec<String>,
}

/// Applies `scaling` to the snapshot `last`.
pub(crate) fn expected_component_values(
    cluster_name: &str,
    component_name: &str,
    last: &LastComponentConfiguration,
    scaling: &HorizontalScaling,
) -> Result<ExpectedValues> {
    let mut scaling = scaling.clone();
    let offline_instances = expected_offline_instances(&last.offline_instances, &scaling);
    auto_sync_replica_changes(
        cluster_name,
        component_name,
        &mut scaling,
        last,
        &offline_instances,
    )?;
    Ok(ExpectedValues {
        replicas: expected_replicas(&scaling, last.replicas),
        instances: expected_instances(last.instances.clone(), &scaling),
        offline_instances,
    })
}

fn expected_offline_instances(last_offline: &[String], scaling: &HorizontalScaling) -> Vec<String> {
    let mut offline = last_offline.to_vec();
    if let Some(scale_in) = &scaling.scale_in {
        for name in &scale_in.online_instances_to_offline {
            if !offline.contains(name) {
                offline.push(name.clone());
            }
        }
    }
    if let Some(scale_out) = &scaling.scale_out {
        offline.retain(|name| !scale_out.offline_instances_to_online.contains(name));
    }
    offline
}

/// Derives the replica changes the request leaves implicit from the instances it names, so that
/// the component replicas and the template replicas stay in sync.
fn auto_sync_replica_changes(
    cluster_name: &str,
    component_name: &str,
    scaling: &mut HorizontalScaling,
    last: &LastComponentConfiguration,
    expected_offline: &[String],
) -> Result<()> {
    if let Some(scale_in) = scaling.scale_in.as_mut() {
        let offline_counts = instance::count_by_template(
            cluster_name,
            component_name,
            &scale_in.online_instances_to_offline,
        );
        sync_replica_changer(&offline_counts, &mut scale_in.replica_changer, &[]);
    }

    if let Some(scale_out) = scaling.scale_out.as_mut() {
        // Instances brought back online only count if they are part of the resulting pod set
        let pod_set = instance::generate_pod_name_set(
            cluster_name,
            component_name,
            last.replicas,
            &last.instances,
            expected_offline,
        )?;
        let online = scale_out
            .offline_instances_to_online
            .iter()
            .filter(|name| pod_set.contains_key(*name))
            .collect::<Vec<_>>();
        let online_counts = instance::count_by_template(cluster_name, component_name, online);
        sync_replica_changer(
            &online_counts,
            &mut scale_out.replica_changer,
            &scale_out.new_instances,
        );
    }
    Ok(())
}

fn sync_replica_changer(
    counts_by_template: &BTreeMap<String, i32>,
    changer: &mut ReplicaChanger,
    new_instances: &[InstanceTemplate],
) {
    let named = changer
        .instances
        .iter()
        .map(|template| template.name.clone())
        .collect::<BTreeSet<_>>();
    let mut total = changer
        .instances
        .iter()
        .map(|template| template.replica_changes)
        .sum::<i32>();
    for (template, count) in counts_by_template {
        if template.is_empty() {
            total += count;
        } else if !named.contains(template) {
            changer.instances.push(InstanceReplicasTemplate {
                name: template.clone(),
                replica_changes: *count,
            });
            total += count;
        }
    }
    total += new_instances
        .iter()
        .map(InstanceTemplate::replicas)
        .sum::<i32>();
    changer.replica_changes.get_or_insert(total);
}

fn expected_replicas(scaling: &HorizontalScaling, last_replicas: i32) -> i32 {
    let scale_out = scaling
        .scale_out
        .as_ref()
        .and_then(|scale_out| scale_out.replica_changer.replica_changes)
        .unwrap_or_default();
    let scale_in = scaling
        .scale_in
        .as_ref()
        .and_then(|scale_in| scale_in.replica_changer.replica_changes)
        .unwrap_or_default();
    last_replicas + scale_out - scale_in
}

fn expected_instances(
    mut templates: Vec<InstanceTemplate>,
    scaling: &HorizontalScaling,
) -> Vec<InstanceTemplate> {
    fn apply(templates: &mut [InstanceTemplate], changes: &[InstanceReplicasTemplate], sign: i32) {
        for change in changes {
            if let Some(template) = templates
                .iter_mut()
                .find(|template| template.name == change.name)
            {
                template.replicas = Some(template.replicas() + sign * change.replica_changes);
            }
        }
    }

    if let Some(scale_out) = &scaling.scale_out {
        templates.extend(scale_out.new_instances.iter().cloned());
        apply(&mut templates, &scale_out.replica_changer.instances, 1);
    }
    if let Some(scale_in) = &scaling.scale_in {
        apply(&mut templates, &scale_in.replica_changer.instances, -1);
    }
    templates
}

/// The pods created and deleted by `scaling`, each mapped to its instance template. Swapped while
/// the request is cancelled.
pub(crate) fn created_and_deleted_pods(
    cluster_name: &str,
    component_name: &str,
    full_component_name: &str,
    last: &LastComponentConfiguration,
    scaling: &HorizontalScaling,
    cancelling: bool,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
    let last_pods = instance::generate_pod_name_set(
        cluster_name,
        full_component_name,
        last.replicas,
        &last.instances,
        &last.offline_instances,
    )?;
    let expected = expected_component_values(cluster_name, component_name, last, scaling)?;
    let expected_pods = instance::generate_pod_name_set(
        cluster_name,
        full_component_name,
        expected.replicas,
        &expected.instances,
        &expected.offline_instances,
    )?;

    let created = difference(&expected_pods, &last_pods);
    let deleted = difference(&last_pods, &expected_pods);
    Ok(if cancelling {
        (deleted, created)
    } else {
        (created, deleted)
    })
}

fn difference(
    left: &BTreeMap<String, String>,
    right: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    left.iter()
        .filter(|(name, _)| !right.contains_key(*name))
        .map(|(name, template)| (name.clone(), template.clone()))
        .collect()
}

/// Fails if `current` takes an instance offline that the still running `earlier` request
/// creates.
fn check_intersection_with_earlier_ops(
    cluster_name: &str,
    current: &OpsRequest,
    current_scaling: &HorizontalScaling,
    earlier: &OpsRequest,
    earlier_scaling: &HorizontalScaling,
) -> Result<()> {
    let component_name = &earlier_scaling.component_name;
    let (Some(earlier_last), Some(current_last)) = (
        earlier.last_component_configuration(component_name),
        current.last_component_configuration(component_name),
    ) else {
        return Ok(());
    };

    let (created_by_earlier, _) = created_and_deleted_pods(
        cluster_name,
        component_name,
        component_name,
        earlier_last,
        earlier_scaling,
        false,
    )?;
    let (_, deleted_by_current) = created_and_deleted_pods(
        cluster_name,
        component_name,
        component_name,
        current_last,
        current_scaling,
        false,
    )?;
    if let Some(pod) = deleted_by_current
        .keys()
        .find(|pod| created_by_earlier.contains_key(*pod))
    {
        return fatal(format!(
            "instance {pod:?} cannot be taken offline as it has been created by another running \
             opsRequest {:?}",
            earlier.metadata.name.as_deref().unwrap_or_default()
        ));
    }
    Ok(())
}

fn validate_replica_changer(
    component_name: &str,
    changer: &ReplicaChanger,
    templates: &[&str],
) -> Result<()> {
    if changer.replica_changes.is_some_and(|changes| changes < 0) {
        return fatal(format!(
            "replicaChanges of component {component_name:?} must not be negative"
        ));
    }
    for template in &changer.instances {
        if !templates.contains(&template.name.as_str()) {
            return fatal(format!(
                "instance template {:?} not found in component {component_name:?}",
                template.name
            ));
        }
        if template.replica_changes < 0 {
            return fatal(format!(
                "replicaChanges of instance template {:?} must not be negative",
                template.name
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl OpsHandler for HorizontalScalingHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|scaling| scaling.component_name.as_str()),
        )?;

        for scaling in payloads {
            let name = &scaling.component_name;
            let Some(spec) = res.cluster.component_spec(name) else {
                return fatal(format!("component {name:?} not found"));
            };
            match scaling.shards {
                Some(_) if res.cluster.sharding(name).is_none() => {
                    return fatal(format!(
                        "shards can only be changed for shardings, {name:?} is a component"
                    ));
                }
                Some(shards) if shards < 0 => {
                    return fatal(format!("shards of sharding {name:?} must not be negative"));
                }
                _ => {}
            }

            let mut templates = spec
                .instances
                .iter()
                .map(|template| template.name.as_str())
                .collect::<Vec<_>>();
            if let Some(scale_in) = &scaling.scale_in {
                validate_replica_changer(name, &scale_in.replica_changer, &templates)?;
            }
            if let Some(scale_out) = &scaling.scale_out {
                for template in &scale_out.new_instances {
                    if templates.contains(&template.name.as_str()) {
                        return fatal(format!(
                            "new instance template {:?} already exists in component {name:?}",
                            template.name
                        ));
                    }
                    templates.push(&template.name);
                }
                validate_replica_changer(name, &scale_out.replica_changer, &templates)?;
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
            "HorizontalScalingStarted",
            format!(
                "Start to horizontal scale replicas in Cluster: {}",
                res.cluster_name()
            ),
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
        if res
            .cluster
            .phase()
            .is_some_and(|phase| phase.is_stopped_or_stopping())
        {
            return fatal("please start the cluster before scaling the cluster horizontally");
        }

        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        let cluster_name = res.cluster_name().to_owned();
        let current = res.ops.clone();
        abort_earlier_ops_with_same_kind(
            ctx,
            res,
            &[OpsType::HorizontalScaling, OpsType::Start],
            |earlier| {
                let Operation::HorizontalScaling { horizontal_scaling } = &earlier.spec.operation
                else {
                    return Ok(true);
                };
                let mut overlaps = false;
                for earlier_scaling in horizontal_scaling {
                    let Some(current_scaling) = set.get(&earlier_scaling.component_name) else {
                        continue;
                    };
                    overlaps = true;
                    if earlier.phase() != OpsPhase::Pending {
                        check_intersection_with_earlier_ops(
                            &cluster_name,
                            &current,
                            current_scaling,
                            earlier,
                            earlier_scaling,
                        )?;
                    }
                }
                Ok(overlaps)
            },
        )
        .await?;

        let ops = &res.ops;
        set.update_components_and_shardings(&mut res.cluster, |spec, scaling| {
            let name = &scaling.component_name;
            let Some(last) = ops.last_component_configuration(name) else {
                return fatal(format!("no last configuration recorded for component {name:?}"));
            };

            if let Some(scale_in) = &scaling.scale_in {
                let online = instance::generate_pod_name_set(
                    &cluster_name,
                    name,
                    last.replicas,
                    &last.instances,
                    &last.offline_instances,
                )?;
                if let Some(pod) = scale_in
                    .online_instances_to_offline
                    .iter()
                    .find(|pod| !online.contains_key(*pod))
                {
                    return fatal(format!(
                        "instance {pod:?} specified in onlineInstancesToOffline is not online"
                    ));
                }
            }

            let expected = expected_component_values(&cluster_name, name, last, scaling)?;
            let template_replicas = expected
                .instances
                .iter()
                .map(InstanceTemplate::replicas)
                .sum::<i32>();
            if template_replicas > expected.replicas {
                return fatal(format!(
                    "the total number of replicas for the instance template can not greater than \
                     the number of replicas for component {name:?} after horizontally scaling"
                ));
            }
            if expected.replicas < 0 {
                return fatal(format!(
                    "component {name:?} can not be scaled in below zero replicas"
                ));
            }
            spec.replicas = expected.replicas;
            spec.instances = expected.instances;
            spec.offline_instances = expected.offline_instances;
            Ok(())
        })?;

        for sharding in &mut res.cluster.spec.shardings {
            if let Some(shards) = set.get(&sharding.name).and_then(|scaling| scaling.shards) {
                sharding.shards = shards;
            }
        }
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "scaled cluster components horizontally"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let payloads = payloads(&res.ops)?.to_vec();
        let set = ComponentOpsSet::new(&payloads);
        let mut resources = set.build_progress_resources(ctx, res).await?;
        let cancelling = res.ops.phase() == OpsPhase::Cancelling;

        let mut tally = collect_component_progress(res, &mut resources, |res, resource, status| {
            let Some(last) = res.ops.last_component_configuration(&resource.component_name)
            else {
                return fatal(format!(
                    "no last configuration recorded for component {:?}",
                    resource.component_name
                ));
            };
            let (created, deleted) = created_and_deleted_pods(
                res.cluster_name(),
                &resource.component_name,
                &resource.full_component_name,
                last,
                &resource.payload,
                cancelling,
            )?;
            resource.created_pods = created;
            resource.deleted_pods = deleted;
            resource.no_wait_component_completed = true;
            Ok(handle_scale_progress(res, resource, status))
        })?;

        for scaling in &payloads {
            let Some(shards) = scaling.shards else {
                continue;
            };
            let Some(last_shards) = res
                .ops
                .last_component_configuration(&scaling.component_name)
                .and_then(|last| last.shards)
            else {
                continue;
            };
            let members = ctx
                .synthesizer
                .list_sharding_components(&res.cluster, &scaling.component_name)
                .await?;
            let members = i32::try_from(members.len()).unwrap_or(i32::MAX);
            let expect = (shards - last_shards).abs();
            let completed = if shards >= last_shards {
                members - last_shards
            } else {
                last_shards - members
            };
            tally.add(&scaling.component_name, expect, completed.clamp(0, expect));
        }

        finish_component_progress(ctx, res, tally).await
    }

    async fn cancel(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        if payloads.iter().any(|scaling| scaling.shards.is_some()) {
            return fatal(
                "cancelling a change of the shard count is not supported, it needs manual \
                 intervention",
            );
        }
        let set = ComponentOpsSet::new(payloads);
        set.cancel_component_ops(&mut res.cluster, &res.ops, |spec, last| {
            spec.replicas = last.replicas;
            spec.instances.clone_from(&last.instances);
            spec.offline_instances.clone_from(&last.offline_instances);
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::crd::ops_request::{ScaleIn, ScaleOut};

    fn template(name: &str, replicas: i32) -> InstanceTemplate {
        InstanceTemplate {
            name: name.to_owned(),
            replicas: Some(replicas),
            ..InstanceTemplate::default()
        }
    }

    fn last(replicas: i32, instances: Vec<InstanceTemplate>, offline: &[&str]) -> LastComponentConfiguration {
        LastComponentConfiguration {
            replicas,
            instances,
            offline_instances: offline.iter().map(|name| (*name).to_owned()).collect(),
            ..LastComponentConfiguration::default()
        }
    }

    fn scale_out(replica_changes: Option<i32>) -> HorizontalScaling {
        HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_out: Some(ScaleOut {
                replica_changer: ReplicaChanger {
                    replica_changes,
                    instances: Vec::new(),
                },
                ..ScaleOut::default()
            }),
            ..HorizontalScaling::default()
        }
    }

    #[test]
    fn scale_out_creates_new_ordinals() {
        let (created, deleted) = created_and_deleted_pods(
            "mycluster",
            "mysql",
            "mysql",
            &last(3, Vec::new(), &[]),
            &scale_out(Some(2)),
            false,
        )
        .unwrap();
        assert_eq!(created.keys().collect::<Vec<_>>(), vec![
            "mycluster-mysql-3",
            "mycluster-mysql-4"
        ]);
        assert!(deleted.is_empty());
    }

    #[test]
    fn cancelling_swaps_created_and_deleted_pods() {
        let (created, deleted) = created_and_deleted_pods(
            "mycluster",
            "mysql",
            "mysql",
            &last(3, Vec::new(), &[]),
            &scale_out(Some(2)),
            true,
        )
        .unwrap();
        assert!(created.is_empty());
        assert_eq!(deleted.len(), 2);
    }

    #[test]
    fn taking_instances_offline_derives_replica_changes() {
        let scaling = HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_in: Some(ScaleIn {
                online_instances_to_offline: vec![
                    "mycluster-mysql-1".to_owned(),
                    "mycluster-mysql-big-0".to_owned(),
                ],
                ..ScaleIn::default()
            }),
            ..HorizontalScaling::default()
        };
        let last = last(4, vec![template("big", 1)], &[]);

        let expected = expected_component_values("mycluster", "mysql", &last, &scaling).unwrap();
        assert_eq!(expected.replicas, 2);
        assert_eq!(expected.instances, vec![template("big", 0)]);
        assert_eq!(expected.offline_instances, vec![
            "mycluster-mysql-1",
            "mycluster-mysql-big-0"
        ]);

        let (created, deleted) =
            created_and_deleted_pods("mycluster", "mysql", "mysql", &last, &scaling, false)
                .unwrap();
        assert!(created.is_empty());
        assert_eq!(deleted.keys().collect::<Vec<_>>(), vec![
            "mycluster-mysql-1",
            "mycluster-mysql-big-0"
        ]);
    }

    #[test]
    fn bringing_instances_back_online() {
        let scaling = HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_out: Some(ScaleOut {
                offline_instances_to_online: vec!["mycluster-mysql-1".to_owned()],
                ..ScaleOut::default()
            }),
            ..HorizontalScaling::default()
        };
        let last = last(2, Vec::new(), &["mycluster-mysql-1"]);

        let expected = expected_component_values("mycluster", "mysql", &last, &scaling).unwrap();
        assert_eq!(expected.replicas, 3);
        assert!(expected.offline_instances.is_empty());

        let (created, _) =
            created_and_deleted_pods("mycluster", "mysql", "mysql", &last, &scaling, false)
                .unwrap();
        assert_eq!(created.keys().collect::<Vec<_>>(), vec!["mycluster-mysql-1"]);
    }

    #[rstest]
    #[case::plain_scale_out(3, Vec::new(), Some(2), Vec::new(), None, 5)]
    #[case::plain_scale_in(3, Vec::new(), None, Vec::new(), Some(1), 2)]
    #[case::template_scale_out(
        3,
        vec![template("big", 1)],
        None,
        vec![InstanceReplicasTemplate { name: "big".to_owned(), replica_changes: 2 }],
        None,
        5
    )]
    #[case::explicit_total_wins(
        3,
        vec![template("big", 1)],
        Some(1),
        vec![InstanceReplicasTemplate { name: "big".to_owned(), replica_changes: 1 }],
        Some(1),
        3
    )]
    fn replicas_follow_replica_changes(
        #[case] replicas: i32,
        #[case] templates: Vec<InstanceTemplate>,
        #[case] scale_out_changes: Option<i32>,
        #[case] scale_out_templates: Vec<InstanceReplicasTemplate>,
        #[case] scale_in_changes: Option<i32>,
        #[case] expected_replicas: i32,
    ) {
        let scaling = HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_out: Some(ScaleOut {
                replica_changer: ReplicaChanger {
                    replica_changes: scale_out_changes,
                    instances: scale_out_templates,
                },
                ..ScaleOut::default()
            }),
            scale_in: scale_in_changes.map(|changes| ScaleIn {
                replica_changer: ReplicaChanger {
                    replica_changes: Some(changes),
                    instances: Vec::new(),
                },
                ..ScaleIn::default()
            }),
            ..HorizontalScaling::default()
        };
        let expected = expected_component_values(
            "mycluster",
            "mysql",
            &last(replicas, templates, &[]),
            &scaling,
        )
        .unwrap();

        assert_eq!(expected.replicas, expected_replicas);
        let template_replicas = expected
            .instances
            .iter()
            .map(InstanceTemplate::replicas)
            .sum::<i32>();
        assert!(template_replicas <= expected.replicas);
    }

    #[test]
    fn new_instance_templates_count_towards_replicas() {
        let scaling = HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_out: Some(ScaleOut {
                new_instances: vec![template("big", 2)],
                ..ScaleOut::default()
            }),
            ..HorizontalScaling::default()
        };
        let expected =
            expected_component_values("mycluster", "mysql", &last(1, Vec::new(), &[]), &scaling)
                .unwrap();
        assert_eq!(expected.replicas, 3);
        assert_eq!(expected.instances, vec![template("big", 2)]);
    }

    #[test]
    fn deleting_an_instance_created_by_a_running_request_is_rejected() {
        let mut earlier = OpsRequest::new("scale-out", crate::crd::ops_request::OpsRequestSpec {
            cluster_name: "mycluster".to_owned(),
            operation: Operation::HorizontalScaling {
                horizontal_scaling: vec![scale_out(Some(1))],
            },
            force: false,
            cancel: false,
            depends_on: None,
            timeout_seconds: None,
            pre_condition_deadline_seconds: None,
            ttl_seconds_after_succeed: None,
            ttl_seconds_after_unsuccessful_completion: None,
        });
        earlier
            .status_mut()
            .last_configuration
            .components
            .insert("mysql".to_owned(), last(3, Vec::new(), &[]));

        let scale_in = HorizontalScaling {
            component_name: "mysql".to_owned(),
            scale_in: Some(ScaleIn {
                online_instances_to_offline: vec!["mycluster-mysql-3".to_owned()],
                ..ScaleIn::default()
            }),
            ..HorizontalScaling::default()
        };
        let mut current = earlier.clone();
        current.metadata.name = Some("scale-in".to_owned());
        current
            .status_mut()
            .last_configuration
            .components
            .insert("mysql".to_owned(), last(4, Vec::new(), &[]));

        let error = check_intersection_with_earlier_ops(
            "mycluster",
            &current,
            &scale_in,
            &earlier,
            &scale_out(Some(1)),
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "instance \"mycluster-mysql-3\" cannot be taken offline as it has been created by \
             another running opsRequest \"scale-out\""
        );
    }
}

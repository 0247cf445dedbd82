//! Shared plumbing for operations which carry one payload per component.
//!
//! A payload names either a component or a sharding. Changes to a sharding are applied to its
//! template, progress is tracked for every current member of the sharding.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use k8s_openapi::api::core::v1::Pod;

use crate::{
    collaborators::SynthesizedComponent,
    constants::{APP_INSTANCE_LABEL, COMPONENT_LABEL},
    crd::{
        cluster::{Cluster, ClusterComponentSpec},
        ops_request::{
            ComponentPayload, LastComponentConfiguration, Operation, OpsPhase, OpsRequest,
            OpsRequestComponentStatus,
        },
    },
    operations::{
        DEFAULT_REQUEUE_AFTER, OpsContext, OpsResource,
        error::{Result, fatal},
        progress,
    },
    validation,
};

/// The payloads of a request, keyed by component name.
#[derive(Clone, Debug)]
pub struct ComponentOpsSet<T> {
    items: BTreeMap<String, T>,
}

impl<T: ComponentPayload + Clone> ComponentOpsSet<T> {
    pub fn new(items: &[T]) -> Self {
        Self {
            items: items
                .iter()
                .map(|item| (item.component_name().to_owned(), item.clone()))
                .collect(),
        }
    }

    pub fn get(&self, component_name: &str) -> Option<&T> {
        self.items.get(component_name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Applies `update` to the spec of every targeted component and sharding template, in spec
    /// order.
    pub fn update_components_and_shardings(
        &self,
        cluster: &mut Cluster,
        mut update: impl FnMut(&mut ClusterComponentSpec, &T) -> Result<()>,
    ) -> Result<()> {
        for spec in &mut cluster.spec.component_specs {
            if let Some(item) = self.items.get(&spec.name) {
                update(spec, item)?;
            }
        }
        for sharding in &mut cluster.spec.shardings {
            if let Some(item) = self.items.get(&sharding.name) {
                update(&mut sharding.template, item)?;
            }
        }
        Ok(())
    }

    /// Stores the snapshot built by `snapshot` for every targeted component. Shardings also
    /// record their shard count.
    pub fn save_last_configurations(
        &self,
        ops: &mut OpsRequest,
        cluster: &Cluster,
        snapshot: impl Fn(&ClusterComponentSpec, &T) -> LastComponentConfiguration,
    ) {
        let mut snapshots = BTreeMap::new();
        for spec in &cluster.spec.component_specs {
            if let Some(item) = self.items.get(&spec.name) {
                snapshots.insert(spec.name.clone(), snapshot(spec, item));
            }
        }
        for sharding in &cluster.spec.shardings {
            if let Some(item) = self.items.get(&sharding.name) {
                let last = LastComponentConfiguration {
                    shards: Some(sharding.shards),
                    ..snapshot(&sharding.template, item)
                };
                snapshots.insert(sharding.name.clone(), last);
            }
        }
        ops.status_mut()
            .last_configuration
            .components
            .extend(snapshots);
    }

    /// Reverts every targeted component from its snapshot with `restore`.
    pub fn cancel_component_ops(
        &self,
        cluster: &mut Cluster,
        ops: &OpsRequest,
        restore: impl Fn(&mut ClusterComponentSpec, &LastComponentConfiguration),
    ) -> Result<()> {
        self.update_components_and_shardings(cluster, |spec, _| {
            let Some(last) = ops.last_component_configuration(&spec.name) else {
                return fatal(format!(
                    "no last configuration recorded for component {:?}",
                    spec.name
                ));
            };
            restore(spec, last);
            Ok(())
        })
    }

    /// Collects everything progress tracking needs for every targeted component, and every
    /// member of every targeted sharding.
    pub async fn build_progress_resources(
        &self,
        ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<Vec<ProgressResource<T>>> {
        let mut resources = Vec::new();
        for spec in &res.cluster.spec.component_specs {
            let Some(item) = self.items.get(&spec.name) else {
                continue;
            };
            resources.push(
                ProgressResource::build(ctx, res, item.clone(), spec.clone(), &spec.name, false)
                    .await?,
            );
        }
        for sharding in &res.cluster.spec.shardings {
            let Some(item) = self.items.get(&sharding.name) else {
                continue;
            };
            let members = ctx
                .synthesizer
                .list_sharding_components(&res.cluster, &sharding.name)
                .await?;
            for member in members {
                resources.push(
                    ProgressResource::build(
                        ctx,
                        res,
                        item.clone(),
                        sharding.template.clone(),
                        &member,
                        true,
                    )
                    .await?,
                );
            }
        }
        Ok(resources)
    }
}

/// The state of one (full) component while its progress is tracked.
#[derive(Clone, Debug)]
pub struct ProgressResource<T> {
    /// Component or sharding name, as used in the request.
    pub component_name: String,

    /// Name of the actual component, a sharding member for shardings.
    pub full_component_name: String,

    pub is_sharding: bool,
    pub payload: T,

    /// The live spec, the template for sharding members.
    pub spec: ClusterComponentSpec,

    pub synthesized: SynthesizedComponent,
    pub pods: Vec<Pod>,

    /// Pods the operation creates, mapped to their instance template.
    pub created_pods: BTreeMap<String, String>,

    /// Pods the operation deletes, mapped to their instance template.
    pub deleted_pods: BTreeMap<String, String>,

    /// Completes once all pods are done, without waiting for the component to settle.
    pub no_wait_component_completed: bool,
}

impl<T: ComponentPayload> ProgressResource<T> {
    async fn build(
        ctx: &OpsContext,
        res: &OpsResource,
        payload: T,
        spec: ClusterComponentSpec,
        full_component_name: &str,
        is_sharding: bool,
    ) -> Result<Self> {
        let synthesized = ctx
            .synthesizer
            .synthesize(&res.cluster, full_component_name)
            .await?;
        let pods = list_component_pods(ctx, res, full_component_name).await?;
        Ok(Self {
            component_name: payload.component_name().to_owned(),
            full_component_name: full_component_name.to_owned(),
            is_sharding,
            payload,
            spec,
            synthesized,
            pods,
            created_pods: BTreeMap::new(),
            deleted_pods: BTreeMap::new(),
            no_wait_component_completed: false,
        })
    }
}

/// Lists the pods of a (full) component.
pub async fn list_component_pods(
    ctx: &OpsContext,
    res: &OpsResource,
    full_component_name: &str,
) -> Result<Vec<Pod>> {
    let labels = BTreeMap::from([
        (APP_INSTANCE_LABEL.to_owned(), res.cluster_name().to_owned()),
        (COMPONENT_LABEL.to_owned(), full_component_name.to_owned()),
    ]);
    Ok(ctx.client.list(res.namespace(), &labels).await?)
}

/// The aggregated progress of all components of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressTally {
    pub expect: i32,
    pub completed: i32,

    /// Components (as named in the request) with outstanding work.
    pub incomplete: BTreeSet<String>,

    /// Whether the request status changed while collecting.
    pub changed: bool,
}

impl ProgressTally {
    pub fn add(&mut self, component_name: &str, expect: i32, completed: i32) {
        self.expect += expect;
        self.completed += completed;
        if completed < expect {
            self.incomplete.insert(component_name.to_owned());
        }
    }
}

/// Runs `handle` for every resource, records the per-component progress in the request status
/// and sums it up.
///
/// A component is complete once all its expected objects completed and, unless the resource
/// says otherwise, the component settled in a terminal phase.
pub fn collect_component_progress<T>(
    res: &mut OpsResource,
    resources: &mut [ProgressResource<T>],
    mut handle: impl FnMut(
        &OpsResource,
        &mut ProgressResource<T>,
        &mut OpsRequestComponentStatus,
    ) -> Result<(i32, i32)>,
) -> Result<ProgressTally> {
    let mut tally = ProgressTally::default();
    for resource in resources.iter_mut() {
        let previous = res
            .ops
            .status
            .as_ref()
            .and_then(|status| status.components.get(&resource.component_name))
            .cloned();
        let mut component_status = previous.clone().unwrap_or_default();
        component_status.phase = res.cluster.component_phase(&resource.full_component_name);

        let (expect, completed) = handle(res, resource, &mut component_status)?;
        let settled = resource.no_wait_component_completed
            || res
                .cluster
                .component_phase(&resource.full_component_name)
                .is_some_and(|phase| phase.is_terminal());
        tally.expect += expect;
        tally.completed += completed;
        if completed < expect || !settled {
            tally.incomplete.insert(resource.component_name.clone());
        }

        if previous.as_ref() != Some(&component_status) {
            tally.changed = true;
            res.ops
                .status_mut()
                .components
                .insert(resource.component_name.clone(), component_status);
        }
    }
    Ok(tally)
}

/// Persists the progress of `tally` and derives the resulting phase.
pub async fn finish_component_progress(
    ctx: &OpsContext,
    res: &mut OpsResource,
    tally: ProgressTally,
) -> Result<(OpsPhase, Duration)> {
    let progress = format!("{}/{}", tally.completed, tally.expect);
    let status = res.ops.status_mut();
    if tally.changed || status.progress != progress {
        status.progress = progress;
        res.ops = ctx.client.update_status(&res.ops).await?;
    }

    if !tally.incomplete.is_empty() {
        return Ok((OpsPhase::Running, DEFAULT_REQUEUE_AFTER));
    }
    if progress::has_failed_details(&res.ops) {
        return Ok((OpsPhase::Failed, DEFAULT_REQUEUE_AFTER));
    }
    Ok((OpsPhase::Succeed, DEFAULT_REQUEUE_AFTER))
}

/// Collects and persists the progress of all resources in one go.
pub async fn reconcile_component_progress<T>(
    ctx: &OpsContext,
    res: &mut OpsResource,
    resources: &mut [ProgressResource<T>],
    handle: impl FnMut(
        &OpsResource,
        &mut ProgressResource<T>,
        &mut OpsRequestComponentStatus,
    ) -> Result<(i32, i32)>,
) -> Result<(OpsPhase, Duration)> {
    let tally = collect_component_progress(res, resources, handle)?;
    finish_component_progress(ctx, res, tally).await
}

/// The components and shardings an operation targets, as named in the request.
///
/// Empty for `Stop` and `Start` requests without components, which target the whole cluster.
pub fn targeted_component_names(operation: &Operation) -> Vec<String> {
    fn names<T: ComponentPayload>(items: &[T]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.component_name().to_owned())
            .collect()
    }

    match operation {
        Operation::HorizontalScaling { horizontal_scaling } => names(horizontal_scaling),
        Operation::VerticalScaling { vertical_scaling } => names(vertical_scaling),
        Operation::VolumeExpansion { volume_expansion } => names(volume_expansion),
        Operation::Restart { restart } => names(restart),
        Operation::Stop { stop } => names(stop),
        Operation::Start { start } => names(start),
        Operation::Switchover { switchover } => names(switchover),
        Operation::Expose { expose } => names(expose),
        Operation::Reconfigure { reconfigure } => names(reconfigure),
        Operation::RebuildInstance { rebuild_from } => names(rebuild_from),
        Operation::Custom { custom } => names(&custom.components),
    }
}

/// Checks that every name refers to a component or sharding of the cluster, at most once.
pub fn validate_component_names<'a>(
    cluster: &Cluster,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let names = names.into_iter().collect::<Vec<_>>();

    let mut errors = validation::Errors::default();
    for name in &names {
        errors.collect("componentName", validation::is_rfc_1123_label(name));
    }
    errors.into_result()?;

    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return fatal(format!("duplicate component name {name:?} in the request"));
        }
        if cluster.component_spec(name).is_none() {
            return fatal(format!(
                "component {name:?} not found in cluster {:?}",
                cluster.metadata.name.as_deref().unwrap_or_default()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::crd::ops_request::ComponentOps;

    fn cluster() -> Cluster {
        serde_yaml::from_str(indoc! {"
            apiVersion: apps.stackable.tech/v1alpha1
            kind: Cluster
            metadata:
              name: mycluster
              namespace: default
            spec:
              componentSpecs:
                - name: mysql
                  replicas: 3
                - name: proxy
                  replicas: 1
              shardings:
                - name: shard
                  shards: 2
                  template:
                    name: shard
                    replicas: 2
        "})
        .expect("valid cluster")
    }

    fn component_ops(names: &[&str]) -> Vec<ComponentOps> {
        names
            .iter()
            .map(|name| ComponentOps {
                component_name: (*name).to_owned(),
            })
            .collect()
    }

    #[test]
    fn update_visits_components_and_sharding_templates() {
        let mut cluster = cluster();
        let set = ComponentOpsSet::new(&component_ops(&["shard", "mysql"]));

        let mut visited = Vec::new();
        set.update_components_and_shardings(&mut cluster, |spec, _| {
            visited.push(spec.name.clone());
            spec.replicas += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(visited, vec!["mysql", "shard"]);
        assert_eq!(cluster.component_spec("mysql").unwrap().replicas, 4);
        assert_eq!(cluster.component_spec("proxy").unwrap().replicas, 1);
        assert_eq!(cluster.component_spec("shard").unwrap().replicas, 3);
    }

    #[test]
    fn snapshots_record_shards() {
        let cluster = cluster();
        let mut ops = OpsRequest::new("restart", crate::crd::ops_request::OpsRequestSpec {
            cluster_name: "mycluster".to_owned(),
            operation: Operation::Restart {
                restart: component_ops(&["mysql", "shard"]),
            },
            force: false,
            cancel: false,
            depends_on: None,
            timeout_seconds: None,
            pre_condition_deadline_seconds: None,
            ttl_seconds_after_succeed: None,
            ttl_seconds_after_unsuccessful_completion: None,
        });

        let set = ComponentOpsSet::new(&component_ops(&["mysql", "shard"]));
        set.save_last_configurations(&mut ops, &cluster, |spec, _| LastComponentConfiguration {
            replicas: spec.replicas,
            ..LastComponentConfiguration::default()
        });

        let mysql = ops.last_component_configuration("mysql").unwrap();
        assert_eq!((mysql.replicas, mysql.shards), (3, None));
        let shard = ops.last_component_configuration("shard").unwrap();
        assert_eq!((shard.replicas, shard.shards), (2, Some(2)));
    }

    #[rstest]
    #[case::valid(&["mysql", "shard"], true)]
    #[case::unknown(&["postgres"], false)]
    #[case::duplicate(&["mysql", "mysql"], false)]
    #[case::invalid_name(&["My_SQL"], false)]
    fn component_name_validation(#[case] names: &[&str], #[case] valid: bool) {
        assert_eq!(
            validate_component_names(&cluster(), names.iter().copied()).is_ok(),
            valid
        );
    }

    #[test]
    fn tally_marks_incomplete_components() {
        let mut tally = ProgressTally::default();
        tally.add("mysql", 2, 2);
        tally.add("shard", 2, 1);
        assert_eq!((tally.expect, tally.completed), (4, 3));
        assert_eq!(tally.incomplete, BTreeSet::from(["shard".to_owned()]));
    }
}

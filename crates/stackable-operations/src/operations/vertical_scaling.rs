use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::{
    crd::{
        cluster::ClusterComponentSpec,
        ops_request::{
            LastComponentConfiguration, Operation, OpsCondition, OpsPhase, OpsRequest, OpsType,
            VerticalScaling,
        },
    },
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{ComponentOpsSet, reconcile_component_progress, validate_component_names},
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::handle_restart_progress,
        util::{abort_earlier_ops_with_same_kind, overlapping_components},
    },
};

pub struct VerticalScalingHandler;

fn payloads(ops: &OpsRequest) -> Result<&[VerticalScaling]> {
    match &ops.spec.operation {
        Operation::VerticalScaling { vertical_scaling } => Ok(vertical_scaling),
        other => unexpected_operation(other.ops_type(), OpsType::VerticalScaling),
    }
}

fn apply_resources(spec: &mut ClusterComponentSpec, scaling: &VerticalScaling) -> Result<()> {
    if let Some(resources) = &scaling.resources {
        spec.resources = Some(resources.clone());
    }
    for template in &scaling.instances {
        let Some(existing) = spec
            .instances
            .iter_mut()
            .find(|existing| existing.name == template.name)
        else {
            return fatal(format!(
                "instance template {:?} not found in component {:?}",
                template.name, scaling.component_name
            ));
        };
        existing.resources = Some(template.resources.clone());
    }
    Ok(())
}

/// Whether applying `scaling` to the snapshot leaves every resource requirement unchanged, in
/// which case no pod is restarted.
fn resources_unchanged(last: &LastComponentConfiguration, scaling: &VerticalScaling) -> bool {
    let component_unchanged = scaling
        .resources
        .as_ref()
        .is_none_or(|resources| last.resources.as_ref() == Some(resources));
    let templates_unchanged = scaling.instances.iter().all(|template| {
        last.instances
            .iter()
            .find(|existing| existing.name == template.name)
            .is_some_and(|existing| existing.resources.as_ref() == Some(&template.resources))
    });
    component_unchanged && templates_unchanged
}

#[async_trait]
impl OpsHandler for VerticalScalingHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|scaling| scaling.component_name.as_str()),
        )?;
        for scaling in payloads {
            let Some(spec) = res.cluster.component_spec(&scaling.component_name) else {
                continue;
            };
            if let Some(template) = scaling
                .instances
                .iter()
                .find(|template| spec.instance_template(&template.name).is_none())
            {
                return fatal(format!(
                    "instance template {:?} not found in component {:?}",
                    template.name, scaling.component_name
                ));
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
            "VerticalScalingStarted",
            format!(
                "Start to vertical scale resources in Cluster: {}",
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
                resources: spec.resources.clone(),
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        let targets = set.component_names().map(str::to_owned).collect::<Vec<_>>();
        abort_earlier_ops_with_same_kind(ctx, res, &[OpsType::VerticalScaling], |earlier| {
            let earlier_targets = payloads(earlier)?
                .iter()
                .map(|scaling| scaling.component_name.clone())
                .collect::<Vec<_>>();
            Ok(overlapping_components(&targets, &earlier_targets))
        })
        .await?;

        set.update_components_and_shardings(&mut res.cluster, apply_resources)?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "updated component resources"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        let mut resources = set.build_progress_resources(ctx, res).await?;
        let cancelling = res.ops.phase() == OpsPhase::Cancelling;
        reconcile_component_progress(ctx, res, &mut resources, |res, resource, status| {
            let unchanged = res
                .ops
                .last_component_configuration(&resource.component_name)
                .is_some_and(|last| resources_unchanged(last, &resource.payload));
            if unchanged && !cancelling {
                resource.no_wait_component_completed = true;
                return Ok((0, 0));
            }
            handle_restart_progress(res, resource, status)
        })
        .await
    }

    async fn cancel(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        set.cancel_component_ops(&mut res.cluster, &res.ops, |spec, last| {
            spec.resources.clone_from(&last.resources);
            for template in &mut spec.instances {
                if let Some(previous) = last
                    .instances
                    .iter()
                    .find(|previous| previous.name == template.name)
                {
                    template.resources.clone_from(&previous.resources);
                }
            }
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
    };

    use super::*;
    use crate::crd::{cluster::InstanceTemplate, ops_request::InstanceResourceTemplate};

    fn cpu(value: &str) -> ResourceRequirements {
        ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "cpu".to_owned(),
                Quantity(value.to_owned()),
            )])),
            ..ResourceRequirements::default()
        }
    }

    fn spec() -> ClusterComponentSpec {
        ClusterComponentSpec {
            name: "mysql".to_owned(),
            replicas: 3,
            resources: Some(cpu("1")),
            instances: vec![InstanceTemplate {
                name: "big".to_owned(),
                resources: Some(cpu("2")),
                ..InstanceTemplate::default()
            }],
            ..ClusterComponentSpec::default()
        }
    }

    #[test]
    fn resources_are_applied_to_component_and_templates() {
        let mut spec = spec();
        let scaling = VerticalScaling {
            component_name: "mysql".to_owned(),
            resources: Some(cpu("2")),
            instances: vec![InstanceResourceTemplate {
                name: "big".to_owned(),
                resources: cpu("4"),
            }],
        };
        apply_resources(&mut spec, &scaling).unwrap();
        assert_eq!(spec.resources, Some(cpu("2")));
        assert_eq!(spec.instances[0].resources, Some(cpu("4")));

        let unknown = VerticalScaling {
            instances: vec![InstanceResourceTemplate {
                name: "small".to_owned(),
                resources: cpu("1"),
            }],
            ..scaling
        };
        assert!(apply_resources(&mut spec, &unknown).is_err());
    }

    #[test]
    fn unchanged_resources_need_no_restart() {
        let spec = spec();
        let last = LastComponentConfiguration {
            replicas: spec.replicas,
            resources: spec.resources.clone(),
            instances: spec.instances.clone(),
            ..LastComponentConfiguration::default()
        };
        let same = VerticalScaling {
            component_name: "mysql".to_owned(),
            resources: Some(cpu("1")),
            instances: Vec::new(),
        };
        assert!(resources_unchanged(&last, &same));

        let changed = VerticalScaling {
            resources: Some(cpu("2")),
            ..same
        };
        assert!(!resources_unchanged(&last, &changed));
    }
}

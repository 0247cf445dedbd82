//! Enables or disables services of a component, or of the cluster if no component is named.
//!
//! The service objects themselves are created by the component layer. A service counts as
//! exposed once its object exists and, for `LoadBalancer` services, got an ingress assigned.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tracing::info;

use crate::{
    crd::{
        cluster::{Cluster, ClusterComponentService},
        ops_request::{
            Expose, ExposeSwitch, LastComponentConfiguration, Operation, OpsCondition, OpsPhase,
            OpsRequest, OpsType, ProgressDetail, ProgressStatus,
        },
    },
    operations::{
        EXPOSE_REQUEUE_AFTER, OpsContext, OpsHandler, OpsResource,
        component_ops::{ProgressTally, finish_component_progress, validate_component_names},
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::{find_progress_detail, set_progress_detail},
    },
    validation,
};

pub struct ExposeHandler;

fn payloads(ops: &OpsRequest) -> Result<&[Expose]> {
    match &ops.spec.operation {
        Operation::Expose { expose } => Ok(expose),
        other => unexpected_operation(other.ops_type(), OpsType::Expose),
    }
}

/// Name of the service object backing `service`.
pub(crate) fn service_object_name(cluster_name: &str, component_name: &str, service: &str) -> String {
    if component_name.is_empty() {
        format!("{cluster_name}-{service}")
    } else {
        format!("{cluster_name}-{component_name}-{service}")
    }
}

/// The key progress of `expose` is recorded under, the cluster name for cluster services.
fn status_key<'a>(res: &'a OpsResource, expose: &'a Expose) -> &'a str {
    if expose.component_name.is_empty() {
        res.cluster_name()
    } else {
        &expose.component_name
    }
}

fn services_mut<'a>(
    cluster: &'a mut Cluster,
    component_name: &str,
) -> Option<&'a mut Vec<ClusterComponentService>> {
    if component_name.is_empty() {
        return Some(&mut cluster.spec.services);
    }
    if let Some(spec) = cluster
        .spec
        .component_specs
        .iter_mut()
        .find(|spec| spec.name == component_name)
    {
        return Some(&mut spec.services);
    }
    cluster
        .spec
        .shardings
        .iter_mut()
        .find(|sharding| sharding.name == component_name)
        .map(|sharding| &mut sharding.template.services)
}

fn services<'a>(cluster: &'a Cluster, component_name: &str) -> Option<&'a [ClusterComponentService]> {
    if component_name.is_empty() {
        return Some(&cluster.spec.services);
    }
    cluster
        .component_spec(component_name)
        .map(|spec| spec.services.as_slice())
}

/// Adds or removes the services of `expose`. Returns whether anything changed.
fn apply_expose(services: &mut Vec<ClusterComponentService>, expose: &Expose) -> bool {
    let before = services.clone();
    match expose.switch {
        ExposeSwitch::Enable => {
            for service in &expose.services {
                match services.iter_mut().find(|existing| existing.name == service.name) {
                    Some(existing) => existing.clone_from(service),
                    None => services.push(service.clone()),
                }
            }
        }
        ExposeSwitch::Disable => {
            services.retain(|existing| {
                !expose
                    .services
                    .iter()
                    .any(|service| service.name == existing.name)
            });
        }
    }
    *services != before
}

fn past_tense(switch: ExposeSwitch) -> &'static str {
    match switch {
        ExposeSwitch::Enable => "enabled",
        ExposeSwitch::Disable => "disabled",
    }
}

/// Whether the service object reached the state `switch` asks for.
fn service_ready(switch: ExposeSwitch, spec: &ClusterComponentService, object: Option<&Service>) -> bool {
    match (switch, object) {
        (ExposeSwitch::Disable, object) => object.is_none(),
        (ExposeSwitch::Enable, None) => false,
        (ExposeSwitch::Enable, Some(_)) if !spec.is_load_balancer() => true,
        (ExposeSwitch::Enable, Some(object)) => object
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|load_balancer| load_balancer.ingress.as_ref())
            .is_some_and(|ingress| !ingress.is_empty()),
    }
}

#[async_trait]
impl OpsHandler for ExposeHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads
                .iter()
                .map(|expose| expose.component_name.as_str())
                .filter(|name| !name.is_empty()),
        )?;

        let mut errors = validation::Errors::default();
        for expose in payloads {
            if expose.services.is_empty() {
                return fatal(format!(
                    "no services given to {} for component {:?}",
                    expose.switch, expose.component_name
                ));
            }
            for service in &expose.services {
                errors.collect("services.name", validation::is_rfc_1123_label(&service.name));
            }
        }
        Ok(errors.into_result()?)
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        Ok(conditions::progressing(
            "ExposeStarted",
            format!("Start to expose the services in Cluster: {}", res.cluster_name()),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        let mut snapshots = Vec::new();
        for expose in payloads(&res.ops)? {
            let Some(current) = services(&res.cluster, &expose.component_name) else {
                continue;
            };
            let replicas = res
                .cluster
                .component_spec(&expose.component_name)
                .map(|spec| spec.replicas)
                .unwrap_or_default();
            snapshots.push((status_key(res, expose).to_owned(), LastComponentConfiguration {
                replicas,
                services: current.to_vec(),
                ..LastComponentConfiguration::default()
            }));
        }
        res.ops
            .status_mut()
            .last_configuration
            .components
            .extend(snapshots);
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let mut changed = false;
        for expose in payloads(&res.ops)? {
            let Some(services) = services_mut(&mut res.cluster, &expose.component_name) else {
                return fatal(format!("component {:?} not found", expose.component_name));
            };
            changed |= apply_expose(services, expose);
        }
        if changed {
            res.cluster = ctx.client.update(&res.cluster).await?;
            info!(
                ops_request = res.ops_name(),
                cluster = res.cluster_name(),
                "updated exposed services"
            );
        }
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let payloads = payloads(&res.ops)?.to_vec();
        let mut tally = ProgressTally::default();
        for expose in &payloads {
            let key = status_key(res, expose).to_owned();
            let previous = res
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(&key))
                .cloned();
            let mut status = previous.clone().unwrap_or_default();
            if !expose.component_name.is_empty() {
                status.phase = res.cluster.component_phase(&expose.component_name);
            }

            let mut expect = 0;
            let mut completed = 0;
            for service in &expose.services {
                let name =
                    service_object_name(res.cluster_name(), &expose.component_name, &service.name);
                let object = ctx.client.get_opt::<Service>(&name, res.namespace()).await?;
                let object_key = format!("Service/{name}");
                let detail = if service_ready(expose.switch, service, object.as_ref()) {
                    ProgressDetail::new(
                        &object_key,
                        ProgressStatus::Succeed,
                        format!("Successfully {} service {name}", past_tense(expose.switch)),
                    )
                } else {
                    ProgressDetail::new(
                        &object_key,
                        ProgressStatus::Processing,
                        format!(
                            "Waiting for service {name} to be {}",
                            past_tense(expose.switch)
                        ),
                    )
                };
                set_progress_detail(&mut status, detail);
                expect += 1;
                completed += i32::from(
                    find_progress_detail(&status, &object_key)
                        .is_some_and(|detail| detail.status.is_completed()),
                );
            }
            tally.add(&key, expect, completed);

            if previous.as_ref() != Some(&status) {
                tally.changed = true;
                res.ops.status_mut().components.insert(key, status);
            }
        }

        let (phase, _) = finish_component_progress(ctx, res, tally).await?;
        Ok((phase, EXPOSE_REQUEUE_AFTER))
    }
}

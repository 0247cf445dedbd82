use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use tracing::info;

use crate::{
    constants::RESTART_ANNOTATION,
    crd::ops_request::{
        LastComponentConfiguration, Operation, OpsCondition, OpsPhase, OpsRequest, OpsType,
        Reconfigure,
    },
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{ComponentOpsSet, reconcile_component_progress, validate_component_names},
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::handle_restart_progress,
    },
};

pub struct ReconfigureHandler;

fn payloads(ops: &OpsRequest) -> Result<&[Reconfigure]> {
    match &ops.spec.operation {
        Operation::Reconfigure { reconfigure } => Ok(reconfigure),
        other => unexpected_operation(other.ops_type(), OpsType::Reconfigure),
    }
}

/// Keys whose value differs between `parameters` and the result of applying `reconfigure`.
fn changed_parameters(parameters: &BTreeMap<String, String>, reconfigure: &Reconfigure) -> BTreeSet<String> {
    reconfigure
        .parameters
        .iter()
        .filter(|parameter| parameters.get(&parameter.key) != parameter.value.as_ref())
        .map(|parameter| parameter.key.clone())
        .collect()
}

fn apply_parameters(parameters: &mut BTreeMap<String, String>, reconfigure: &Reconfigure) {
    for parameter in &reconfigure.parameters {
        match &parameter.value {
            Some(value) => {
                parameters.insert(parameter.key.clone(), value.clone());
            }
            None => {
                parameters.remove(&parameter.key);
            }
        }
    }
}

fn needs_restart(changed: &BTreeSet<String>, static_parameters: &[String]) -> bool {
    static_parameters
        .iter()
        .any(|parameter| changed.contains(parameter))
}

#[async_trait]
impl OpsHandler for ReconfigureHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|reconfigure| reconfigure.component_name.as_str()),
        )?;
        for reconfigure in payloads {
            if reconfigure.parameters.is_empty() {
                return fatal(format!(
                    "no parameters given for component {:?}",
                    reconfigure.component_name
                ));
            }
            let mut keys = BTreeSet::new();
            for parameter in &reconfigure.parameters {
                if parameter.key.is_empty() {
                    return fatal("parameter keys must not be empty");
                }
                if !keys.insert(parameter.key.as_str()) {
                    return fatal(format!("parameter {:?} is given twice", parameter.key));
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
            "ReconfigureStarted",
            format!("Start to reconfigure components in Cluster: {}", res.cluster_name()),
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
                parameters: spec.parameters.clone(),
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?.to_vec();
        let mut restarted = BTreeSet::new();
        for reconfigure in &payloads {
            let Some(last) = res.ops.last_component_configuration(&reconfigure.component_name)
            else {
                continue;
            };
            let component = ctx
                .synthesizer
                .synthesize(&res.cluster, &reconfigure.component_name)
                .await?;
            if needs_restart(
                &changed_parameters(&last.parameters, reconfigure),
                &component.static_parameters,
            ) {
                restarted.insert(reconfigure.component_name.clone());
            }
        }

        let restart_value = res
            .ops
            .start_timestamp()
            .map(|started| started.to_string())
            .unwrap_or_default();
        let set = ComponentOpsSet::new(&payloads);
        set.update_components_and_shardings(&mut res.cluster, |spec, reconfigure| {
            apply_parameters(&mut spec.parameters, reconfigure);
            if restarted.contains(&reconfigure.component_name) {
                spec.annotations
                    .insert(RESTART_ANNOTATION.to_owned(), restart_value.clone());
            }
            Ok(())
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            restarted = ?restarted,
            "updated component parameters"
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
        reconcile_component_progress(ctx, res, &mut resources, |res, resource, status| {
            let changed = res
                .ops
                .last_component_configuration(&resource.component_name)
                .map(|last| changed_parameters(&last.parameters, &resource.payload))
                .unwrap_or_default();
            if !needs_restart(&changed, &resource.synthesized.static_parameters) {
                resource.no_wait_component_completed = true;
                return Ok((0, 0));
            }
            handle_restart_progress(res, resource, status)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::crd::ops_request::ParameterPair;

    fn reconfigure(parameters: &[(&str, Option<&str>)]) -> Reconfigure {
        Reconfigure {
            component_name: "mysql".to_owned(),
            parameters: parameters
                .iter()
                .map(|(key, value)| ParameterPair {
                    key: (*key).to_owned(),
                    value: value.map(str::to_owned),
                })
                .collect(),
        }
    }

    fn current() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("max_connections".to_owned(), "100".to_owned()),
            ("innodb_buffer_pool_size".to_owned(), "1G".to_owned()),
        ])
    }

    #[test]
    fn unset_values_remove_parameters() {
        let mut parameters = current();
        apply_parameters(
            &mut parameters,
            &reconfigure(&[("max_connections", Some("200")), ("innodb_buffer_pool_size", None)]),
        );
        assert_eq!(
            parameters,
            BTreeMap::from([("max_connections".to_owned(), "200".to_owned())])
        );
    }

    #[rstest]
    #[case::dynamic_change(&[("max_connections", Some("200"))], false)]
    #[case::static_change(&[("innodb_buffer_pool_size", Some("2G"))], true)]
    #[case::static_removal(&[("innodb_buffer_pool_size", None)], true)]
    #[case::static_unchanged(&[("innodb_buffer_pool_size", Some("1G"))], false)]
    fn restart_only_for_changed_static_parameters(
        #[case] parameters: &[(&str, Option<&str>)],
        #[case] restart: bool,
    ) {
        let changed = changed_parameters(&current(), &reconfigure(parameters));
        assert_eq!(
            needs_restart(&changed, &["innodb_buffer_pool_size".to_owned()]),
            restart
        );
    }
}

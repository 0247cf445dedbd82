//! Runs the actions of an [`OpsDefinition`] against components of a cluster.
//!
//! Actions run one after another for every targeted component (every member, for shardings).
//! Each action gets its own progress detail. A failed action either stops the remaining actions
//! of that component or is recorded as ignored, depending on its failure policy.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use tracing::info;

use crate::{
    collaborators::{self, ActionStatus, CustomActionRequest},
    crd::{
        ops_definition::{FailurePolicy, OpsAction, OpsDefinition},
        ops_request::{
            CustomOps, CustomOpsComponent, LastComponentConfiguration, Operation, OpsCondition,
            OpsPhase, OpsRequest, OpsRequestComponentStatus, OpsType, ProgressDetail,
            ProgressStatus,
        },
    },
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{
            ComponentOpsSet, ProgressResource, ProgressTally, finish_component_progress,
            validate_component_names,
        },
        conditions,
        error::{Result, fatal, unexpected_operation},
        progress::{find_progress_detail, set_progress_detail},
    },
};

pub struct CustomOpsHandler;

fn custom_ops(ops: &OpsRequest) -> Result<&CustomOps> {
    match &ops.spec.operation {
        Operation::Custom { custom } => Ok(custom),
        other => unexpected_operation(other.ops_type(), OpsType::Custom),
    }
}

fn ops_definition<'a>(res: &'a OpsResource) -> Result<&'a OpsDefinition> {
    let custom = custom_ops(&res.ops)?;
    match &res.ops_definition {
        Some(definition) => Ok(definition),
        None => fatal(format!(
            "OpsDefinition {:?} not found",
            custom.ops_definition_name
        )),
    }
}

fn action_object_key(full_component_name: &str, action_name: &str) -> String {
    format!("{full_component_name}/{action_name}")
}

fn validate_parameters(definition: &OpsDefinition, component: &CustomOpsComponent) -> Result<()> {
    let mut given = BTreeSet::new();
    for parameter in &component.parameters {
        if !given.insert(parameter.name.as_str()) {
            return fatal(format!(
                "parameter {:?} is given twice for component {:?}",
                parameter.name, component.component_name
            ));
        }
        if !definition
            .spec
            .parameters
            .iter()
            .any(|declared| declared.name == parameter.name)
        {
            return fatal(format!(
                "parameter {:?} is not declared by the OpsDefinition",
                parameter.name
            ));
        }
    }
    for declared in &definition.spec.parameters {
        if declared.required && !given.contains(declared.name.as_str()) {
            return fatal(format!(
                "required parameter {:?} is missing for component {:?}",
                declared.name, component.component_name
            ));
        }
    }
    Ok(())
}

/// What to do about the action following a completed one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NextStep {
    Continue,
    Wait,
    SkipRemaining,
}

fn next_step(action: &OpsAction, detail: Option<&ProgressDetail>) -> NextStep {
    match detail.map(|detail| detail.status) {
        Some(ProgressStatus::Succeed) => NextStep::Continue,
        Some(ProgressStatus::Failed) => match action.failure_policy {
            FailurePolicy::Ignore => NextStep::Continue,
            FailurePolicy::Fail => NextStep::SkipRemaining,
        },
        Some(ProgressStatus::Pending | ProgressStatus::Processing) | None => NextStep::Wait,
    }
}

async fn run_action(
    ctx: &OpsContext,
    res: &OpsResource,
    resource: &ProgressResource<CustomOpsComponent>,
    action: &OpsAction,
) -> Result<ProgressDetail> {
    let request = CustomActionRequest {
        ops_request_name: res.ops_name().to_owned(),
        component: resource.synthesized.clone(),
        action: action.clone(),
        parameters: resource.payload.parameters.clone(),
    };
    let status = match ctx.lifecycle.run_custom_action(&request).await {
        Ok(status) => status,
        Err(
            error @ (collaborators::Error::NotFound { .. }
            | collaborators::Error::ActionFailed { .. }),
        ) => ActionStatus::Failed(error.to_string()),
        Err(error) => return Err(error.into()),
    };

    let object_key = action_object_key(&resource.full_component_name, &action.name);
    let detail = match status {
        ActionStatus::Running => ProgressDetail::new(
            object_key,
            ProgressStatus::Processing,
            format!("Processing action {}", action.name),
        ),
        ActionStatus::Succeed => ProgressDetail::new(
            object_key,
            ProgressStatus::Succeed,
            format!("Successfully executed action {}", action.name),
        ),
        ActionStatus::Failed(message) => match action.failure_policy {
            FailurePolicy::Fail => ProgressDetail::new(
                object_key,
                ProgressStatus::Failed,
                format!("Action {} failed: {message}", action.name),
            ),
            FailurePolicy::Ignore => ProgressDetail::new(
                object_key,
                ProgressStatus::Succeed,
                format!("Ignored failure of action {}: {message}", action.name),
            ),
        },
    };
    Ok(ProgressDetail {
        action_name: Some(action.name.clone()),
        ..detail.with_group(Some(resource.full_component_name.clone()))
    })
}

/// Advances the actions of one component as far as possible. Returns the expected and
/// completed number of actions.
async fn reconcile_component_actions(
    ctx: &OpsContext,
    res: &OpsResource,
    resource: &ProgressResource<CustomOpsComponent>,
    actions: &[OpsAction],
    status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let mut skipped_by = None;
    for action in actions {
        let object_key = action_object_key(&resource.full_component_name, &action.name);
        if let Some(failed) = &skipped_by {
            set_progress_detail(
                status,
                ProgressDetail {
                    action_name: Some(action.name.clone()),
                    ..ProgressDetail::new(
                        &object_key,
                        ProgressStatus::Failed,
                        format!("Skipped, action {failed} failed"),
                    )
                    .with_group(Some(resource.full_component_name.clone()))
                },
            );
            continue;
        }

        if !find_progress_detail(status, &object_key)
            .is_some_and(|detail| detail.status.is_completed())
        {
            let detail = run_action(ctx, res, resource, action).await?;
            set_progress_detail(status, detail);
        }
        match next_step(action, find_progress_detail(status, &object_key)) {
            NextStep::Continue => {}
            NextStep::Wait => break,
            NextStep::SkipRemaining => skipped_by = Some(action.name.clone()),
        }
    }

    let completed = actions
        .iter()
        .filter(|action| {
            find_progress_detail(
                status,
                &action_object_key(&resource.full_component_name, &action.name),
            )
            .is_some_and(|detail| detail.status.is_completed())
        })
        .count();
    Ok((
        i32::try_from(actions.len()).unwrap_or(i32::MAX),
        i32::try_from(completed).unwrap_or(i32::MAX),
    ))
}

#[async_trait]
impl OpsHandler for CustomOpsHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let custom = custom_ops(&res.ops)?;
        let definition = ops_definition(res)?;
        if definition.spec.actions.is_empty() {
            return fatal(format!(
                "OpsDefinition {:?} does not define any actions",
                custom.ops_definition_name
            ));
        }
        validate_component_names(
            &res.cluster,
            custom
                .components
                .iter()
                .map(|component| component.component_name.as_str()),
        )?;
        for component in &custom.components {
            validate_parameters(definition, component)?;
        }
        Ok(())
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        let custom = custom_ops(&res.ops)?;
        Ok(conditions::progressing(
            "CustomOperationStarted",
            format!(
                "Start to handle {} on the Cluster: {}",
                custom.ops_definition_name,
                res.cluster_name()
            ),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        let set = ComponentOpsSet::new(&custom_ops(&res.ops)?.components);
        set.save_last_configurations(&mut res.ops, &res.cluster, |spec, _| {
            LastComponentConfiguration {
                replicas: spec.replicas,
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, _ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let definition = ops_definition(res)?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            actions = definition.spec.actions.len(),
            "running custom operation"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let actions = ops_definition(res)?.spec.actions.clone();
        let set = ComponentOpsSet::new(&custom_ops(&res.ops)?.components);
        let resources = set.build_progress_resources(ctx, res).await?;

        let mut tally = ProgressTally::default();
        for resource in &resources {
            let previous = res
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(&resource.component_name))
                .cloned();
            let mut status = previous.clone().unwrap_or_default();
            if !resource.is_sharding {
                status.phase = res.cluster.component_phase(&resource.full_component_name);
            }

            let (expect, completed) =
                reconcile_component_actions(ctx, res, resource, &actions, &mut status).await?;
            tally.add(&resource.component_name, expect, completed);

            if previous.as_ref() != Some(&status) {
                tally.changed = true;
                res.ops
                    .status_mut()
                    .components
                    .insert(resource.component_name.clone(), status);
            }
        }

        finish_component_progress(ctx, res, tally).await
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::crd::ops_request::CustomParameter;

    fn definition() -> OpsDefinition {
        serde_yaml::from_str(indoc! {"
            apiVersion: operations.stackable.tech/v1alpha1
            kind: OpsDefinition
            metadata:
              name: create-user
              namespace: default
            spec:
              parameters:
                - name: user
                  required: true
                - name: comment
              actions:
                - name: create
                - name: grant
                  failurePolicy: Ignore
        "})
        .expect("valid definition")
    }

    fn component(parameters: &[&str]) -> CustomOpsComponent {
        CustomOpsComponent {
            component_name: "mysql".to_owned(),
            parameters: parameters
                .iter()
                .map(|name| CustomParameter {
                    name: (*name).to_owned(),
                    value: "x".to_owned(),
                })
                .collect(),
        }
    }

    #[rstest]
    #[case::required_only(&["user"], true)]
    #[case::all(&["user", "comment"], true)]
    #[case::missing_required(&["comment"], false)]
    #[case::undeclared(&["user", "password"], false)]
    #[case::duplicate(&["user", "user"], false)]
    fn parameter_validation(#[case] parameters: &[&str], #[case] valid: bool) {
        assert_eq!(
            validate_parameters(&definition(), &component(parameters)).is_ok(),
            valid
        );
    }

    #[rstest]
    #[case::succeeded(FailurePolicy::Fail, Some(ProgressStatus::Succeed), NextStep::Continue)]
    #[case::running(FailurePolicy::Fail, Some(ProgressStatus::Processing), NextStep::Wait)]
    #[case::not_started(FailurePolicy::Fail, None, NextStep::Wait)]
    #[case::failed(FailurePolicy::Fail, Some(ProgressStatus::Failed), NextStep::SkipRemaining)]
    #[case::failed_ignored(FailurePolicy::Ignore, Some(ProgressStatus::Failed), NextStep::Continue)]
    fn steps_after_an_action(
        #[case] failure_policy: FailurePolicy,
        #[case] status: Option<ProgressStatus>,
        #[case] expected: NextStep,
    ) {
        let action = OpsAction {
            name: "create".to_owned(),
            failure_policy,
        };
        let detail = status.map(|status| ProgressDetail::new("mysql/create", status, ""));
        assert_eq!(next_step(&action, detail.as_ref()), expected);
    }
}

//! Moves leadership of a component to another pod through the switchover lifecycle action.
//!
//! The leaders at the start of the request are recorded as JSON in the started condition. A
//! component completes once the candidate, or any pod other than the old leader, holds the
//! leader role.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tracing::info;

use crate::{
    collaborators::SynthesizedComponent,
    crd::ops_request::{
        LastComponentConfiguration, Operation, OpsCondition, OpsConditionType, OpsPhase,
        OpsRequest, OpsRequestComponentStatus, OpsType, ProgressDetail, ProgressStatus, Switchover,
    },
    operations::{
        OpsContext, OpsHandler, OpsResource, SWITCHOVER_REQUEUE_AFTER,
        component_ops::{
            ComponentOpsSet, ProgressTally, finish_component_progress, list_component_pods,
            validate_component_names,
        },
        conditions,
        error::{EncodeJsonSnafu, Result, fatal, unexpected_operation},
        progress::{find_progress_detail, find_pod, pod_role, set_progress_detail},
    },
};

pub struct SwitchoverHandler;

const REASON_SWITCHOVER_STARTED: &str = "SwitchoverStarted";
const REASON_SKIP_SWITCHOVER: &str = "SkipSwitchover";

fn payloads(ops: &OpsRequest) -> Result<&[Switchover]> {
    match &ops.spec.operation {
        Operation::Switchover { switchover } => Ok(switchover),
        other => unexpected_operation(other.ops_type(), OpsType::Switchover),
    }
}

/// What the started condition records per component.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchoverMessage {
    #[serde(flatten)]
    switchover: Switchover,
    old_leader: String,
    cluster: String,
}

fn switchover_object_key(component_name: &str) -> String {
    format!("switchover/{component_name}")
}

/// The pod currently holding the leader role of the component.
fn leader_pod<'a>(component: &SynthesizedComponent, pods: &'a [Pod]) -> Option<&'a Pod> {
    let leader_role = component.leader_role()?;
    pods.iter().find(|pod| {
        pod.metadata.deletion_timestamp.is_none() && pod_role(pod) == Some(leader_role.name.as_str())
    })
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// The leaders recorded when the request started, keyed by component.
fn recorded_leaders(ops: &OpsRequest) -> BTreeMap<String, SwitchoverMessage> {
    ops.status
        .as_ref()
        .and_then(|status| status.condition(OpsConditionType::Progressing))
        .filter(|condition| condition.reason.as_deref() == Some(REASON_SWITCHOVER_STARTED))
        .and_then(|condition| condition.message.as_deref())
        .and_then(|message| serde_json::from_str(message).ok())
        .unwrap_or_default()
}

async fn synthesize_with_pods(
    ctx: &OpsContext,
    res: &OpsResource,
    component_name: &str,
) -> Result<(SynthesizedComponent, Vec<Pod>)> {
    let component = ctx
        .synthesizer
        .synthesize(&res.cluster, component_name)
        .await?;
    let pods = list_component_pods(ctx, res, component_name).await?;
    Ok((component, pods))
}

/// Whether the switchover of `component_name` completed, judged by the current leader.
fn switchover_completed(
    switchover: &Switchover,
    old_leader: Option<&str>,
    current_leader: Option<&str>,
) -> bool {
    match (switchover.candidate(), current_leader) {
        (_, None) => false,
        (Some(candidate), Some(leader)) => candidate == leader,
        (None, Some(leader)) => old_leader != Some(leader),
    }
}

#[async_trait]
impl OpsHandler for SwitchoverHandler {
    async fn validate(&self, ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|switchover| switchover.component_name.as_str()),
        )?;
        for switchover in payloads {
            let (component, pods) =
                synthesize_with_pods(ctx, res, &switchover.component_name).await?;
            if !component.has_switchover_action {
                return fatal(format!(
                    "component {:?} does not support switchover",
                    switchover.component_name
                ));
            }
            if let Some(candidate) = switchover.candidate() {
                if find_pod(&pods, candidate).is_none() {
                    return fatal(format!(
                        "instance {candidate:?} not found in component {:?}",
                        switchover.component_name
                    ));
                }
            }
        }
        Ok(())
    }

    async fn action_started_condition(
        &self,
        ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        let mut messages = BTreeMap::new();
        for switchover in payloads(&res.ops)? {
            let (component, pods) =
                synthesize_with_pods(ctx, res, &switchover.component_name).await?;
            let Some(leader) = leader_pod(&component, &pods) else {
                return fatal(format!(
                    "component {:?} has no pod holding the leader role",
                    switchover.component_name
                ));
            };
            messages.insert(switchover.component_name.clone(), SwitchoverMessage {
                switchover: switchover.clone(),
                old_leader: pod_name(leader).to_owned(),
                cluster: res.cluster_name().to_owned(),
            });
        }
        let message = serde_json::to_string(&messages).context(EncodeJsonSnafu {
            what: "switchover leaders",
        })?;
        Ok(conditions::progressing(REASON_SWITCHOVER_STARTED, message))
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
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?.to_vec();
        let mut changed = false;
        for switchover in &payloads {
            let name = &switchover.component_name;
            let object_key = switchover_object_key(name);
            let previous = res
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(name))
                .cloned();
            let started = previous.as_ref().is_some_and(|status| {
                status.reason.as_deref() == Some(REASON_SKIP_SWITCHOVER)
                    || find_progress_detail(status, &object_key).is_some()
            });
            if started {
                continue;
            }

            let (component, pods) = synthesize_with_pods(ctx, res, name).await?;
            let current_leader = leader_pod(&component, &pods).map(pod_name);
            let mut status = previous.unwrap_or_default();
            status.phase = res.cluster.component_phase(name);
            if switchover.candidate().is_some() && switchover.candidate() == current_leader {
                status.reason = Some(REASON_SKIP_SWITCHOVER.to_owned());
                status.message = Some(format!(
                    "This component {name} is already in the expected state, skip the switchover \
                     operation"
                ));
            } else {
                ctx.lifecycle
                    .switchover(&component, switchover.candidate())
                    .await?;
                set_progress_detail(
                    &mut status,
                    ProgressDetail::new(
                        &object_key,
                        ProgressStatus::Processing,
                        format!("Start to switchover the leader of component {name}"),
                    ),
                );
                info!(
                    ops_request = res.ops_name(),
                    component = %name,
                    candidate = switchover.candidate(),
                    "requested switchover"
                );
            }
            res.ops.status_mut().components.insert(name.clone(), status);
            changed = true;
        }
        if changed {
            res.ops = ctx.client.update_status(&res.ops).await?;
        }
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let payloads = payloads(&res.ops)?.to_vec();
        let leaders = recorded_leaders(&res.ops);
        let mut tally = ProgressTally::default();
        for switchover in &payloads {
            let name = &switchover.component_name;
            let previous = res
                .ops
                .status
                .as_ref()
                .and_then(|status| status.components.get(name))
                .cloned();
            let mut status: OpsRequestComponentStatus = previous.clone().unwrap_or_default();
            if status.reason.as_deref() == Some(REASON_SKIP_SWITCHOVER) {
                tally.add(name, 1, 1);
                continue;
            }

            let (component, pods) = synthesize_with_pods(ctx, res, name).await?;
            let current_leader = leader_pod(&component, &pods).map(pod_name);
            let old_leader = leaders.get(name).map(|message| message.old_leader.as_str());
            let object_key = switchover_object_key(name);
            if switchover_completed(switchover, old_leader, current_leader) {
                set_progress_detail(
                    &mut status,
                    ProgressDetail::new(
                        &object_key,
                        ProgressStatus::Succeed,
                        format!(
                            "Successfully switched the leader of component {name} to {}",
                            current_leader.unwrap_or_default()
                        ),
                    ),
                );
            }
            status.phase = res.cluster.component_phase(name);
            let completed = find_progress_detail(&status, &object_key)
                .is_some_and(|detail| detail.status.is_completed());
            tally.add(name, 1, i32::from(completed));

            if previous.as_ref() != Some(&status) {
                tally.changed = true;
                res.ops.status_mut().components.insert(name.clone(), status);
            }
        }

        let (phase, _) = finish_component_progress(ctx, res, tally).await?;
        Ok((phase, SWITCHOVER_REQUEUE_AFTER))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn switchover(instance_name: &str) -> Switchover {
        Switchover {
            component_name: "mysql".to_owned(),
            instance_name: instance_name.to_owned(),
        }
    }

    #[rstest]
    #[case::candidate_leads("mycluster-mysql-1", Some("mycluster-mysql-1"), true)]
    #[case::candidate_not_yet_leading("mycluster-mysql-1", Some("mycluster-mysql-0"), false)]
    #[case::any_instance_moved("*", Some("mycluster-mysql-2"), true)]
    #[case::any_instance_unchanged("*", Some("mycluster-mysql-0"), false)]
    #[case::no_leader("*", None, false)]
    fn completion(
        #[case] instance_name: &str,
        #[case] current_leader: Option<&str>,
        #[case] completed: bool,
    ) {
        assert_eq!(
            switchover_completed(
                &switchover(instance_name),
                Some("mycluster-mysql-0"),
                current_leader
            ),
            completed
        );
    }

    #[test]
    fn leaders_are_read_back_from_the_started_condition() {
        let messages = BTreeMap::from([("mysql".to_owned(), SwitchoverMessage {
            switchover: switchover("*"),
            old_leader: "mycluster-mysql-0".to_owned(),
            cluster: "mycluster".to_owned(),
        })]);
        let mut ops = OpsRequest::new("switchover", crate::crd::ops_request::OpsRequestSpec {
            cluster_name: "mycluster".to_owned(),
            operation: Operation::Switchover {
                switchover: vec![switchover("*")],
            },
            force: false,
            cancel: false,
            depends_on: None,
            timeout_seconds: None,
            pre_condition_deadline_seconds: None,
            ttl_seconds_after_succeed: None,
            ttl_seconds_after_unsuccessful_completion: None,
        });
        ops.status_mut().set_condition(conditions::progressing(
            REASON_SWITCHOVER_STARTED,
            serde_json::to_string(&messages).unwrap(),
        ));

        assert_eq!(recorded_leaders(&ops), messages);
    }
}

//! The per-object progress ledger in `status.components[*].progressDetails`.
//!
//! Details only ever move forward: a completed detail is never changed again and a detail that
//! started processing never goes back to pending.

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time};

use crate::{
    collaborators::SynthesizedComponent,
    constants::{IGNORE_ROLE_CHECK_ANNOTATION, ROLE_LABEL},
    crd::{
        cluster::Cluster,
        now,
        ops_request::{OpsRequest, OpsRequestComponentStatus, ProgressDetail, ProgressStatus},
    },
    instance,
    operations::{OpsResource, component_ops::ProgressResource, error::Result},
};

pub fn pod_object_key(pod_name: &str) -> String {
    format!("Pod/{pod_name}")
}

pub fn pvc_object_key(pvc_name: &str) -> String {
    format!("PersistentVolumeClaim/{pvc_name}")
}

impl ProgressDetail {
    pub fn new(object_key: impl Into<String>, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            object_key: object_key.into(),
            status,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_group(self, group: Option<String>) -> Self {
        Self { group, ..self }
    }
}

pub fn find_progress_detail<'a>(
    component_status: &'a OpsRequestComponentStatus,
    object_key: &str,
) -> Option<&'a ProgressDetail> {
    component_status
        .progress_details
        .iter()
        .find(|detail| detail.object_key == object_key)
}

/// Records `detail`, merging it into an existing detail of the same object key.
///
/// Returns whether the ledger changed.
pub fn set_progress_detail(
    component_status: &mut OpsRequestComponentStatus,
    mut detail: ProgressDetail,
) -> bool {
    let details = &mut component_status.progress_details;
    let Some(existing) = details
        .iter_mut()
        .find(|existing| existing.object_key == detail.object_key)
    else {
        stamp_times(&mut detail, None);
        details.push(detail);
        return true;
    };

    if existing.status.is_completed()
        || (existing.status == ProgressStatus::Processing
            && detail.status == ProgressStatus::Pending)
    {
        return false;
    }
    if existing.status == detail.status
        && existing.message == detail.message
        && existing.group == detail.group
    {
        return false;
    }

    stamp_times(&mut detail, Some(existing));
    *existing = detail;
    true
}

fn stamp_times(detail: &mut ProgressDetail, previous: Option<&ProgressDetail>) {
    detail.start_time = previous.and_then(|previous| previous.start_time.clone());
    detail.end_time = None;
    match detail.status {
        ProgressStatus::Pending => {}
        ProgressStatus::Processing => {
            detail.start_time.get_or_insert_with(now);
        }
        ProgressStatus::Succeed | ProgressStatus::Failed => {
            detail.start_time.get_or_insert_with(now);
            detail.end_time = Some(now());
        }
    }
}

/// Whether any detail of any component failed.
pub fn has_failed_details(ops: &OpsRequest) -> bool {
    ops.status.iter().flat_map(|status| status.components.values()).any(|component| {
        component
            .progress_details
            .iter()
            .any(|detail| detail.status == ProgressStatus::Failed)
    })
}

/// A pod is available once it has been ready for at least `min_ready_seconds` and is not being
/// deleted.
pub fn pod_is_available(pod: &Pod, min_ready_seconds: i32) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .into_iter()
        .flatten()
        .find(|condition| condition.type_ == "Ready")
        .is_some_and(|condition| {
            condition.status == "True"
                && match &condition.last_transition_time {
                    Some(Time(ready_since)) => {
                        Timestamp::now().duration_since(*ready_since)
                            >= SignedDuration::from_secs(min_ready_seconds.into())
                    }
                    None => min_ready_seconds <= 0,
                }
        })
}

pub fn pod_role(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ROLE_LABEL))
        .map(String::as_str)
}

/// Available, and holding a role if the component defines any.
pub fn pod_is_up(ops: &OpsRequest, component: &SynthesizedComponent, pod: &Pod) -> bool {
    if !pod_is_available(pod, component.min_ready_seconds) {
        return false;
    }
    let ignore_role_check = ops
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(IGNORE_ROLE_CHECK_ANNOTATION));
    component.roles.is_empty() || ignore_role_check || pod_role(pod).is_some()
}

/// The reason a pod is considered failed, if it is.
pub fn pod_failure(cluster: &Cluster, full_component_name: &str, pod: &Pod) -> Option<String> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let component_failed = cluster
        .component_phase(full_component_name)
        .is_some_and(|phase| phase.is_failed_or_abnormal());
    if !component_failed {
        return None;
    }
    let message = cluster
        .component_status(full_component_name)
        .and_then(|status| status.message.get(&pod_object_key(pod_name)))
        .cloned();
    let pod_failed = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Failed");
    match message {
        Some(message) => Some(message),
        None if pod_failed => Some(format!("pod {pod_name} failed")),
        None => None,
    }
}

pub fn find_pod<'a>(pods: &'a [Pod], name: &str) -> Option<&'a Pod> {
    pods.iter()
        .find(|pod| pod.metadata.name.as_deref() == Some(name))
}

fn group<T>(resource: &ProgressResource<T>) -> Option<String> {
    resource
        .is_sharding
        .then(|| resource.full_component_name.clone())
}

/// Tracks the pods created and deleted by a scaling operation.
///
/// Returns the expected and completed number of pods.
pub fn handle_scale_progress<T>(
    res: &OpsResource,
    resource: &ProgressResource<T>,
    component_status: &mut OpsRequestComponentStatus,
) -> (i32, i32) {
    let mut expect = 0;
    let mut completed = 0;

    for pod_name in resource.created_pods.keys() {
        let object_key = pod_object_key(pod_name);
        let detail = match find_pod(&resource.pods, pod_name) {
            Some(pod) if pod_is_up(&res.ops, &resource.synthesized, pod) => ProgressDetail::new(
                object_key,
                ProgressStatus::Succeed,
                format!("Successfully created: {}", pod_object_key(pod_name)),
            ),
            Some(pod) => match pod_failure(&res.cluster, &resource.full_component_name, pod) {
                Some(failure) => ProgressDetail::new(
                    object_key,
                    ProgressStatus::Failed,
                    format!("Failed to create: {}, {failure}", pod_object_key(pod_name)),
                ),
                None => ProgressDetail::new(
                    object_key,
                    ProgressStatus::Processing,
                    format!("Start to create: {}", pod_object_key(pod_name)),
                ),
            },
            None => ProgressDetail::new(
                object_key,
                ProgressStatus::Processing,
                format!("Start to create: {}", pod_object_key(pod_name)),
            ),
        };
        expect += 1;
        completed += record(component_status, detail.with_group(group(resource)));
    }

    for pod_name in resource.deleted_pods.keys() {
        let object_key = pod_object_key(pod_name);
        let detail = if find_pod(&resource.pods, pod_name).is_some() {
            ProgressDetail::new(
                object_key,
                ProgressStatus::Processing,
                format!("Start to delete: {}", pod_object_key(pod_name)),
            )
        } else {
            ProgressDetail::new(
                object_key,
                ProgressStatus::Succeed,
                format!("Successfully deleted: {}", pod_object_key(pod_name)),
            )
        };
        expect += 1;
        completed += record(component_status, detail.with_group(group(resource)));
    }

    (expect, completed)
}

/// Tracks pods which have to be recreated after the request started, e.g. by a restart.
///
/// Returns the expected and completed number of pods.
pub fn handle_restart_progress<T>(
    res: &OpsResource,
    resource: &ProgressResource<T>,
    component_status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let pod_names = instance::generate_pod_names(
        res.cluster_name(),
        &resource.full_component_name,
        resource.spec.replicas,
        &resource.spec.instances,
        &resource.spec.offline_instances,
    )?;
    let started_at = res.ops.start_timestamp();

    let mut expect = 0;
    let mut completed = 0;
    for pod_name in &pod_names {
        let object_key = pod_object_key(pod_name);
        let pod = find_pod(&resource.pods, pod_name);
        let created_at = pod
            .and_then(|pod| pod.metadata.creation_timestamp.as_ref())
            .map(|time| time.0);
        let recreated = match (created_at, started_at) {
            (Some(created_at), Some(started_at)) => created_at >= started_at,
            _ => false,
        };

        let detail = match pod {
            Some(pod) if recreated && pod_is_up(&res.ops, &resource.synthesized, pod) => {
                ProgressDetail::new(
                    object_key,
                    ProgressStatus::Succeed,
                    format!("Successfully restarted: {}", pod_object_key(pod_name)),
                )
            }
            Some(pod) if !recreated && pod.metadata.deletion_timestamp.is_none() => {
                ProgressDetail::new(
                    object_key,
                    ProgressStatus::Pending,
                    format!("Waiting to restart: {}", pod_object_key(pod_name)),
                )
            }
            Some(pod) => match pod_failure(&res.cluster, &resource.full_component_name, pod) {
                Some(failure) => ProgressDetail::new(
                    object_key,
                    ProgressStatus::Failed,
                    format!("Failed to restart: {}, {failure}", pod_object_key(pod_name)),
                ),
                None => ProgressDetail::new(
                    object_key,
                    ProgressStatus::Processing,
                    format!("Start to restart: {}", pod_object_key(pod_name)),
                ),
            },
            None => ProgressDetail::new(
                object_key,
                ProgressStatus::Processing,
                format!("Start to restart: {}", pod_object_key(pod_name)),
            ),
        };
        expect += 1;
        completed += record(component_status, detail.with_group(group(resource)));
    }
    Ok((expect, completed))
}

/// Records `detail` and returns 1 if the object it describes is completed.
fn record(component_status: &mut OpsRequestComponentStatus, detail: ProgressDetail) -> i32 {
    let object_key = detail.object_key.clone();
    set_progress_detail(component_status, detail);
    i32::from(
        find_progress_detail(component_status, &object_key)
            .is_some_and(|detail| detail.status.is_completed()),
    )
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use super::*;

    fn ready_pod(ready_for: SignedDuration) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("mycluster-mysql-0".to_owned()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: "True".to_owned(),
                    last_transition_time: Some(Time(Timestamp::now() - ready_for)),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[rstest]
    #[case::ready_long_enough(SignedDuration::from_secs(60), 10, true)]
    #[case::not_ready_long_enough(SignedDuration::from_secs(5), 10, false)]
    #[case::no_min_ready_seconds(SignedDuration::ZERO, 0, true)]
    fn pod_availability(
        #[case] ready_for: SignedDuration,
        #[case] min_ready_seconds: i32,
        #[case] available: bool,
    ) {
        assert_eq!(
            pod_is_available(&ready_pod(ready_for), min_ready_seconds),
            available
        );
    }

    #[test]
    fn deleting_pods_are_not_available() {
        let mut pod = ready_pod(SignedDuration::from_secs(60));
        pod.metadata.deletion_timestamp = Some(now());
        assert!(!pod_is_available(&pod, 0));
    }

    #[test]
    fn progress_details_only_move_forward() {
        let mut status = OpsRequestComponentStatus::default();
        let key = pod_object_key("mycluster-mysql-0");

        assert!(set_progress_detail(
            &mut status,
            ProgressDetail::new(&key, ProgressStatus::Processing, "start")
        ));
        let started = find_progress_detail(&status, &key)
            .and_then(|detail| detail.start_time.clone());
        assert!(started.is_some());

        assert!(!set_progress_detail(
            &mut status,
            ProgressDetail::new(&key, ProgressStatus::Pending, "again")
        ));

        assert!(set_progress_detail(
            &mut status,
            ProgressDetail::new(&key, ProgressStatus::Succeed, "done")
        ));
        let detail = find_progress_detail(&status, &key).unwrap();
        assert_eq!(detail.status, ProgressStatus::Succeed);
        assert_eq!(detail.start_time, started);
        assert!(detail.end_time.is_some());

        assert!(!set_progress_detail(
            &mut status,
            ProgressDetail::new(&key, ProgressStatus::Failed, "late")
        ));
        assert_eq!(status.progress_details.len(), 1);
        assert_eq!(
            find_progress_detail(&status, &key).unwrap().status,
            ProgressStatus::Succeed
        );
    }
}

//! Expands the persistent volumes of a component.
//!
//! The new size is written into the volume claim templates of the component, or of one of its
//! instance templates. Resizing the claims is left to the workload layer and the storage
//! provider, progress is tracked per claim and grouped by volume claim template.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::PersistentVolumeClaim,
    apimachinery::pkg::api::resource::Quantity as K8sQuantity,
};
use snafu::ResultExt as _;
use tracing::info;

use crate::{
    constants::{APP_INSTANCE_LABEL, COMPONENT_LABEL},
    crd::{
        cluster::{ClusterComponentSpec, ClusterComponentVolumeClaimTemplate, InstanceTemplate},
        ops_request::{
            LastComponentConfiguration, Operation, OpsCondition, OpsPhase, OpsRequest,
            OpsRequestComponentStatus, OpsType, ProgressDetail, ProgressStatus, VolumeExpansion,
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
        error::{ParseQuantitySnafu, Result, fatal, unexpected_operation},
        progress::{find_progress_detail, pvc_object_key, set_progress_detail},
    },
    quantity,
};

pub struct VolumeExpansionHandler;

const STORAGE: &str = "storage";

fn payloads(ops: &OpsRequest) -> Result<&[VolumeExpansion]> {
    match &ops.spec.operation {
        Operation::VolumeExpansion { volume_expansion } => Ok(volume_expansion),
        other => unexpected_operation(other.ops_type(), OpsType::VolumeExpansion),
    }
}

fn compare_storage(left: &K8sQuantity, right: &K8sQuantity) -> Result<Ordering> {
    quantity::compare(left, right).with_context(|_| ParseQuantitySnafu {
        quantity: format!("{} or {}", left.0, right.0),
    })
}

/// Key of a volume claim template in the snapshot, prefixed with the instance template name for
/// instance level overrides.
fn snapshot_key(template_name: &str, vct_name: &str) -> String {
    if template_name.is_empty() {
        vct_name.to_owned()
    } else {
        format!("{template_name}/{vct_name}")
    }
}

/// Name of the claim backing volume `vct_name` of pod `pod_name`.
fn pvc_name(vct_name: &str, pod_name: &str) -> String {
    format!("{vct_name}-{pod_name}")
}

/// The volume claim template a pod of `template` is created from, the override of the instance
/// template winning over the one of the component.
fn effective_vct<'a>(
    spec: &'a ClusterComponentSpec,
    template: &'a InstanceTemplate,
    vct_name: &str,
) -> Option<&'a ClusterComponentVolumeClaimTemplate> {
    template
        .volume_claim_templates
        .iter()
        .find(|vct| vct.name == vct_name)
        .or_else(|| spec.volume_claim_template(vct_name))
}

/// The requested size of every volume of a pod of `template_name`, keyed by volume claim template.
fn requested_storage<'a>(
    expansion: &'a VolumeExpansion,
    template_name: &str,
) -> BTreeMap<&'a str, &'a K8sQuantity> {
    let mut requested = expansion
        .volume_claim_templates
        .iter()
        .map(|vct| (vct.name.as_str(), &vct.storage))
        .collect::<BTreeMap<_, _>>();
    if let Some(instance) = expansion
        .instances
        .iter()
        .find(|instance| !template_name.is_empty() && instance.name == template_name)
    {
        requested.extend(
            instance
                .volume_claim_templates
                .iter()
                .map(|vct| (vct.name.as_str(), &vct.storage)),
        );
    }
    requested
}

fn ensure_not_shrinking(
    component_name: &str,
    vct_name: &str,
    current: &K8sQuantity,
    requested: &K8sQuantity,
) -> Result<()> {
    if compare_storage(requested, current)? == Ordering::Less {
        return fatal(format!(
            "requested storage {} of volume claim template {vct_name:?} in component \
             {component_name:?} is less than the current storage {}",
            requested.0, current.0
        ));
    }
    Ok(())
}

fn apply_expansion(spec: &mut ClusterComponentSpec, expansion: &VolumeExpansion) -> Result<()> {
    for requested in &expansion.volume_claim_templates {
        let Some(vct) = spec
            .volume_claim_templates
            .iter_mut()
            .find(|vct| vct.name == requested.name)
        else {
            return fatal(format!(
                "volume claim template {:?} not found in component {:?}",
                requested.name, spec.name
            ));
        };
        vct.storage = requested.storage.clone();
    }

    for instance in &expansion.instances {
        for requested in &instance.volume_claim_templates {
            let inherited = spec.volume_claim_template(&requested.name).cloned();
            let Some(template) = spec
                .instances
                .iter_mut()
                .find(|template| template.name == instance.name)
            else {
                return fatal(format!(
                    "instance template {:?} not found in component {:?}",
                    instance.name, spec.name
                ));
            };
            match template
                .volume_claim_templates
                .iter_mut()
                .find(|vct| vct.name == requested.name)
            {
                Some(vct) => vct.storage = requested.storage.clone(),
                None => match inherited {
                    Some(inherited) => template.volume_claim_templates.push(
                        ClusterComponentVolumeClaimTemplate {
                            storage: requested.storage.clone(),
                            ..inherited
                        },
                    ),
                    None => {
                        return fatal(format!(
                            "volume claim template {:?} not found in instance template {:?}",
                            requested.name, instance.name
                        ));
                    }
                },
            }
        }
    }
    Ok(())
}

fn pvc_is_resizing(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.type_ == "Resizing" || condition.type_ == "FileSystemResizePending"
            })
        })
}

/// A claim is expanded once it is bound, requests exactly the new size and reports at least that
/// much capacity.
fn pvc_expanded(pvc: &PersistentVolumeClaim, requested: &K8sQuantity) -> Result<bool> {
    let Some(status) = pvc.status.as_ref() else {
        return Ok(false);
    };
    if status.phase.as_deref() != Some("Bound") {
        return Ok(false);
    }
    let capacity = status
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get(STORAGE));
    let spec_request = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE));
    let (Some(capacity), Some(spec_request)) = (capacity, spec_request) else {
        return Ok(false);
    };
    Ok(compare_storage(capacity, requested)? != Ordering::Less
        && compare_storage(spec_request, requested)? == Ordering::Equal)
}

async fn list_component_pvcs(
    ctx: &OpsContext,
    res: &OpsResource,
    full_component_name: &str,
) -> Result<Vec<PersistentVolumeClaim>> {
    let labels = BTreeMap::from([
        (APP_INSTANCE_LABEL.to_owned(), res.cluster_name().to_owned()),
        (COMPONENT_LABEL.to_owned(), full_component_name.to_owned()),
    ]);
    Ok(ctx.client.list(res.namespace(), &labels).await?)
}

fn handle_expansion_progress(
    res: &OpsResource,
    resource: &ProgressResource<VolumeExpansion>,
    pvcs: &[PersistentVolumeClaim],
    component_status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let pod_names = instance::generate_pod_name_set(
        res.cluster_name(),
        &resource.full_component_name,
        resource.spec.replicas,
        &resource.spec.instances,
        &resource.spec.offline_instances,
    )?;

    let mut expect = 0;
    let mut completed = 0;
    for (pod_name, template_name) in &pod_names {
        for (vct_name, storage) in requested_storage(&resource.payload, template_name) {
            let pvc_name = pvc_name(vct_name, pod_name);
            let object_key = pvc_object_key(&pvc_name);
            let pvc = pvcs
                .iter()
                .find(|pvc| pvc.metadata.name.as_deref() == Some(pvc_name.as_str()));
            let expanded = pvc
                .map(|pvc| pvc_expanded(pvc, storage))
                .transpose()?
                .unwrap_or(false);

            let detail = if expanded {
                ProgressDetail::new(
                    &object_key,
                    ProgressStatus::Succeed,
                    format!(
                        "Successfully expand volume: {object_key} in Component: {}",
                        resource.full_component_name
                    ),
                )
            } else if pvc.is_some_and(pvc_is_resizing) {
                ProgressDetail::new(
                    &object_key,
                    ProgressStatus::Processing,
                    format!(
                        "Start expanding volume: {object_key} in Component: {}",
                        resource.full_component_name
                    ),
                )
            } else {
                ProgressDetail::new(
                    &object_key,
                    ProgressStatus::Pending,
                    format!(
                        "Waiting for an external controller to process the pvc: {object_key} in \
                         Component: {}",
                        resource.full_component_name
                    ),
                )
            };
            set_progress_detail(
                component_status,
                detail.with_group(Some(vct_name.to_owned())),
            );
            expect += 1;
            completed += i32::from(
                find_progress_detail(component_status, &object_key)
                    .is_some_and(|detail| detail.status.is_completed()),
            );
        }
    }
    Ok((expect, completed))
}

#[async_trait]
impl OpsHandler for VolumeExpansionHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        let payloads = payloads(&res.ops)?;
        validate_component_names(
            &res.cluster,
            payloads.iter().map(|expansion| expansion.component_name.as_str()),
        )?;

        for expansion in payloads {
            let name = &expansion.component_name;
            let Some(spec) = res.cluster.component_spec(name) else {
                continue;
            };
            let mut seen = BTreeSet::new();
            for requested in &expansion.volume_claim_templates {
                if !seen.insert(requested.name.as_str()) {
                    return fatal(format!(
                        "volume claim template {:?} is given twice for component {name:?}",
                        requested.name
                    ));
                }
                let Some(current) = spec.volume_claim_template(&requested.name) else {
                    return fatal(format!(
                        "volume claim template {:?} not found in component {name:?}",
                        requested.name
                    ));
                };
                ensure_not_shrinking(name, &requested.name, &current.storage, &requested.storage)?;
            }

            for instance in &expansion.instances {
                let Some(template) = spec.instance_template(&instance.name) else {
                    return fatal(format!(
                        "instance template {:?} not found in component {name:?}",
                        instance.name
                    ));
                };
                for requested in &instance.volume_claim_templates {
                    let Some(current) = effective_vct(spec, template, &requested.name) else {
                        return fatal(format!(
                            "volume claim template {:?} not found in instance template {:?}",
                            requested.name, instance.name
                        ));
                    };
                    ensure_not_shrinking(
                        name,
                        &requested.name,
                        &current.storage,
                        &requested.storage,
                    )?;
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
            "VolumeExpansionStarted",
            format!("Start to expand the volumes in Cluster: {}", res.cluster_name()),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        set.save_last_configurations(&mut res.ops, &res.cluster, |spec, expansion| {
            let mut volume_claim_templates = BTreeMap::new();
            for requested in &expansion.volume_claim_templates {
                if let Some(vct) = spec.volume_claim_template(&requested.name) {
                    volume_claim_templates
                        .insert(snapshot_key("", &vct.name), vct.storage.clone());
                }
            }
            for instance in &expansion.instances {
                let Some(template) = spec.instance_template(&instance.name) else {
                    continue;
                };
                for requested in &instance.volume_claim_templates {
                    if let Some(vct) = effective_vct(spec, template, &requested.name) {
                        volume_claim_templates.insert(
                            snapshot_key(&template.name, &vct.name),
                            vct.storage.clone(),
                        );
                    }
                }
            }
            LastComponentConfiguration {
                replicas: spec.replicas,
                instances: spec.instances.clone(),
                offline_instances: spec.offline_instances.clone(),
                volume_claim_templates,
                ..LastComponentConfiguration::default()
            }
        });
        Ok(())
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        let set = ComponentOpsSet::new(payloads(&res.ops)?);
        set.update_components_and_shardings(&mut res.cluster, apply_expansion)?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "updated volume claim templates"
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
        let mut pvcs = BTreeMap::new();
        for resource in &resources {
            let name = resource.full_component_name.clone();
            pvcs.insert(name, list_component_pvcs(ctx, res, &resource.full_component_name).await?);
        }

        reconcile_component_progress(ctx, res, &mut resources, |res, resource, status| {
            resource.no_wait_component_completed = true;
            let pvcs = pvcs
                .get(&resource.full_component_name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            handle_expansion_progress(res, resource, pvcs, status)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use indoc::{formatdoc, indoc};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimCondition;
    use rstest::rstest;

    use super::*;
    use crate::crd::ops_request::{InstanceVolumeClaimTemplate, OpsRequestVolumeClaimTemplate};

    fn component() -> ClusterComponentSpec {
        serde_yaml::from_str(indoc! {"
            name: mysql
            replicas: 3
            instances:
              - name: big
                volumeClaimTemplates:
                  - name: data
                    storage: 20Gi
              - name: small
            volumeClaimTemplates:
              - name: data
                storage: 10Gi
              - name: log
                storage: 1Gi
        "})
        .expect("valid component")
    }

    fn vct(name: &str, storage: &str) -> OpsRequestVolumeClaimTemplate {
        OpsRequestVolumeClaimTemplate {
            name: name.to_owned(),
            storage: K8sQuantity(storage.to_owned()),
        }
    }

    fn pvc(phase: &str, request: &str, capacity: &str, condition: Option<&str>) -> PersistentVolumeClaim {
        let mut claim: PersistentVolumeClaim = serde_yaml::from_str(&formatdoc! {"
            metadata:
              name: data-mycluster-mysql-0
            spec:
              resources:
                requests:
                  storage: {request}
            status:
              phase: {phase}
              capacity:
                storage: {capacity}
        "})
        .expect("valid claim");
        if let (Some(type_), Some(status)) = (condition, claim.status.as_mut()) {
            status.conditions = Some(vec![PersistentVolumeClaimCondition {
                type_: type_.to_owned(),
                status: "True".to_owned(),
                ..PersistentVolumeClaimCondition::default()
            }]);
        }
        claim
    }

    #[rstest]
    #[case::decimal_request_binary_capacity("Bound", "5G", "5Gi", "5G", true)]
    #[case::exact("Bound", "5Gi", "5Gi", "5Gi", true)]
    #[case::capacity_not_grown("Bound", "5Gi", "1Gi", "5Gi", false)]
    #[case::spec_not_updated("Bound", "1Gi", "5Gi", "5Gi", false)]
    #[case::not_bound("Pending", "5Gi", "5Gi", "5Gi", false)]
    fn expansion_completion(
        #[case] phase: &str,
        #[case] spec_request: &str,
        #[case] capacity: &str,
        #[case] requested: &str,
        #[case] expanded: bool,
    ) {
        let claim = pvc(phase, spec_request, capacity, None);
        assert_eq!(
            pvc_expanded(&claim, &K8sQuantity(requested.to_owned())).unwrap(),
            expanded
        );
    }

    #[test]
    fn resizing_claims_are_detected() {
        assert!(pvc_is_resizing(&pvc("Bound", "5Gi", "1Gi", Some("Resizing"))));
        assert!(pvc_is_resizing(&pvc(
            "Bound",
            "5Gi",
            "1Gi",
            Some("FileSystemResizePending")
        )));
        assert!(!pvc_is_resizing(&pvc("Bound", "5Gi", "1Gi", None)));
    }

    #[test]
    fn instance_overrides_win_over_component_requests() {
        let expansion = VolumeExpansion {
            component_name: "mysql".to_owned(),
            volume_claim_templates: vec![vct("data", "15Gi"), vct("log", "2Gi")],
            instances: vec![InstanceVolumeClaimTemplate {
                name: "big".to_owned(),
                volume_claim_templates: vec![vct("data", "30Gi")],
            }],
        };

        let default = requested_storage(&expansion, "");
        assert_eq!(default.get("data").map(|q| q.0.as_str()), Some("15Gi"));
        let big = requested_storage(&expansion, "big");
        assert_eq!(big.get("data").map(|q| q.0.as_str()), Some("30Gi"));
        assert_eq!(big.get("log").map(|q| q.0.as_str()), Some("2Gi"));
    }

    #[test]
    fn expansion_updates_component_and_instance_templates() {
        let mut spec = component();
        let expansion = VolumeExpansion {
            component_name: "mysql".to_owned(),
            volume_claim_templates: vec![vct("data", "15Gi")],
            instances: vec![
                InstanceVolumeClaimTemplate {
                    name: "big".to_owned(),
                    volume_claim_templates: vec![vct("data", "30Gi")],
                },
                InstanceVolumeClaimTemplate {
                    name: "small".to_owned(),
                    volume_claim_templates: vec![vct("log", "2Gi")],
                },
            ],
        };
        apply_expansion(&mut spec, &expansion).unwrap();

        assert_eq!(spec.volume_claim_template("data").unwrap().storage.0, "15Gi");
        let big = spec.instance_template("big").unwrap();
        assert_eq!(big.volume_claim_templates[0].storage.0, "30Gi");
        let small = spec.instance_template("small").unwrap();
        assert_eq!(small.volume_claim_templates, vec![ClusterComponentVolumeClaimTemplate {
            name: "log".to_owned(),
            storage: K8sQuantity("2Gi".to_owned()),
            storage_class_name: None,
        }]);

        // Applying the same request again changes nothing.
        let once = spec.clone();
        apply_expansion(&mut spec, &expansion).unwrap();
        assert_eq!(spec, once);
    }

    #[rstest]
    #[case::grow("10Gi", "20Gi", true)]
    #[case::same_value_other_unit("1Gi", "1024Mi", true)]
    #[case::shrink("10Gi", "5Gi", false)]
    fn storage_never_shrinks(#[case] current: &str, #[case] requested: &str, #[case] valid: bool) {
        assert_eq!(
            ensure_not_shrinking(
                "mysql",
                "data",
                &K8sQuantity(current.to_owned()),
                &K8sQuantity(requested.to_owned())
            )
            .is_ok(),
            valid
        );
    }
}

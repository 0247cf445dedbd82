use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::info;

use crate::{
    constants::{DISABLE_HA_CONFIGMAP_ANNOTATION, HA_ENABLE_ANNOTATION},
    crd::{
        now,
        ops_request::{OpsPhase, OpsRequest, OpsType},
    },
    operations::{
        OpsContext, OpsResource,
        conditions::{self, REASON_ABORTED},
        error::Result,
        queue::{ops_records, set_ops_records},
    },
};

/// Aborts every request of one of `ops_types` which was queued before the request of `res` and
/// for which `overlaps` returns true.
///
/// Aborted requests are removed from the queue without releasing anything, the request of `res`
/// takes their place.
pub(crate) async fn abort_earlier_ops_with_same_kind(
    ctx: &OpsContext,
    res: &mut OpsResource,
    ops_types: &[OpsType],
    mut overlaps: impl FnMut(&OpsRequest) -> Result<bool>,
) -> Result<()> {
    let mut records = ops_records(&res.cluster)?;
    let Some(position) = records
        .iter()
        .position(|record| record.name == res.ops_name())
    else {
        return Ok(());
    };

    let mut aborted = BTreeSet::new();
    for record in &records[..position] {
        if !ops_types.contains(&record.type_) {
            continue;
        }
        let Some(mut earlier) = ctx
            .client
            .get_opt::<OpsRequest>(&record.name, res.namespace())
            .await?
        else {
            continue;
        };
        if earlier.phase().is_terminal() || !earlier.phase().can_transition_to(OpsPhase::Aborted) {
            continue;
        }
        if !overlaps(&earlier)? {
            continue;
        }

        let status = earlier.status_mut();
        status.phase = OpsPhase::Aborted;
        status.completion_timestamp = Some(now());
        status.set_condition(conditions::aborted(
            REASON_ABORTED,
            format!(
                "Aborted as a result of the latest OpsRequest: {}",
                res.ops_name()
            ),
        ));
        ctx.client.update_status(&earlier).await?;
        update_ha_config(ctx, &earlier, "true").await?;
        info!(
            ops_request = %record.name,
            aborted_by = res.ops_name(),
            "aborted earlier OpsRequest"
        );
        aborted.insert(record.name.clone());
    }

    if !aborted.is_empty() {
        records.retain(|record| !aborted.contains(&record.name));
        set_ops_records(&mut res.cluster, &records)?;
        res.cluster = ctx.client.update(&res.cluster).await?;
    }
    Ok(())
}

/// Sets the `enable` annotation of the high availability ConfigMap named by `ops`, if there is
/// one and it is set to something else.
pub(crate) async fn update_ha_config(
    ctx: &OpsContext,
    ops: &OpsRequest,
    enable: &str,
) -> Result<()> {
    let Some(config_map_name) = ops
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DISABLE_HA_CONFIGMAP_ANNOTATION))
    else {
        return Ok(());
    };
    let Some(mut config_map) = ctx
        .client
        .get_opt::<ConfigMap>(
            config_map_name,
            ops.metadata.namespace.as_deref().unwrap_or_default(),
        )
        .await?
    else {
        return Ok(());
    };

    let Some(current) = config_map
        .metadata
        .annotations
        .as_mut()
        .and_then(|annotations| annotations.get_mut(HA_ENABLE_ANNOTATION))
    else {
        return Ok(());
    };
    if current == enable {
        return Ok(());
    }
    enable.clone_into(current);
    ctx.client.update(&config_map).await?;
    info!(
        config_map = %config_map_name,
        enable, "updated high availability setting"
    );
    Ok(())
}

/// Components named in both lists.
pub(crate) fn overlapping_components(left: &[String], right: &[String]) -> bool {
    left.iter().any(|name| right.contains(name))
}

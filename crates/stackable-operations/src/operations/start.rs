use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::{
    crd::ops_request::{OpsCondition, OpsPhase, OpsType},
    operations::{
        OpsContext, OpsHandler, OpsResource,
        component_ops::{ComponentOpsSet, reconcile_component_progress},
        conditions,
        error::Result,
        progress::handle_scale_progress,
        stop::{
            abort_earlier_start_stop, save_start_stop_configuration, snapshot_pods,
            start_stop_targets, validate_start_stop,
        },
    },
};

pub struct StartHandler;

#[async_trait]
impl OpsHandler for StartHandler {
    async fn validate(&self, _ctx: &OpsContext, res: &OpsResource) -> Result<()> {
        validate_start_stop(res, OpsType::Start)
    }

    async fn action_started_condition(
        &self,
        _ctx: &OpsContext,
        res: &OpsResource,
    ) -> Result<OpsCondition> {
        Ok(conditions::progressing(
            "StartStarted",
            format!("Start the Cluster: {}", res.cluster_name()),
        ))
    }

    async fn save_last_configuration(
        &self,
        _ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<()> {
        save_start_stop_configuration(res, OpsType::Start)
    }

    async fn action(&self, ctx: &OpsContext, res: &mut OpsResource) -> Result<()> {
        abort_earlier_start_stop(ctx, res, OpsType::Start).await?;
        let targets = start_stop_targets(&res.ops, &res.cluster, OpsType::Start)?;
        let set = ComponentOpsSet::new(&targets);
        set.update_components_and_shardings(&mut res.cluster, |spec, _| {
            spec.stop = None;
            Ok(())
        })?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            "starting components"
        );
        Ok(())
    }

    async fn reconcile_action(
        &self,
        ctx: &OpsContext,
        res: &mut OpsResource,
    ) -> Result<(OpsPhase, Duration)> {
        let targets = start_stop_targets(&res.ops, &res.cluster, OpsType::Start)?;
        let set = ComponentOpsSet::new(&targets);
        let mut resources = set.build_progress_resources(ctx, res).await?;
        reconcile_component_progress(ctx, res, &mut resources, |res, resource, status| {
            resource.created_pods = snapshot_pods(res, resource)?;
            Ok(handle_scale_progress(res, resource, status))
        })
        .await
    }
}

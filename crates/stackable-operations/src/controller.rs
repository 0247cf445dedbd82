//! Wires the [`OpsManager`] into a kube-runtime [`Controller`].
//!
//! OpsRequests are the primary watched objects. Changes to a [`Cluster`] trigger every request
//! recorded in its queue annotation, so waiting requests are looked at as soon as the cluster
//! moves on.

use std::{sync::Arc, time::Duration};

use futures::StreamExt as _;
use kube::runtime::{
    Controller,
    controller::Action,
    reflector::ObjectRef,
    watcher,
};
use snafu::{ResultExt as _, Snafu};
use tracing::warn;

use crate::{
    cli::WatchNamespace,
    client::Client,
    collaborators::{BackupRestore, ComponentSynthesizer, LifecycleActionRunner},
    constants::FIELD_MANAGER,
    crd::{cluster::Cluster, ops_request::OpsRequest},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    operations::{self, OpsContext, OpsManager, OpsRegistry, queue::ops_records},
};

pub const CONTROLLER_NAME: &str = "opsrequest";

/// Backoff after a transient reconciliation error.
const ERROR_REQUEUE_AFTER: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub manager: OpsManager,
    pub ops: OpsContext,
}

#[derive(Debug, Snafu, strum::IntoStaticStr)]
pub enum Error {
    #[snafu(display("failed to reconcile OpsRequest"))]
    ReconcileOpsRequest { source: operations::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        self.into()
    }
}

pub async fn reconcile(ops: Arc<OpsRequest>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let requeue_after = ctx
        .manager
        .reconcile_ops_request(&ctx.ops, (*ops).clone())
        .await
        .context(ReconcileOpsRequestSnafu)?;
    Ok(match requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

pub fn error_policy(_ops: Arc<OpsRequest>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(ERROR_REQUEUE_AFTER)
}

/// The OpsRequests a cluster change should trigger.
fn queued_ops_requests(cluster: &Cluster) -> Vec<ObjectRef<OpsRequest>> {
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    match ops_records(cluster) {
        Ok(records) => records
            .into_iter()
            .map(|record| ObjectRef::new(&record.name).within(&namespace))
            .collect(),
        Err(error) => {
            warn!(
                cluster = cluster.metadata.name.as_deref().unwrap_or_default(),
                error = &error as &dyn std::error::Error,
                "ignoring cluster with unreadable ops request queue"
            );
            Vec::new()
        }
    }
}

/// Runs the controller with all builtin handlers until a shutdown signal is received.
pub async fn run(
    kube_client: kube::Client,
    watch_namespace: &WatchNamespace,
    synthesizer: Arc<dyn ComponentSynthesizer>,
    lifecycle: Arc<dyn LifecycleActionRunner>,
    backup: Arc<dyn BackupRestore>,
) {
    let ctx = Arc::new(Ctx {
        manager: OpsManager::new(OpsRegistry::with_builtin_handlers()),
        ops: OpsContext {
            client: Client::from_kube(kube_client.clone(), FIELD_MANAGER),
            synthesizer,
            lifecycle,
            backup,
        },
    });

    Controller::new(
        watch_namespace.get_api::<OpsRequest>(&kube_client),
        watcher::Config::default(),
    )
    .watches(
        watch_namespace.get_api::<Cluster>(&kube_client),
        watcher::Config::default(),
        |cluster| queued_ops_requests(&cluster),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        report_controller_reconciled(CONTROLLER_NAME, &result);
    })
    .await;
}

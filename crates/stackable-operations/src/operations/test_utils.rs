//! In-memory collaborators and fixtures for driving the manager in tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use indoc::formatdoc;
use k8s_openapi::api::core::v1::Pod;

use crate::{
    client::{Client, Object},
    collaborators::{
        ActionStatus, BackupRestore, ComponentSynthesizer, CustomActionRequest,
        LifecycleActionRunner, ReplicaRole, RestoreStatus, Result, SynthesizedComponent,
    },
    constants::{APP_INSTANCE_LABEL, COMPONENT_LABEL},
    crd::{
        cluster::{Cluster, ClusterComponentStatus, ClusterPhase, ComponentPhase},
        ops_request::{Instance, OpsRequest},
    },
    operations::{OpsContext, OpsManager, OpsRegistry},
};

pub const NAMESPACE: &str = "default";

/// Synthesizes components straight from the cluster spec. Sharding members are named
/// `<sharding>-<index>`.
#[derive(Debug, Default)]
pub struct FakeSynthesizer {
    pub roles: Vec<ReplicaRole>,
    pub static_parameters: Vec<String>,
}

#[async_trait]
impl ComponentSynthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        cluster: &Cluster,
        component_name: &str,
    ) -> Result<SynthesizedComponent> {
        Ok(SynthesizedComponent {
            cluster_name: cluster.metadata.name.clone().unwrap_or_default(),
            namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
            name: component_name.to_owned(),
            component_def: cluster
                .component_spec(component_name)
                .and_then(|spec| spec.component_def.clone()),
            roles: self.roles.clone(),
            min_ready_seconds: 0,
            static_parameters: self.static_parameters.clone(),
            has_switchover_action: true,
        })
    }

    async fn list_sharding_components(
        &self,
        cluster: &Cluster,
        sharding_name: &str,
    ) -> Result<Vec<String>> {
        let shards = cluster
            .sharding(sharding_name)
            .map(|sharding| sharding.shards)
            .unwrap_or_default();
        Ok((0..shards)
            .map(|index| format!("{sharding_name}-{index}"))
            .collect())
    }
}

/// Records every call. Custom actions report the status configured for their name, `Succeed`
/// otherwise.
#[derive(Debug, Default)]
pub struct FakeLifecycle {
    pub switchovers: Mutex<Vec<(String, Option<String>)>>,
    pub custom_actions: Mutex<Vec<CustomActionRequest>>,
    pub action_statuses: Mutex<BTreeMap<String, ActionStatus>>,
}

impl FakeLifecycle {
    pub fn set_action_status(&self, action: &str, status: ActionStatus) {
        self.action_statuses
            .lock()
            .unwrap()
            .insert(action.to_owned(), status);
    }

    pub fn custom_action_names(&self) -> Vec<String> {
        self.custom_actions
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.action.name.clone())
            .collect()
    }
}

#[async_trait]
impl LifecycleActionRunner for FakeLifecycle {
    async fn switchover(
        &self,
        component: &SynthesizedComponent,
        candidate: Option<&str>,
    ) -> Result<()> {
        self.switchovers
            .lock()
            .unwrap()
            .push((component.name.clone(), candidate.map(str::to_owned)));
        Ok(())
    }

    async fn run_custom_action(&self, request: &CustomActionRequest) -> Result<ActionStatus> {
        self.custom_actions.lock().unwrap().push(request.clone());
        Ok(self
            .action_statuses
            .lock()
            .unwrap()
            .get(&request.action.name)
            .cloned()
            .unwrap_or(ActionStatus::Succeed))
    }
}

/// Restores complete immediately unless configured otherwise.
#[derive(Debug)]
pub struct FakeBackup {
    pub status: Mutex<RestoreStatus>,
}

impl Default for FakeBackup {
    fn default() -> Self {
        Self {
            status: Mutex::new(RestoreStatus::Completed),
        }
    }
}

#[async_trait]
impl BackupRestore for FakeBackup {
    async fn rebuild_in_place(
        &self,
        _ops_request_name: &str,
        _component: &SynthesizedComponent,
        _instance: &Instance,
        _backup_name: Option<&str>,
    ) -> Result<RestoreStatus> {
        Ok(self.status.lock().unwrap().clone())
    }
}

/// A manager with all builtin handlers, running against an in-memory store.
pub struct TestEnv {
    pub ctx: OpsContext,
    pub manager: OpsManager,
    pub lifecycle: Arc<FakeLifecycle>,
    pub backup: Arc<FakeBackup>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new(FakeSynthesizer::default())
    }
}

impl TestEnv {
    pub fn new(synthesizer: FakeSynthesizer) -> Self {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let backup = Arc::new(FakeBackup::default());
        Self {
            ctx: OpsContext {
                client: Client::in_memory(),
                synthesizer: Arc::new(synthesizer),
                lifecycle: lifecycle.clone(),
                backup: backup.clone(),
            },
            manager: OpsManager::new(OpsRegistry::with_builtin_handlers()),
            lifecycle,
            backup,
        }
    }

    pub fn client(&self) -> &Client {
        &self.ctx.client
    }

    /// Parses `yaml` and stores the object, status included.
    pub async fn create<K: Object>(&self, yaml: &str) -> K {
        let object: K = serde_yaml::from_str(yaml).expect("valid object");
        self.client().create(&object).await.expect("object created")
    }

    pub async fn ops(&self, name: &str) -> OpsRequest {
        self.client()
            .get(name, NAMESPACE)
            .await
            .expect("OpsRequest exists")
    }

    pub async fn cluster(&self, name: &str) -> Cluster {
        self.client()
            .get(name, NAMESPACE)
            .await
            .expect("Cluster exists")
    }

    /// Runs one reconciliation of the request named `name`, as triggered by the controller.
    pub async fn reconcile(&self, name: &str) -> Option<Duration> {
        let ops = self.ops(name).await;
        self.manager
            .reconcile_ops_request(&self.ctx, ops)
            .await
            .expect("reconciliation succeeds")
    }

    /// Changes an OpsRequest spec the way a user would.
    pub async fn edit_ops(&self, name: &str, edit: impl FnOnce(&mut OpsRequest)) {
        let mut ops = self.ops(name).await;
        edit(&mut ops);
        self.client().update(&ops).await.expect("OpsRequest updated");
    }

    /// Sets the phase of the cluster and all of its components.
    pub async fn set_cluster_phase(&self, name: &str, phase: ClusterPhase, component: ComponentPhase) {
        let mut cluster = self.cluster(name).await;
        let names = cluster.component_names();
        let status = cluster.status.get_or_insert_with(Default::default);
        status.phase = Some(phase);
        for component_name in names {
            status.components.insert(component_name, ClusterComponentStatus {
                phase: Some(component),
                ..ClusterComponentStatus::default()
            });
        }
        self.client()
            .update_status(&cluster)
            .await
            .expect("Cluster status updated");
    }

    /// Creates ready pods of a component.
    pub async fn create_ready_pods(&self, cluster_name: &str, component_name: &str, pods: &[&str]) {
        for pod in pods {
            let pod: Pod = serde_yaml::from_str(&ready_pod(cluster_name, component_name, pod))
                .expect("valid pod");
            self.client().create(&pod).await.expect("pod created");
        }
    }

    pub async fn queue_annotation(&self, cluster_name: &str) -> Option<String> {
        self.cluster(cluster_name)
            .await
            .metadata
            .annotations
            .and_then(|annotations| {
                annotations
                    .get(crate::constants::OPS_REQUEST_QUEUE_ANNOTATION)
                    .cloned()
            })
    }
}

pub fn ready_pod(cluster_name: &str, component_name: &str, name: &str) -> String {
    formatdoc! {"
        apiVersion: v1
        kind: Pod
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          labels:
            {APP_INSTANCE_LABEL}: {cluster_name}
            {COMPONENT_LABEL}: {component_name}
        status:
          phase: Running
          conditions:
            - type: Ready
              status: \"True\"
    "}
}

/// A running cluster with a single `mysql` component.
pub fn mysql_cluster(replicas: i32) -> String {
    formatdoc! {"
        apiVersion: apps.stackable.tech/v1alpha1
        kind: Cluster
        metadata:
          name: mycluster
          namespace: {NAMESPACE}
        spec:
          componentSpecs:
            - name: mysql
              replicas: {replicas}
              volumeClaimTemplates:
                - name: data
                  storage: 1Gi
        status:
          phase: Running
          components:
            mysql:
              phase: Running
    "}
}

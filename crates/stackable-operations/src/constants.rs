//! Label and annotation keys shared between the engine and the workloads it inspects.

/// Names the cluster a workload object belongs to.
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Names the (full) component a pod, PVC or service belongs to.
pub const COMPONENT_LABEL: &str = "apps.stackable.tech/component-name";

/// The replication role a pod currently holds, e.g. `leader` or `follower`.
pub const ROLE_LABEL: &str = "apps.stackable.tech/role";

/// The volume claim template a PVC was created from.
pub const VOLUME_CLAIM_TEMPLATE_LABEL: &str = "apps.stackable.tech/volume-claim-template";

/// JSON encoded list of queue records of all in-flight requests for a cluster.
pub const OPS_REQUEST_QUEUE_ANNOTATION: &str = "operations.stackable.tech/ops-request-queue";

/// Set on a request when it leaves the queue, used as base time for the precondition deadline.
pub const QUEUE_END_TIME_ANNOTATION: &str = "operations.stackable.tech/queue-end-time";

/// Touched to trigger another reconciliation of an object.
pub const RECONCILE_ANNOTATION: &str = "operations.stackable.tech/reconcile";

/// Names a ConfigMap whose `enable` annotation controls high availability for the cluster.
pub const DISABLE_HA_CONFIGMAP_ANNOTATION: &str = "operations.stackable.tech/disable-ha-configmap";

/// The annotation on the high availability ConfigMap that is toggled.
pub const HA_ENABLE_ANNOTATION: &str = "enable";

/// Written into a component spec to make the workload layer roll its pods.
pub const RESTART_ANNOTATION: &str = "operations.stackable.tech/restarted-at";

/// Skips the role label check when waiting for pods to become available.
pub const IGNORE_ROLE_CHECK_ANNOTATION: &str = "operations.stackable.tech/ignore-role-check";

pub const OPS_REQUEST_FINALIZER: &str = "operations.stackable.tech/finalizer";

pub const FIELD_MANAGER: &str = "stackable-operations";

//! The per cluster queue of in-flight requests.
//!
//! The queue is the only coordination state shared between requests. It is stored as a JSON list
//! of [`OpsRecord`]s in the [`OPS_REQUEST_QUEUE_ANNOTATION`] of the cluster, in admission order.
//!
//! A record is blocked by every earlier record it shares a scope or a resulting cluster phase
//! with. Records admitted with `force` are never blocked, and a record that was released once is
//! never put back into the queue.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tracing::{debug, info};

use crate::{
    constants::{OPS_REQUEST_QUEUE_ANNOTATION, QUEUE_END_TIME_ANNOTATION, RECONCILE_ANNOTATION},
    crd::{
        cluster::Cluster,
        ops_request::{OpsRequest, OpsType},
    },
    operations::{
        OpsContext, OpsRegistry, OpsResource,
        error::{EncodeJsonSnafu, MalformedQueueSnafu, Result},
    },
};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRecord {
    pub name: String,

    #[serde(rename = "type")]
    pub type_: OpsType,

    /// Waiting for an earlier record to complete.
    #[serde(default)]
    pub in_queue: bool,

    /// Only excludes records of the same type.
    #[serde(default)]
    pub queue_by_self: bool,
}

impl OpsRecord {
    /// Whether `self`, admitted earlier, keeps `later` from running.
    pub fn blocks(&self, later: &Self, registry: &OpsRegistry) -> bool {
        let same_scope = if later.queue_by_self {
            self.type_ == later.type_
        } else {
            !self.queue_by_self
        };
        let same_phase = matches!(
            (
                registry.to_cluster_phase(self.type_),
                registry.to_cluster_phase(later.type_),
            ),
            (Some(earlier), Some(later)) if earlier == later
        );
        same_scope || same_phase
    }
}

/// Reads the queue of `cluster`.
pub fn ops_records(cluster: &Cluster) -> Result<Vec<OpsRecord>> {
    match cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(OPS_REQUEST_QUEUE_ANNOTATION))
    {
        Some(value) if !value.is_empty() => {
            serde_json::from_str(value).with_context(|_| MalformedQueueSnafu {
                cluster: cluster.metadata.name.clone().unwrap_or_default(),
            })
        }
        _ => Ok(Vec::new()),
    }
}

/// Writes `records` as the queue of `cluster`, removing the annotation if there are none.
pub fn set_ops_records(cluster: &mut Cluster, records: &[OpsRecord]) -> Result<()> {
    let annotations = cluster
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    if records.is_empty() {
        annotations.remove(OPS_REQUEST_QUEUE_ANNOTATION);
    } else {
        let value = serde_json::to_string(records).context(EncodeJsonSnafu {
            what: "ops request queue",
        })?;
        annotations.insert(OPS_REQUEST_QUEUE_ANNOTATION.to_owned(), value);
    }
    Ok(())
}

/// Appends `record` unless a record of that name exists, and decides whether it has to wait.
///
/// Returns whether `records` changed and whether the record is in the queue.
pub fn enqueue(
    records: &mut Vec<OpsRecord>,
    mut record: OpsRecord,
    force: bool,
    registry: &OpsRegistry,
) -> (bool, bool) {
    let (index, added) = match records.iter().position(|existing| existing.name == record.name) {
        Some(index) => (index, false),
        None => {
            record.in_queue = !force;
            records.push(record);
            (records.len() - 1, true)
        }
    };

    let was_in_queue = records[index].in_queue;
    let in_queue = was_in_queue && is_blocked(&records[..index], &records[index], registry);
    records[index].in_queue = in_queue;
    (added || was_in_queue != in_queue, in_queue)
}

/// Removes the record named `name` and releases every record that is no longer blocked.
///
/// Returns whether a record was removed and the names of the released records.
pub fn dequeue(
    records: &mut Vec<OpsRecord>,
    name: &str,
    registry: &OpsRegistry,
) -> (bool, Vec<String>) {
    let before = records.len();
    records.retain(|record| record.name != name);
    let removed = records.len() != before;

    let mut released = Vec::new();
    for index in 0..records.len() {
        if records[index].in_queue && !is_blocked(&records[..index], &records[index], registry) {
            records[index].in_queue = false;
            released.push(records[index].name.clone());
        }
    }
    (removed, released)
}

fn is_blocked(earlier: &[OpsRecord], record: &OpsRecord, registry: &OpsRegistry) -> bool {
    earlier
        .iter()
        .any(|earlier| earlier.blocks(record, registry))
}

/// Adds the request of `res` to the queue of its cluster. Returns whether the request has to
/// wait.
pub(crate) async fn enqueue_ops_request(
    ctx: &OpsContext,
    registry: &OpsRegistry,
    res: &mut OpsResource,
    queue_by_self: bool,
) -> Result<bool> {
    let mut records = ops_records(&res.cluster)?;
    let record = OpsRecord {
        name: res.ops_name().to_owned(),
        type_: res.ops.ops_type(),
        in_queue: false,
        queue_by_self,
    };
    let (changed, in_queue) = enqueue(&mut records, record, res.ops.spec.force, registry);
    if changed {
        set_ops_records(&mut res.cluster, &records)?;
        res.cluster = ctx.client.update(&res.cluster).await?;
        info!(
            ops_request = res.ops_name(),
            cluster = res.cluster_name(),
            in_queue,
            "added OpsRequest to the cluster queue"
        );
    }
    Ok(in_queue)
}

/// Removes the request of `res` from the queue of its cluster and triggers the requests which
/// may run now.
pub(crate) async fn dequeue_ops_request(
    ctx: &OpsContext,
    registry: &OpsRegistry,
    res: &mut OpsResource,
) -> Result<()> {
    let mut records = ops_records(&res.cluster)?;
    let (removed, released) = dequeue(&mut records, res.ops_name(), registry);
    if !removed && released.is_empty() {
        return Ok(());
    }
    set_ops_records(&mut res.cluster, &records)?;
    res.cluster = ctx.client.update(&res.cluster).await?;
    info!(
        ops_request = res.ops_name(),
        cluster = res.cluster_name(),
        ?released,
        "removed OpsRequest from the cluster queue"
    );

    for name in released {
        poke_ops_request(ctx, res.namespace(), &name).await?;
    }
    Ok(())
}

/// Marks a request as released from the queue, which also triggers its next reconciliation.
async fn poke_ops_request(ctx: &OpsContext, namespace: &str, name: &str) -> Result<()> {
    let Some(mut ops) = ctx.client.get_opt::<OpsRequest>(name, namespace).await? else {
        debug!(ops_request = name, "released OpsRequest no longer exists");
        return Ok(());
    };
    let now = Timestamp::now().to_string();
    let annotations = ops.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(QUEUE_END_TIME_ANNOTATION.to_owned(), now.clone());
    annotations.insert(RECONCILE_ANNOTATION.to_owned(), now);
    ctx.client.update(&ops).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn record(name: &str, type_: OpsType, queue_by_self: bool) -> OpsRecord {
        OpsRecord {
            name: name.to_owned(),
            type_,
            in_queue: false,
            queue_by_self,
        }
    }

    fn not_in_queue(records: &[OpsRecord]) -> Vec<&str> {
        records
            .iter()
            .filter(|record| !record.in_queue)
            .map(|record| record.name.as_str())
            .collect()
    }

    #[test]
    fn cluster_scope_admits_one_at_a_time() {
        let registry = OpsRegistry::with_builtin_handlers();
        let mut records = Vec::new();

        let (changed, in_queue) = enqueue(
            &mut records,
            record("scale", OpsType::HorizontalScaling, false),
            false,
            &registry,
        );
        assert!(changed);
        assert!(!in_queue);

        let (_, in_queue) = enqueue(
            &mut records,
            record("restart", OpsType::Restart, false),
            false,
            &registry,
        );
        assert!(in_queue);
        assert_eq!(not_in_queue(&records), vec!["scale"]);

        // Enqueueing again does not duplicate the record
        let (changed, in_queue) = enqueue(
            &mut records,
            record("restart", OpsType::Restart, false),
            false,
            &registry,
        );
        assert!(!changed);
        assert!(in_queue);
        assert_eq!(records.len(), 2);

        let (removed, released) = dequeue(&mut records, "scale", &registry);
        assert!(removed);
        assert_eq!(released, vec!["restart"]);
        assert_eq!(not_in_queue(&records), vec!["restart"]);
    }

    #[rstest]
    #[case::same_type_queue_by_self(
        record("expand-1", OpsType::VolumeExpansion, true),
        record("expand-2", OpsType::VolumeExpansion, true),
        true
    )]
    #[case::other_type_queue_by_self(
        record("expose", OpsType::Expose, true),
        record("expand", OpsType::VolumeExpansion, true),
        false
    )]
    #[case::cluster_scope_ignores_self_scope(
        record("expose", OpsType::Expose, true),
        record("scale", OpsType::HorizontalScaling, false),
        false
    )]
    #[case::self_scope_ignores_cluster_scope(
        record("scale", OpsType::HorizontalScaling, false),
        record("expose", OpsType::Expose, true),
        false
    )]
    #[case::cluster_scope(
        record("stop", OpsType::Stop, false),
        record("restart", OpsType::Restart, false),
        true
    )]
    fn blocking_rules(#[case] earlier: OpsRecord, #[case] later: OpsRecord, #[case] blocks: bool) {
        let registry = OpsRegistry::with_builtin_handlers();
        assert_eq!(earlier.blocks(&later, &registry), blocks);
    }

    #[test]
    fn forced_records_skip_the_queue() {
        let registry = OpsRegistry::with_builtin_handlers();
        let mut records = vec![record("scale", OpsType::HorizontalScaling, false)];

        let (changed, in_queue) = enqueue(
            &mut records,
            record("forced", OpsType::HorizontalScaling, false),
            true,
            &registry,
        );
        assert!(changed);
        assert!(!in_queue);
    }

    #[test]
    fn at_most_one_running_record_per_scope() {
        let registry = OpsRegistry::with_builtin_handlers();
        let mut records = Vec::new();
        for (name, type_, queue_by_self) in [
            ("scale", OpsType::HorizontalScaling, false),
            ("expand-1", OpsType::VolumeExpansion, true),
            ("restart", OpsType::Restart, false),
            ("expand-2", OpsType::VolumeExpansion, true),
            ("expose", OpsType::Expose, true),
            ("stop", OpsType::Stop, false),
        ] {
            enqueue(&mut records, record(name, type_, queue_by_self), false, &registry);
            assert_running_records_per_scope(&records);
        }
        assert_eq!(not_in_queue(&records), vec!["scale", "expand-1", "expose"]);

        for name in ["expand-1", "scale", "restart"] {
            dequeue(&mut records, name, &registry);
            assert_running_records_per_scope(&records);
        }
        assert_eq!(not_in_queue(&records), vec!["expand-2", "expose", "stop"]);
    }

    fn assert_running_records_per_scope(records: &[OpsRecord]) {
        let mut running = BTreeMap::<String, usize>::new();
        for record in records.iter().filter(|record| !record.in_queue) {
            let scope = if record.queue_by_self {
                record.type_.to_string()
            } else {
                "cluster".to_owned()
            };
            *running.entry(scope).or_default() += 1;
        }
        assert!(running.values().all(|count| *count <= 1), "{running:?}");
    }

    #[test]
    fn queue_annotation_roundtrip() {
        let mut cluster = Cluster::new("mycluster", Default::default());
        assert!(ops_records(&cluster).unwrap().is_empty());

        let records = vec![OpsRecord {
            in_queue: true,
            ..record("scale", OpsType::HorizontalScaling, false)
        }];
        set_ops_records(&mut cluster, &records).unwrap();
        let annotation = cluster
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(OPS_REQUEST_QUEUE_ANNOTATION))
            .unwrap();
        assert_eq!(
            annotation,
            r#"[{"name":"scale","type":"HorizontalScaling","inQueue":true,"queueBySelf":false}]"#
        );
        assert_eq!(ops_records(&cluster).unwrap(), records);

        set_ops_records(&mut cluster, &[]).unwrap();
        assert!(ops_records(&cluster).unwrap().is_empty());
    }
}

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use jiff::Timestamp;
use kube::core::ApiResource;
use serde_json::{Map, Value};
use snafu::{OptionExt as _, ensure};

use super::{
    AlreadyExistsSnafu, Backend, ConflictSnafu, MissingObjectKeySnafu, NotFoundSnafu,
    PoisonedSnafu, Result,
};

type ObjectKey = (String, String, String);

/// A process local object store with API server semantics where the engine relies on them:
/// optimistic concurrency through `resourceVersion`, a separate status subresource, generation
/// bumps on spec changes and finalizer aware deletion.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    resource_version: AtomicU64,
}

impl MemoryBackend {
    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
        (
            format!("{}/{}", resource.api_version, resource.kind),
            namespace.to_owned(),
            name.to_owned(),
        )
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        Ok(objects.get(&Self::key(resource, namespace, name)).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>> {
        let objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        let type_key = format!("{}/{}", resource.api_version, resource.kind);
        Ok(objects
            .iter()
            .filter(|((kind, ns, _), _)| *kind == type_key && ns == namespace)
            .filter(|(_, object)| {
                labels.iter().all(|(key, value)| {
                    object
                        .pointer("/metadata/labels")
                        .and_then(|labels| labels.get(key))
                        .and_then(Value::as_str)
                        == Some(value.as_str())
                })
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        mut object: Value,
    ) -> Result<Value> {
        let name = object_name(&object)
            .with_context(|| MissingObjectKeySnafu {
                kind: resource.kind.clone(),
            })?
            .to_owned();
        let key = Self::key(resource, namespace, &name);

        let mut objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        ensure!(
            !objects.contains_key(&key),
            AlreadyExistsSnafu {
                kind: resource.kind.clone(),
                namespace,
                name,
            }
        );

        let resource_version = self.next_resource_version();
        let metadata = metadata_mut(&mut object).with_context(|| MissingObjectKeySnafu {
            kind: resource.kind.clone(),
        })?;
        metadata.insert("resourceVersion".to_owned(), resource_version.into());
        metadata.insert("generation".to_owned(), 1.into());
        metadata
            .entry("uid")
            .or_insert_with(|| format!("{}-{name}", resource.kind.to_lowercase()).into());
        metadata
            .entry("creationTimestamp")
            .or_insert_with(|| Timestamp::now().to_string().into());
        metadata.remove("deletionTimestamp");

        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        mut object: Value,
    ) -> Result<Value> {
        let key = Self::key(resource, namespace, name);
        let mut objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        let existing = objects.get(&key).with_context(|| NotFoundSnafu {
            kind: resource.kind.clone(),
            namespace,
            name,
        })?;
        check_resource_version(resource, namespace, name, existing, &object)?;

        let spec_changed = existing.get("spec") != object.get("spec");
        let generation = existing
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1)
            + i64::from(spec_changed);
        let deletion_timestamp = existing.pointer("/metadata/deletionTimestamp").cloned();
        let status = existing.get("status").cloned();

        if let Some(fields) = object.as_object_mut() {
            match status {
                Some(status) => fields.insert("status".to_owned(), status),
                None => fields.remove("status"),
            };
        }
        let resource_version = self.next_resource_version();
        let metadata = metadata_mut(&mut object).with_context(|| MissingObjectKeySnafu {
            kind: resource.kind.clone(),
        })?;
        metadata.insert("resourceVersion".to_owned(), resource_version.into());
        metadata.insert("generation".to_owned(), generation.into());
        match deletion_timestamp {
            Some(deletion_timestamp) => {
                metadata.insert("deletionTimestamp".to_owned(), deletion_timestamp);
            }
            None => {
                metadata.remove("deletionTimestamp");
            }
        }

        // A deleted object is released once its last finalizer is gone
        if metadata.contains_key("deletionTimestamp") && !has_finalizers(metadata) {
            objects.remove(&key);
        } else {
            objects.insert(key, object.clone());
        }
        Ok(object)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value> {
        let key = Self::key(resource, namespace, name);
        let mut objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        let resource_version = self.next_resource_version();
        let existing = objects.get_mut(&key).with_context(|| NotFoundSnafu {
            kind: resource.kind.clone(),
            namespace,
            name,
        })?;
        check_resource_version(resource, namespace, name, existing, &object)?;

        if let Some(fields) = existing.as_object_mut() {
            match object.get("status") {
                Some(status) => fields.insert("status".to_owned(), status.clone()),
                None => fields.remove("status"),
            };
        }
        if let Some(metadata) = metadata_mut(existing) {
            metadata.insert("resourceVersion".to_owned(), resource_version.into());
        }
        Ok(existing.clone())
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let key = Self::key(resource, namespace, name);
        let mut objects = self.objects.lock().ok().context(PoisonedSnafu)?;
        let resource_version = self.next_resource_version();
        let existing = objects.get_mut(&key).with_context(|| NotFoundSnafu {
            kind: resource.kind.clone(),
            namespace,
            name,
        })?;

        match metadata_mut(existing) {
            Some(metadata) if has_finalizers(metadata) => {
                metadata
                    .entry("deletionTimestamp")
                    .or_insert_with(|| Timestamp::now().to_string().into());
                metadata.insert("resourceVersion".to_owned(), resource_version.into());
            }
            _ => {
                objects.remove(&key);
            }
        }
        Ok(())
    }
}

fn object_name(object: &Value) -> Option<&str> {
    object.pointer("/metadata/name").and_then(Value::as_str)
}

fn metadata_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    object.get_mut("metadata").and_then(Value::as_object_mut)
}

fn has_finalizers(metadata: &Map<String, Value>) -> bool {
    metadata
        .get("finalizers")
        .and_then(Value::as_array)
        .is_some_and(|finalizers| !finalizers.is_empty())
}

fn check_resource_version(
    resource: &ApiResource,
    namespace: &str,
    name: &str,
    existing: &Value,
    object: &Value,
) -> Result<()> {
    let expected = object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str);
    let actual = existing
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str);
    ensure!(
        expected.is_none() || expected == actual,
        ConflictSnafu {
            kind: resource.kind.clone(),
            namespace,
            name,
            resource_version: expected.map(str::to_owned),
        }
    );
    Ok(())
}

//! Typed access to the objects read and written by the engine.
//!
//! [`Client`] offers `get`/`list`/`create`/`update`/`update_status`/`delete` for any namespaced
//! Kubernetes object and forwards them to a [`Backend`]. Updates are conditional on the
//! `resourceVersion` of the passed object, a stale write fails with [`Error::Conflict`] and has to
//! be retried from a fresh read. Spec and status are written separately: [`Client::update`] never
//! touches the status and [`Client::update_status`] never touches anything else.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use kube::{Resource, core::ApiResource};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

mod api_server;
mod memory;

pub use api_server::ApiServerBackend;
pub use memory::MemoryBackend;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} {namespace}/{name} not found"))]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} already exists"))]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display(
        "{kind} {namespace}/{name} was modified concurrently, resource version {resource_version:?} is outdated"
    ))]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        resource_version: Option<String>,
    },

    #[snafu(display("{kind} object has no namespace or name"))]
    MissingObjectKey { kind: String },

    #[snafu(display("failed to serialize {kind} object"))]
    SerializeObject {
        source: serde_json::Error,
        kind: String,
    },

    #[snafu(display("failed to deserialize {kind} object"))]
    DeserializeObject {
        source: serde_json::Error,
        kind: String,
    },

    #[snafu(display("request to the Kubernetes API server failed"))]
    KubeApi { source: kube::Error },

    #[snafu(display("the in-memory object store is poisoned"))]
    Poisoned,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Any namespaced object that can be stored.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Untyped object storage, objects are passed around as JSON values.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str)
    -> Result<Option<Value>>;

    /// Lists all objects in `namespace` carrying all of the given labels.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>>;

    async fn create(&self, resource: &ApiResource, namespace: &str, object: Value)
    -> Result<Value>;

    /// Replaces everything but the status.
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value>;

    /// Replaces only the status.
    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value>;

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// A client talking to the Kubernetes API server.
    pub fn from_kube(client: kube::Client, field_manager: &str) -> Self {
        Self::new(ApiServerBackend::new(client, field_manager))
    }

    /// A client backed by a process local object store.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }

    pub async fn get<K: Object>(&self, name: &str, namespace: &str) -> Result<K> {
        self.get_opt(name, namespace)
            .await?
            .with_context(|| NotFoundSnafu {
                kind: K::kind(&()),
                namespace,
                name,
            })
    }

    pub async fn get_opt<K: Object>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        let resource = ApiResource::erase::<K>(&());
        self.backend
            .get(&resource, namespace, name)
            .await?
            .map(from_value::<K>)
            .transpose()
    }

    pub async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let resource = ApiResource::erase::<K>(&());
        self.backend
            .list(&resource, namespace, labels)
            .await?
            .into_iter()
            .map(from_value::<K>)
            .collect()
    }

    pub async fn create<K: Object>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        let (namespace, _) = object_key(object)?;
        let created = self
            .backend
            .create(&resource, namespace, to_value(object)?)
            .await?;
        from_value(created)
    }

    pub async fn update<K: Object>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        let (namespace, name) = object_key(object)?;
        let updated = self
            .backend
            .replace(&resource, namespace, name, to_value(object)?)
            .await?;
        from_value(updated)
    }

    pub async fn update_status<K: Object>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        let (namespace, name) = object_key(object)?;
        let updated = self
            .backend
            .replace_status(&resource, namespace, name, to_value(object)?)
            .await?;
        from_value(updated)
    }

    pub async fn delete<K: Object>(&self, object: &K) -> Result<()> {
        let resource = ApiResource::erase::<K>(&());
        let (namespace, name) = object_key(object)?;
        self.backend.delete(&resource, namespace, name).await
    }
}

fn object_key<K: Object>(object: &K) -> Result<(&str, &str)> {
    let meta = object.meta();
    meta.namespace
        .as_deref()
        .zip(meta.name.as_deref())
        .with_context(|| MissingObjectKeySnafu { kind: K::kind(&()) })
}

fn to_value<K: Object>(object: &K) -> Result<Value> {
    serde_json::to_value(object).with_context(|_| SerializeObjectSnafu { kind: K::kind(&()) })
}

fn from_value<K: Object>(value: Value) -> Result<K> {
    serde_json::from_value(value).with_context(|_| DeserializeObjectSnafu { kind: K::kind(&()) })
}

/// Formats labels as a Kubernetes label selector.
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMap, Pod};
    use kube::api::ObjectMeta;

    use super::*;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let client = Client::in_memory();
        let created = client.create(&config_map("cm", &[])).await.unwrap();

        let mut first = created.clone();
        first
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert("a".to_owned(), "1".to_owned());
        client.update(&first).await.unwrap();

        let mut second = created;
        second
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert("b".to_owned(), "2".to_owned());
        let error = client.update(&second).await.unwrap_err();
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let client = Client::in_memory();
        client
            .create(&config_map("one", &[("app", "a")]))
            .await
            .unwrap();
        client
            .create(&config_map("two", &[("app", "b")]))
            .await
            .unwrap();

        let labels = BTreeMap::from([("app".to_owned(), "a".to_owned())]);
        let listed = client.list::<ConfigMap>("default", &labels).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name.as_deref(), Some("one"));

        // Other kinds are kept apart
        let pods = client.list::<Pod>("default", &BTreeMap::new()).await.unwrap();
        assert!(pods.is_empty());
    }

    #[tokio::test]
    async fn get_missing_object() {
        let client = Client::in_memory();
        let error = client.get::<ConfigMap>("missing", "default").await.unwrap_err();
        assert!(error.is_not_found());
        assert!(
            client
                .get_opt::<ConfigMap>("missing", "default")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn selector_format() {
        let labels = BTreeMap::from([
            ("a".to_owned(), "1".to_owned()),
            ("b".to_owned(), "2".to_owned()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
    }
}

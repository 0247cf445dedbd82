use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::{
    Api,
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::ApiResource,
};
use serde_json::{Value, json};
use snafu::ResultExt as _;

use super::{Backend, DeserializeObjectSnafu, KubeApiSnafu, Result, SerializeObjectSnafu};

/// Forwards all requests to the Kubernetes API server.
#[derive(Clone)]
pub struct ApiServerBackend {
    client: kube::Client,
    post_params: PostParams,
    status_patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl ApiServerBackend {
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: Some(field_manager.to_owned()),
                ..PostParams::default()
            },
            status_patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

fn to_dynamic(resource: &ApiResource, object: Value) -> Result<DynamicObject> {
    serde_json::from_value(object).with_context(|_| DeserializeObjectSnafu {
        kind: resource.kind.clone(),
    })
}

fn from_dynamic(resource: &ApiResource, object: &DynamicObject) -> Result<Value> {
    serde_json::to_value(object).with_context(|_| SerializeObjectSnafu {
        kind: resource.kind.clone(),
    })
}

#[async_trait]
impl Backend for ApiServerBackend {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        self.api(resource, namespace)
            .get_opt(name)
            .await
            .context(KubeApiSnafu)?
            .map(|object| from_dynamic(resource, &object))
            .transpose()
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>> {
        let list_params = ListParams::default().labels(&super::label_selector(labels));
        self.api(resource, namespace)
            .list(&list_params)
            .await
            .context(KubeApiSnafu)?
            .items
            .iter()
            .map(|object| from_dynamic(resource, object))
            .collect()
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: Value,
    ) -> Result<Value> {
        let object = to_dynamic(resource, object)?;
        let created = self
            .api(resource, namespace)
            .create(&self.post_params, &object)
            .await
            .context(KubeApiSnafu)?;
        from_dynamic(resource, &created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value> {
        let object = to_dynamic(resource, object)?;
        let replaced = self
            .api(resource, namespace)
            .replace(name, &self.post_params, &object)
            .await
            .context(KubeApiSnafu)?;
        from_dynamic(resource, &replaced)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value> {
        // Carrying the resourceVersion makes the merge patch conditional
        let patch = json!({
            "metadata": {
                "resourceVersion": object.pointer("/metadata/resourceVersion"),
            },
            "status": object.get("status"),
        });
        let patched = self
            .api(resource, namespace)
            .patch_status(name, &self.status_patch_params, &Patch::Merge(&patch))
            .await
            .context(KubeApiSnafu)?;
        from_dynamic(resource, &patched)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        self.api(resource, namespace)
            .delete(name, &self.delete_params)
            .await
            .context(KubeApiSnafu)?;
        Ok(())
    }
}

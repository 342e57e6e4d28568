//! Access to the cluster objects the reconcilers read and write.
//!
//! Reconcilers only ever talk to an [`ObjectStore`]. [`KubeStore`] backs it
//! with the API server; [`crate::memory::MemoryStore`] keeps everything in
//! memory for tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, PostParams, Preconditions},
    core::Selector,
};
use tracing::debug;

use crate::crds::SharingSecret;
use crate::error::{Error, Result, is_conflict, is_not_found};

/// Typed read/write access to the objects the controllers manage.
///
/// Reads return `None` for objects that do not exist. Writes are optimistic:
/// `replace_*` must carry the `resourceVersion` that was read and fails with
/// [`Error::Conflict`] when it is stale.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_sharing_secret(&self, name: &str) -> Result<Option<SharingSecret>>;

    async fn list_sharing_secrets(&self) -> Result<Vec<SharingSecret>>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Lists secrets across all namespaces.
    async fn list_secrets(&self) -> Result<Vec<Secret>>;

    /// Fails with [`Error::AlreadyExists`] when the name is taken.
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Deletes the exact object that was read. A secret that is already gone
    /// counts as deleted.
    async fn delete_secret(&self, secret: &Secret) -> Result<()>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount>;
}

/// Display key used in errors and logs, `namespace/name` or `name`.
pub(crate) fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// [`ObjectStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_sharing_secret(&self, name: &str) -> Result<Option<SharingSecret>> {
        get_opt(&Api::<SharingSecret>::all(self.client.clone()), name).await
    }

    async fn list_sharing_secrets(&self) -> Result<Vec<SharingSecret>> {
        let api = Api::<SharingSecret>::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        get_opt(&Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>> {
        let api = Api::<Namespace>::all(self.client.clone());
        let params = ListParams::default().labels_from(selector);
        Ok(api.list(&params).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(&self.secrets(namespace), name).await
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>> {
        let api = Api::<Secret>::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        match self
            .secrets(&namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(created) => Ok(created),
            Err(e) if is_conflict(&e) => Err(Error::AlreadyExists {
                kind: "Secret",
                key: object_key(secret),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        match self
            .secrets(&namespace)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(e) if is_conflict(&e) => Err(Error::Conflict {
                kind: "Secret",
                key: object_key(secret),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: secret.uid(),
                resource_version: secret.resource_version(),
            }),
            ..DeleteParams::default()
        };
        match self
            .secrets(&namespace)
            .delete(&secret.name_any(), &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(secret = %object_key(secret), "secret already gone");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Err(Error::Conflict {
                kind: "Secret",
                key: object_key(secret),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        get_opt(
            &Api::<ServiceAccount>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        let namespace = sa.namespace().unwrap_or_default();
        let api = Api::<ServiceAccount>::namespaced(self.client.clone(), &namespace);
        match api.replace(&sa.name_any(), &PostParams::default(), sa).await {
            Ok(updated) => Ok(updated),
            Err(e) if is_conflict(&e) => Err(Error::Conflict {
                kind: "ServiceAccount",
                key: object_key(sa),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

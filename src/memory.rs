//! An in-memory [`ObjectStore`] that behaves like the API server where the
//! reconcilers can observe it: resource versions, optimistic concurrency,
//! finalizer-aware deletion and label selection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::{
    Resource, ResourceExt,
    api::ObjectMeta,
    core::{Selector, SelectorExt},
    error::ErrorResponse,
};

use crate::crds::SharingSecret;
use crate::error::{Error, Result};
use crate::store::{ObjectStore, object_key};

type Key = (String, String);

#[derive(Default)]
struct Objects {
    sharing_secrets: BTreeMap<Key, SharingSecret>,
    namespaces: BTreeMap<Key, Namespace>,
    secrets: BTreeMap<Key, Secret>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    version: u64,
    writes: usize,
    fail_next_write: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Objects>,
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

fn not_found(kind: &str, key: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: format!("{kind} \"{key}\" not found"),
        reason: "NotFound".to_owned(),
        code: 404,
    }))
}

/// Assigns a fresh resource version, and a uid if the object has none.
fn stamp<K: Resource>(version: &mut u64, obj: &mut K) {
    *version += 1;
    let meta = obj.meta_mut();
    meta.resource_version = Some(version.to_string());
    if meta.uid.is_none() {
        meta.uid = Some(format!("uid-{version}"));
    }
}

fn is_terminating_without_finalizers(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().is_none_or(Vec::is_empty)
}

fn create_in<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    version: &mut u64,
    kind: &'static str,
    obj: &K,
) -> Result<K> {
    let k = key_of(obj);
    if map.contains_key(&k) {
        return Err(Error::AlreadyExists {
            kind,
            key: object_key(obj),
        });
    }
    let mut created = obj.clone();
    created.meta_mut().uid = None;
    created.meta_mut().creation_timestamp = Some(Time(Utc::now()));
    stamp(version, &mut created);
    map.insert(k, created.clone());
    Ok(created)
}

fn replace_in<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    version: &mut u64,
    kind: &'static str,
    obj: &K,
) -> Result<K> {
    let k = key_of(obj);
    let Some(current) = map.get(&k) else {
        return Err(not_found(kind, &object_key(obj)));
    };
    if current.meta().resource_version != obj.meta().resource_version {
        return Err(Error::Conflict {
            kind,
            key: object_key(obj),
        });
    }
    let mut updated = obj.clone();
    updated.meta_mut().uid = current.meta().uid.clone();
    updated.meta_mut().creation_timestamp = current.meta().creation_timestamp.clone();
    updated.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
    stamp(version, &mut updated);
    if is_terminating_without_finalizers(updated.meta()) {
        map.remove(&k);
    } else {
        map.insert(k, updated.clone());
    }
    Ok(updated)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        // A poisoned lock only means a test panicked mid-write.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_write(objects: &mut Objects, kind: &'static str, key: String) -> Result<()> {
        if std::mem::take(&mut objects.fail_next_write) {
            return Err(Error::Conflict { kind, key });
        }
        objects.writes += 1;
        Ok(())
    }

    /// Number of writes issued through [`ObjectStore`].
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes the next write through [`ObjectStore`] fail with a conflict.
    pub fn fail_next_write(&self) {
        self.lock().fail_next_write = true;
    }

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let mut objects = self.lock();
        let mut ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        let Objects {
            namespaces,
            version,
            ..
        } = &mut *objects;
        stamp(version, &mut ns);
        namespaces.insert(key("", name), ns);
    }

    pub fn remove_namespace(&self, name: &str) {
        self.lock().namespaces.remove(&key("", name));
    }

    /// Stores a service account named `name` with an empty pull secret list.
    pub fn add_service_account(&self, namespace: &str, name: &str) {
        let mut sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        };
        let mut objects = self.lock();
        let Objects {
            service_accounts,
            version,
            ..
        } = &mut *objects;
        stamp(version, &mut sa);
        service_accounts.insert(key(namespace, name), sa);
    }

    /// Creates or overwrites a `SharingSecret` without counting it as a write.
    pub fn put_sharing_secret(&self, share: SharingSecret) -> SharingSecret {
        let mut objects = self.lock();
        let Objects {
            sharing_secrets,
            version,
            ..
        } = &mut *objects;
        let k = key_of(&share);
        let mut share = share;
        share.meta_mut().uid = sharing_secrets.get(&k).and_then(|s| s.uid());
        stamp(version, &mut share);
        sharing_secrets.insert(k, share.clone());
        share
    }

    pub fn remove_sharing_secret(&self, name: &str) {
        self.lock().sharing_secrets.remove(&key("", name));
    }

    /// Creates or overwrites a secret without counting it as a write.
    pub fn put_secret(&self, secret: Secret) -> Secret {
        let mut objects = self.lock();
        let Objects {
            secrets, version, ..
        } = &mut *objects;
        let k = key_of(&secret);
        let mut secret = secret;
        if let Some(current) = secrets.get(&k) {
            secret.metadata.uid = current.uid();
            secret.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        }
        stamp(version, &mut secret);
        secrets.insert(k, secret.clone());
        secret
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.lock().secrets.values().cloned().collect()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.lock()
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_sharing_secret(&self, name: &str) -> Result<Option<SharingSecret>> {
        Ok(self.lock().sharing_secrets.get(&key("", name)).cloned())
    }

    async fn list_sharing_secrets(&self) -> Result<Vec<SharingSecret>> {
        Ok(self.lock().sharing_secrets.values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.lock().namespaces.get(&key("", name)).cloned())
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>> {
        Ok(self
            .lock()
            .namespaces
            .values()
            .filter(|ns| selector.matches(ns.labels()))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>> {
        Ok(self.secrets())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut objects = self.lock();
        Self::begin_write(&mut objects, "Secret", object_key(secret))?;
        let Objects {
            secrets, version, ..
        } = &mut *objects;
        create_in(secrets, version, "Secret", secret)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut objects = self.lock();
        Self::begin_write(&mut objects, "Secret", object_key(secret))?;
        let Objects {
            secrets, version, ..
        } = &mut *objects;
        replace_in(secrets, version, "Secret", secret)
    }

    async fn delete_secret(&self, secret: &Secret) -> Result<()> {
        let mut objects = self.lock();
        Self::begin_write(&mut objects, "Secret", object_key(secret))?;
        let Objects {
            secrets, version, ..
        } = &mut *objects;
        let k = key_of(secret);
        let Some(current) = secrets.get_mut(&k) else {
            return Ok(());
        };
        let uid_differs = secret.uid().is_some() && secret.uid() != current.uid();
        let version_differs = secret.resource_version().is_some()
            && secret.resource_version() != current.resource_version();
        if uid_differs || version_differs {
            return Err(Error::Conflict {
                kind: "Secret",
                key: object_key(secret),
            });
        }
        if current.finalizers().is_empty() {
            secrets.remove(&k);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(Utc::now()));
            stamp(version, current);
        }
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self.service_account(namespace, name))
    }

    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        let mut objects = self.lock();
        Self::begin_write(&mut objects, "ServiceAccount", object_key(sa))?;
        let Objects {
            service_accounts,
            version,
            ..
        } = &mut *objects;
        replace_in(service_accounts, version, "ServiceAccount", sa)
    }
}

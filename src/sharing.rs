//! Keeps copies of a `SharingSecret`'s source secret in every target namespace.
//!
//! Every pass recomputes the target namespaces from scratch, deletes owned
//! copies outside of them, then creates or updates a copy in each target.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crds::{DEFAULT_PULL_SECRET_ANNOTATION, SHARING_SECRET_REF_LABEL, SharingSecret};
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::targets::resolve_targets;

/// What to do about the copy of the source secret in one target namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyPlan {
    Create(Secret),
    Update(Secret),
    Unchanged,
    /// A secret with the same name exists and belongs to someone else.
    NotOwned,
}

/// Whether `obj` has a controller owner reference pointing at `owner`.
pub fn is_controlled_by<K: Resource>(obj: &K, owner: &SharingSecret) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    obj.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

// The API server drops empty maps, so absent and empty are the same thing.
fn same_map<V: PartialEq>(a: &Option<BTreeMap<String, V>>, b: &Option<BTreeMap<String, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

fn content_differs(source: &Secret, copy: &Secret) -> bool {
    !same_map(&source.metadata.labels, &copy.metadata.labels)
        || !same_map(&source.metadata.annotations, &copy.metadata.annotations)
        || source.type_ != copy.type_
        || !same_map(&source.data, &copy.data)
}

/// Builds a fresh copy of `source` in `namespace`, controlled by `owner`.
pub fn build_copy(source: &Secret, owner: &SharingSecret, namespace: &str) -> Result<Secret> {
    let owner_ref = owner
        .controller_owner_ref(&())
        .filter(|r| !r.uid.is_empty())
        .ok_or_else(|| Error::MissingUid(owner.name_any()))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(source.name_any()),
            namespace: Some(namespace.to_owned()),
            labels: source.metadata.labels.clone(),
            annotations: source.metadata.annotations.clone(),
            owner_references: Some(vec![owner_ref]),
            ..ObjectMeta::default()
        },
        data: source.data.clone(),
        type_: source.type_.clone(),
        ..Secret::default()
    })
}

/// Decides how the copy in `namespace` has to change given what exists there.
pub fn plan_copy(
    source: &Secret,
    owner: &SharingSecret,
    namespace: &str,
    existing: Option<&Secret>,
) -> Result<CopyPlan> {
    let Some(existing) = existing else {
        return build_copy(source, owner, namespace).map(CopyPlan::Create);
    };
    if !is_controlled_by(existing, owner) {
        return Ok(CopyPlan::NotOwned);
    }
    if !content_differs(source, existing) {
        return Ok(CopyPlan::Unchanged);
    }

    let mut updated = existing.clone();
    updated.metadata.labels = source.metadata.labels.clone();
    updated.metadata.annotations = source.metadata.annotations.clone();
    updated.type_ = source.type_.clone();
    updated.data = source.data.clone();
    Ok(CopyPlan::Update(updated))
}

/// Owned copies living outside of `targets`, skipping those already on their way out.
pub fn stale_copies<'a>(
    secrets: &'a [Secret],
    owner: &SharingSecret,
    targets: &BTreeSet<String>,
) -> Vec<&'a Secret> {
    secrets
        .iter()
        .filter(|s| is_controlled_by(*s, owner))
        .filter(|s| s.metadata.deletion_timestamp.is_none())
        .filter(|s| !s.namespace().is_some_and(|ns| targets.contains(&ns)))
        .collect()
}

/// The source with its back reference label set, if it needs writing.
pub fn with_share_ref(source: &Secret, share: &SharingSecret) -> Option<Secret> {
    let name = share.name_any();
    if source.labels().get(SHARING_SECRET_REF_LABEL) == Some(&name) {
        return None;
    }
    let mut updated = source.clone();
    updated
        .labels_mut()
        .insert(SHARING_SECRET_REF_LABEL.to_owned(), name);
    Some(updated)
}

/// The source with its default pull secret annotation matching the share's
/// intent, if it needs writing. An unset intent removes the annotation.
pub fn with_pull_secret_intent(source: &Secret, share: &SharingSecret) -> Option<Secret> {
    let wanted = share.default_pull_secret();
    let current = source
        .annotations()
        .get(DEFAULT_PULL_SECRET_ANNOTATION)
        .map(String::as_str);
    if current == wanted {
        return None;
    }

    let mut updated = source.clone();
    match wanted {
        Some(value) => {
            updated
                .annotations_mut()
                .insert(DEFAULT_PULL_SECRET_ANNOTATION.to_owned(), value.to_owned());
        }
        None => {
            updated
                .annotations_mut()
                .remove(DEFAULT_PULL_SECRET_ANNOTATION);
        }
    }
    Some(updated)
}

pub struct SharingReconciler<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> SharingReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Converges everything owned by the `SharingSecret` called `name`.
    #[instrument(skip(self), fields(sharingsecret = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let Some(share) = self.store.get_sharing_secret(name).await? else {
            debug!("SharingSecret is gone, owned copies are garbage collected");
            return Ok(());
        };

        self.sync(&share).await.inspect_err(|e| {
            warn!(error = %e, "failed to sync SharingSecret");
        })
    }

    async fn sync(&self, share: &SharingSecret) -> Result<()> {
        let targets = resolve_targets(self.store.as_ref(), &share.spec.target).await?;

        self.cleanup(share, &targets).await?;

        let source_ref = &share.spec.secret_ref;
        let Some(mut source) = self
            .store
            .get_secret(&source_ref.namespace, &source_ref.name)
            .await?
        else {
            info!(
                namespace = %source_ref.namespace,
                secret = %source_ref.name,
                "source secret not found, waiting for it to appear"
            );
            return Ok(());
        };

        if let Some(updated) = with_share_ref(&source, share) {
            source = self.store.replace_secret(&updated).await?;
            debug!(secret = %source_ref.name, "labelled source secret");
        }

        if let Some(updated) = with_pull_secret_intent(&source, share) {
            source = self.store.replace_secret(&updated).await?;
            debug!(secret = %source_ref.name, "updated default pull secret annotation");
        }

        for namespace in &targets {
            self.create_or_update_copy(&source, share, namespace)
                .await?;
        }

        Ok(())
    }

    async fn cleanup(&self, share: &SharingSecret, targets: &BTreeSet<String>) -> Result<()> {
        let secrets = self.store.list_secrets().await?;
        for stale in stale_copies(&secrets, share, targets) {
            self.store.delete_secret(stale).await.inspect_err(|e| {
                warn!(
                    namespace = ?stale.namespace(),
                    secret = %stale.name_any(),
                    error = %e,
                    "failed to clean up copy"
                );
            })?;
            info!(
                namespace = ?stale.namespace(),
                secret = %stale.name_any(),
                "deleted copy outside of target namespaces"
            );
        }
        Ok(())
    }

    async fn create_or_update_copy(
        &self,
        source: &Secret,
        owner: &SharingSecret,
        namespace: &str,
    ) -> Result<()> {
        let name = source.name_any();
        let existing = self.store.get_secret(namespace, &name).await?;

        match plan_copy(source, owner, namespace, existing.as_ref())? {
            CopyPlan::Create(copy) => {
                if self.store.get_namespace(namespace).await?.is_none() {
                    debug!(namespace, "target namespace does not exist, skipping");
                    return Ok(());
                }
                self.store.create_secret(&copy).await?;
                info!(namespace, secret = %name, "created copy");
            }
            CopyPlan::Update(copy) => {
                self.store.replace_secret(&copy).await?;
                info!(namespace, secret = %name, "updated copy");
            }
            CopyPlan::Unchanged => {}
            CopyPlan::NotOwned => {
                warn!(
                    namespace,
                    secret = %name,
                    "secret exists and is not owned by this SharingSecret, leaving it alone"
                );
            }
        }
        Ok(())
    }
}

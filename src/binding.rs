//! Keeps a shared secret's membership in its namespace's default service
//! account `imagePullSecrets` in line with its default pull secret annotation.
//!
//! Managed secrets carry [`CLEANUP_FINALIZER`] so the membership is removed
//! before the secret itself can disappear.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crds::{
    CLEANUP_FINALIZER, DEFAULT_PULL_SECRET_ANNOTATION, DEFAULT_SERVICE_ACCOUNT, SharingSecret,
};
use crate::error::Result;
use crate::store::ObjectStore;

/// Only secrets owned by exactly one `SharingSecret` are managed.
pub fn is_managed(secret: &Secret) -> bool {
    match secret.owner_references() {
        [owner] => owner.kind == SharingSecret::kind(&()),
        _ => false,
    }
}

pub fn is_default_pull_secret(secret: &Secret) -> bool {
    secret
        .annotations()
        .get(DEFAULT_PULL_SECRET_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn has_finalizer(secret: &Secret) -> bool {
    secret.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

fn references(sa: &ServiceAccount, secret_name: &str) -> bool {
    sa.image_pull_secrets
        .iter()
        .flatten()
        .any(|r| r.name == secret_name)
}

/// The service account with `secret_name` added to or removed from its pull
/// secrets, if membership has to change. Removal drops the first match only.
pub fn plan_binding(sa: &ServiceAccount, secret_name: &str, wanted: bool) -> Option<ServiceAccount> {
    let present = references(sa, secret_name);
    if wanted == present {
        return None;
    }

    let mut updated = sa.clone();
    let refs = updated.image_pull_secrets.get_or_insert_with(Vec::new);
    if wanted {
        refs.push(LocalObjectReference {
            name: secret_name.to_owned(),
        });
    } else if let Some(pos) = refs.iter().position(|r| r.name == secret_name) {
        refs.remove(pos);
    }
    Some(updated)
}

pub struct BindingReconciler<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> BindingReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(mut secret) = self.store.get_secret(namespace, name).await? else {
            return Ok(());
        };
        if !is_managed(&secret) {
            return Ok(());
        }

        if secret.meta().deletion_timestamp.is_none() {
            if !has_finalizer(&secret) {
                secret.finalizers_mut().push(CLEANUP_FINALIZER.to_owned());
                self.store.replace_secret(&secret).await?;
                debug!("added cleanup finalizer");
                return Ok(());
            }
        } else {
            if has_finalizer(&secret) {
                self.cleanup(&secret).await.inspect_err(|e| {
                    warn!(error = %e, "failed to unbind default pull secret");
                })?;
                secret.finalizers_mut().retain(|f| f != CLEANUP_FINALIZER);
                self.store.replace_secret(&secret).await?;
                debug!("removed cleanup finalizer");
            }
            return Ok(());
        }

        let Some(sa) = self
            .store
            .get_service_account(namespace, DEFAULT_SERVICE_ACCOUNT)
            .await?
        else {
            debug!("default service account not found, skipping");
            return Ok(());
        };

        if let Some(updated) = plan_binding(&sa, name, is_default_pull_secret(&secret)) {
            self.store.replace_service_account(&updated).await?;
        }

        info!("default image pull secret successfully synced");
        Ok(())
    }

    /// Removes the secret from the default service account's pull secrets.
    /// Safe to call when it was never added.
    async fn cleanup(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let Some(sa) = self
            .store
            .get_service_account(&namespace, DEFAULT_SERVICE_ACCOUNT)
            .await?
        else {
            return Ok(());
        };

        if let Some(updated) = plan_binding(&sa, &secret.name_any(), false) {
            self.store.replace_service_account(&updated).await?;
            info!("removed secret from default image pull secrets");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    use super::*;

    fn sa(refs: &[&str]) -> ServiceAccount {
        ServiceAccount {
            image_pull_secrets: Some(
                refs.iter()
                    .map(|n| LocalObjectReference {
                        name: (*n).to_owned(),
                    })
                    .collect(),
            ),
            ..ServiceAccount::default()
        }
    }

    fn names(sa: &ServiceAccount) -> Vec<&str> {
        sa.image_pull_secrets
            .iter()
            .flatten()
            .map(|r| r.name.as_str())
            .collect()
    }

    fn owned_by(kinds: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                owner_references: Some(
                    kinds
                        .iter()
                        .map(|k| OwnerReference {
                            kind: (*k).to_owned(),
                            ..OwnerReference::default()
                        })
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[test]
    fn binding_adds_once() {
        let added = plan_binding(&sa(&["other"]), "creds", true).unwrap();
        assert_eq!(names(&added), ["other", "creds"]);
        assert!(plan_binding(&added, "creds", true).is_none());
    }

    #[test]
    fn binding_removes_first_match() {
        let removed = plan_binding(&sa(&["creds", "other", "creds"]), "creds", false).unwrap();
        assert_eq!(names(&removed), ["other", "creds"]);
    }

    #[test]
    fn unbinding_absent_secret_is_a_noop() {
        assert!(plan_binding(&sa(&[]), "creds", false).is_none());
        assert!(plan_binding(&ServiceAccount::default(), "creds", false).is_none());
    }

    #[test]
    fn only_single_sharing_secret_owner_is_managed() {
        assert!(is_managed(&owned_by(&["SharingSecret"])));
        assert!(!is_managed(&owned_by(&[])));
        assert!(!is_managed(&owned_by(&["Deployment"])));
        assert!(!is_managed(&owned_by(&["SharingSecret", "SharingSecret"])));
    }
}

//! Resolution of the namespaces a `SharingSecret` shares into.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::Selector;

use crate::crds::{SharingSecret, SharingTarget};
use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub fn parse_selector(selector: &LabelSelector) -> Result<Selector> {
    Selector::try_from(selector.clone()).map_err(|e| Error::InvalidSelector(e.to_string()))
}

/// Computes the set of namespace names currently selected by `target`.
///
/// An explicit namespace list wins over the selector and is returned as is,
/// whether or not those namespaces exist.
pub async fn resolve_targets<S: ObjectStore + ?Sized>(
    store: &S,
    target: &SharingTarget,
) -> Result<BTreeSet<String>> {
    if !target.namespaces.is_empty() {
        return Ok(target.namespaces.iter().map(|n| n.name.clone()).collect());
    }

    let Some(selector) = &target.namespace_selector else {
        return Ok(BTreeSet::new());
    };
    let selector = parse_selector(selector)?;
    Ok(store
        .list_namespaces(&selector)
        .await?
        .iter()
        .map(ResourceExt::name_any)
        .collect())
}

/// Whether a change to `namespace` may affect what `share` should be doing.
///
/// Selector based shares are always affected: a label change can remove a
/// namespace that matched before, and the new labels no longer show it.
pub fn affected_by_namespace(share: &SharingSecret, namespace: &Namespace) -> bool {
    let target = &share.spec.target;
    if !target.namespaces.is_empty() {
        let name = namespace.name_any();
        return target.namespaces.iter().any(|n| n.name == name);
    }
    target.namespace_selector.is_some()
}

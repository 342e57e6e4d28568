use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label written on source secrets (and mirrored onto their copies) naming the
/// `SharingSecret` that shares them.
pub const SHARING_SECRET_REF_LABEL: &str = "homerow.ca/sharingsecret-ref";

/// Annotation declaring that a secret should be one of the default image pull
/// secrets of its namespace.
pub const DEFAULT_PULL_SECRET_ANNOTATION: &str = "homerow.ca/is-default-image-pull-secret";

/// Finalizer held on shared secrets until their pull secret binding is undone.
pub const CLEANUP_FINALIZER: &str = "homerow.ca/cleanup";

/// The service account whose `imagePullSecrets` receive default pull secrets.
///
/// This is a fixed name, it is not configurable per `SharingSecret`.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct NamespaceRef {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharingTarget {
    /// Explicit namespaces to share into. Takes precedence over the selector.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<NamespaceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "homerow.ca",
    version = "v1alpha1",
    kind = "SharingSecret",
    shortname = "shs"
)]
pub struct SharingSecretSpec {
    pub secret_ref: SecretRef,
    #[serde(default)]
    pub target: SharingTarget,
}

impl SharingSecret {
    /// The declared default pull secret intent, `None` when unset or empty.
    pub fn default_pull_secret(&self) -> Option<&str> {
        self.annotations()
            .get(DEFAULT_PULL_SECRET_ANNOTATION)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

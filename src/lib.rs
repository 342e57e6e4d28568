//! Shares a secret into many namespaces as declared by `SharingSecret`
//! resources, and keeps shared image pull secrets bound to the default
//! service account of each namespace they land in.

use kube::{Client, config::KubeConfigOptions};

pub mod backoff;
pub mod binding;
pub mod config;
pub mod controller;
pub mod crds;
pub mod error;
pub mod memory;
pub mod sharing;
pub mod store;
pub mod targets;

pub use config::Config;
pub use error::{Error, Result};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let config_source = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(config_source)?;

    controller::run_controllers(client, config).await;

    Ok(())
}

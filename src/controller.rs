//! Wiring of the reconcilers into `kube::runtime` controllers.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{debug, info, warn};

use crate::backoff::ErrorBackoff;
use crate::binding::BindingReconciler;
use crate::config::Config;
use crate::crds::{SHARING_SECRET_REF_LABEL, SharingSecret};
use crate::error::{Error, Result};
use crate::sharing::SharingReconciler;
use crate::store::{KubeStore, ObjectStore};
use crate::targets::affected_by_namespace;

/// State shared by every reconcile of both controllers.
pub struct Context<S> {
    pub sharing: SharingReconciler<S>,
    pub binding: BindingReconciler<S>,
    pub backoff: ErrorBackoff,
    pub config: Config,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Self {
            sharing: SharingReconciler::new(store.clone()),
            binding: BindingReconciler::new(store),
            backoff: ErrorBackoff::new(config.error_backoff_base(), config.error_backoff_max()),
            config,
        }
    }

    async fn with_deadline(&self, pass: impl Future<Output = Result<()>>) -> Result<()> {
        let timeout = self.config.reconcile_timeout();
        tokio::time::timeout(timeout, pass)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    fn done(&self, key: &str) -> Action {
        self.backoff.reset(key);
        Action::requeue(self.config.resync_period())
    }

    fn retry(&self, key: &str, err: &Error) -> Action {
        let delay = self.backoff.next_delay(key);
        warn!(object = key, error = %err, retry_in = ?delay, "reconcile failed");
        Action::requeue(delay)
    }
}

fn share_key(share: &SharingSecret) -> String {
    format!("SharingSecret/{}", share.name_any())
}

fn secret_key(secret: &Secret) -> String {
    format!(
        "Secret/{}/{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    )
}

pub async fn reconcile_sharing<S: ObjectStore>(
    share: Arc<SharingSecret>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    ctx.with_deadline(ctx.sharing.reconcile(&share.name_any()))
        .await?;
    Ok(ctx.done(&share_key(&share)))
}

pub fn sharing_error_policy<S: ObjectStore>(
    share: Arc<SharingSecret>,
    err: &Error,
    ctx: Arc<Context<S>>,
) -> Action {
    ctx.retry(&share_key(&share), err)
}

pub async fn reconcile_secret<S: ObjectStore>(
    secret: Arc<Secret>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let namespace = secret.namespace().unwrap_or_default();
    ctx.with_deadline(ctx.binding.reconcile(&namespace, &secret.name_any()))
        .await?;
    Ok(ctx.done(&secret_key(&secret)))
}

pub fn secret_error_policy<S: ObjectStore>(
    secret: Arc<Secret>,
    err: &Error,
    ctx: Arc<Context<S>>,
) -> Action {
    ctx.retry(&secret_key(&secret), err)
}

/// Runs the SharingSecret and Secret controllers until shutdown is signalled.
pub async fn run_controllers(client: Client, config: Config) {
    let controller_config = controller::Config::default().concurrency(config.concurrency);
    let store = Arc::new(KubeStore::new(client.clone()));
    let ctx = Arc::new(Context::new(store, config));

    let shares = Api::<SharingSecret>::all(client.clone());
    let secrets = Api::<Secret>::all(client.clone());
    let namespaces = Api::<Namespace>::all(client);
    let shared_secrets = watcher::Config::default().labels(SHARING_SECRET_REF_LABEL);

    let sharing = Controller::new(shares, watcher::Config::default())
        .with_config(controller_config.clone());
    let known_shares = sharing.store();

    let sharing = sharing
        .watches(secrets.clone(), shared_secrets.clone(), |secret| {
            secret
                .labels()
                .get(SHARING_SECRET_REF_LABEL)
                .map(|name| ObjectRef::<SharingSecret>::new(name))
        })
        .watches(namespaces, watcher::Config::default(), move |namespace| {
            known_shares
                .state()
                .into_iter()
                .filter(|share| affected_by_namespace(share, &namespace))
                .map(|share| ObjectRef::from_obj(share.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_sharing, sharing_error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj, "reconciled SharingSecret"),
                Err(e) => warn!(error = %e, "SharingSecret controller error"),
            }
        });

    let binding = Controller::new(secrets, shared_secrets)
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile_secret, secret_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj, "reconciled Secret"),
                Err(e) => warn!(error = %e, "Secret controller error"),
            }
        });

    info!("starting SharingSecret and Secret controllers");
    futures::join!(sharing, binding);
}

use std::time::Duration;

use k8s_openapi::{
    api::core::v1::{Namespace, Secret, ServiceAccount},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    Api, Client, CustomResourceExt, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams},
    config::KubeConfigOptions,
};
use secret_sync::{Config, crds::*};
use tokio::{sync::OnceCell, time::sleep};
use tokio_retry2::{Retry, RetryError, strategy::ExponentialBackoff};

static ONCE_CLIENT: OnceCell<anyhow::Result<Client>> = OnceCell::const_new();

async fn init() -> &'static Client {
    async fn init_fun() -> anyhow::Result<Client> {
        tracing_subscriber::fmt().init();

        let options = KubeConfigOptions::default();
        let config = kube::Config::from_kubeconfig(&options).await?;

        let cluster_host = config.cluster_url.host().expect("Cluster URL has host");
        if !["localhost", "127.0.0.1"].contains(&cluster_host) {
            panic!("Danger! Cluster URL isn't local.");
        }

        let client = Client::try_from(config)?;

        let crd_api = kube::Api::<CustomResourceDefinition>::all(client.clone());

        crd_api
            .patch(
                "sharingsecrets.homerow.ca",
                &PatchParams::apply("test"),
                &Patch::Apply(SharingSecret::crd()),
            )
            .await?;

        sleep(Duration::from_secs(5)).await;

        let config = Config {
            resync_secs: 5,
            ..Config::default()
        };
        tokio::spawn(secret_sync::run(config));

        Ok(client)
    }

    ONCE_CLIENT.get_or_init(init_fun).await.as_ref().unwrap()
}

async fn setup_manifests() -> (SharingSecret, Secret) {
    let client = init().await;

    let ns_api = kube::Api::<Namespace>::all(client.clone());
    for ns in ["ns-one", "ns-two", "ns-three"] {
        ns_api
            .patch(
                ns,
                &PatchParams::apply("test"),
                &Patch::Apply(Namespace {
                    metadata: ObjectMeta {
                        name: Some(ns.to_owned()),
                        ..ObjectMeta::default()
                    },
                    ..Namespace::default()
                }),
            )
            .await
            .expect("Failed to create namespace");
    }

    let share_api = kube::Api::<SharingSecret>::all(client.clone());

    let sharer = serde_yaml::from_str::<SharingSecret>(include_str!("./manifests/sharer.yaml"))
        .expect("Unable to deserialize SharingSecret manifest");

    share_api
        .patch(
            &sharer.name_any(),
            &PatchParams::apply("test"),
            &Patch::Apply(sharer.clone()),
        )
        .await
        .expect("Unable to patch SharingSecret");

    let secret_api =
        kube::Api::<Secret>::namespaced(client.clone(), &sharer.spec.secret_ref.namespace);
    let secret = serde_yaml::from_str::<Secret>(include_str!("./manifests/secret.yaml"))
        .expect("Unable to deserialize Secret manifest");

    secret_api
        .patch(
            &secret.name_any(),
            &PatchParams::apply("test"),
            &Patch::Apply(secret.clone()),
        )
        .await
        .expect("Unable to patch Secret");

    (sharer, secret)
}

#[tokio::test]
#[ignore = "requires a local k3s cluster"]
async fn secrets_share_and_bind() {
    let client = init().await;

    let (sharer, secret) = setup_manifests().await;
    let targets: Vec<String> = sharer
        .spec
        .target
        .namespaces
        .iter()
        .map(|n| n.name.clone())
        .collect();

    let retry_strategy = ExponentialBackoff::from_millis(10)
        .map(tokio_retry2::strategy::jitter)
        .take(6);

    Retry::spawn(
        retry_strategy.clone(),
        async || -> Result<(), RetryError<()>> {
            for target in targets.iter() {
                let secret_api = Api::<Secret>::namespaced(client.clone(), target);
                validate_secret_shared(&secret_api, &secret).await?;

                let sa_api = Api::<ServiceAccount>::namespaced(client.clone(), target);
                validate_bound(&sa_api, &secret, true).await?;
            }

            Ok(())
        },
    )
    .await
    .expect("Failure sharing secrets");

    let unlisted = Api::<Secret>::namespaced(client.clone(), "ns-three");
    validate_secret_deleted(&unlisted, &secret)
        .await
        .expect("Secret shared into an unlisted namespace");

    delete_sharer(client, &sharer.name_any()).await;

    Retry::spawn(
        retry_strategy.clone(),
        async || -> Result<(), RetryError<()>> {
            for target in targets.iter() {
                let secret_api = Api::<Secret>::namespaced(client.clone(), target);
                validate_secret_deleted(&secret_api, &secret).await?;

                let sa_api = Api::<ServiceAccount>::namespaced(client.clone(), target);
                validate_bound(&sa_api, &secret, false).await?;
            }

            Ok(())
        },
    )
    .await
    .expect("Owned secrets not successfully cleaned up");
}

async fn delete_sharer(client: &Client, name: &str) {
    let share_api = kube::Api::<SharingSecret>::all(client.clone());
    share_api
        .delete(name, &DeleteParams::foreground())
        .await
        .expect("Unable to delete SharingSecret");
}

async fn validate_secret_shared(
    secret_api: &Api<Secret>,
    secret: &Secret,
) -> Result<(), RetryError<()>> {
    match secret_api.get(&secret.name_any()).await {
        Ok(s) => {
            assert_eq!(s.data, secret.data);
            assert_eq!(s.type_, secret.type_);
            assert_eq!(s.owner_references().len(), 1);
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            return Err(RetryError::transient(()));
        }
        Err(e) => panic!("Unable to get secret: {}", e),
    }
    Ok(())
}

async fn validate_bound(
    sa_api: &Api<ServiceAccount>,
    secret: &Secret,
    bound: bool,
) -> Result<(), RetryError<()>> {
    let sa = match sa_api.get(DEFAULT_SERVICE_ACCOUNT).await {
        Ok(sa) => sa,
        Err(kube::Error::Api(e)) if e.code == 404 => return Err(RetryError::transient(())),
        Err(e) => panic!("Unable to get service account: {}", e),
    };
    let present = sa
        .image_pull_secrets
        .iter()
        .flatten()
        .filter(|r| r.name == secret.name_any())
        .count();
    if present == usize::from(bound) {
        Ok(())
    } else {
        Err(RetryError::transient(()))
    }
}

async fn validate_secret_deleted(
    secret_api: &Api<Secret>,
    secret: &Secret,
) -> Result<(), RetryError<()>> {
    match secret_api.get(&secret.name_any()).await {
        Ok(_) => Err(RetryError::transient(())),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => panic!("Unable to get secret: {}", e),
    }
}

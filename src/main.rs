use clap::Parser;
use kube::CustomResourceExt;
use secret_sync::{Config, crds::SharingSecret};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the controllers against the current cluster
    Run(Config),
    /// Print the SharingSecret CustomResourceDefinition
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Crds => {
            println!("{}", serde_yaml::to_string(&SharingSecret::crd())?);
        }
        Args::Run(config) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "secret_sync=info".into()),
                )
                .init();

            secret_sync::run(config).await?;
        }
    };

    Ok(())
}

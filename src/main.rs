//! tm: deploy Knative services.
use crate::Error::*;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use log::{debug, error, info};
use std::path::PathBuf;
use thiserror::Error;
use tm::config;
use tm::deploy::{self, Cluster, Request};
use tm::knative::{BuildTemplate, Service};
use tm::source::{self, Source};
use tm::store::DryRun;

/// Deploy and manage Knative services.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Namespace to deploy into. Defaults to the configuration file's namespace.
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Registry that built images are pushed to.
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Print the objects instead of sending them to the cluster.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deploy knative service.
    #[command(after_help = "Example: tm -n default deploy foo --from-image gcr.io/google-samples/hello-app:1.0")]
    Deploy(DeployArgs),
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// Service name.
    name: String,

    /// Image to deploy.
    #[arg(long)]
    from_image: Option<String>,

    /// Git source URL to deploy.
    #[arg(long)]
    from_source: Option<String>,

    /// Git revision (branch, tag, commit SHA or ref) to clone, used with --from-source.
    #[arg(long, default_value = "master")]
    revision: String,

    /// Local file path to deploy.
    #[arg(long)]
    from_file: Option<PathBuf>,

    /// File source URL to deploy.
    #[arg(long)]
    from_url: Option<String>,

    /// Image pull policy.
    #[arg(long, default_value = "Always")]
    image_pull_policy: String,

    /// Service labels, eg. `--label app:web`.
    #[arg(short, long = "label", value_delimiter = ',')]
    labels: Vec<String>,

    /// Environment variables of the service, eg. `--env foo=bar`.
    #[arg(short, long, value_delimiter = ',')]
    env: Vec<String>,
}

impl DeployArgs {
    fn request(self) -> Result<Request, source::Error> {
        let source = Source::select(source::Flags {
            image: self.from_image,
            git: self.from_source,
            revision: self.revision,
            url: self.from_url,
            file: self.from_file,
        })?;
        Ok(Request {
            name: self.name,
            source,
            pull_policy: self.image_pull_policy,
            labels: self.labels,
            env: self.env,
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error("{0}")]
    Source(#[from] source::Error),

    #[error("kubernetes client: {0}")]
    KubeClient(#[from] kube::Error),

    #[error("deploy: {0}")]
    Deploy(#[from] deploy::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` built-in config.
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether `tm.toml` exists in the working directory.
/// If it does, it is used implicitly.
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "tm.toml";

    let config_file = match &args.config {
        None => std::fs::metadata(DEFAULT_CONFIG_FILE)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then(|| DEFAULT_CONFIG_FILE.to_string()),
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        debug!("Using configuration file {config_file}");
        config::file::File::default_with_user_config_file(&config_file)?
    } else {
        config::file::File::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let cfg_file = read_config(&args)?;
    let cfg = config::runtime::Config::new(&cfg_file, args.namespace.clone(), args.registry.clone())
        .map_err(Config)?;

    match args.command {
        Commands::Deploy(deploy_args) => {
            let request = deploy_args.request()?;
            info!("Deploying {} from {}", request.name, request.source.kind());
            let now = chrono::Local::now();

            if args.dry_run {
                let cluster = Cluster {
                    config_maps: &DryRun,
                    build_templates: &DryRun,
                    services: &DryRun,
                };
                deploy::deploy(&cluster, &cfg, &request, now).await?;
                return Ok(());
            }

            let client = kube::Client::try_default().await.map_err(KubeClient)?;
            let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &cfg.namespace);
            let build_templates: Api<BuildTemplate> =
                Api::namespaced(client.clone(), &cfg.namespace);
            let services: Api<Service> = Api::namespaced(client, &cfg.namespace);
            let cluster = Cluster {
                config_maps: &config_maps,
                build_templates: &build_templates,
                services: &services,
            };
            deploy::deploy(&cluster, &cfg, &request, now).await?;
            Ok(())
        }
    }
}

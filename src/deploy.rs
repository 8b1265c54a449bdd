use crate::config::runtime::Config;
use crate::knative::{BuildTemplate, RunLatestType, Service, ServiceSpec};
use crate::pairs;
use crate::source::Source;
use crate::store::{self, Store};
use crate::templates;
use chrono::{DateTime, Local, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use log::{debug, info, warn};
use thiserror::Error;

/// Extra attempts after an update lost a race against another writer.
const CONFLICT_RETRIES: usize = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("configmap: {0}")]
    ConfigMap(#[source] store::Error),

    #[error("build template: {0}")]
    BuildTemplate(#[source] store::Error),

    #[error("service: {0}")]
    Service(#[source] store::Error),
}

/// Everything the user asked for in one `tm deploy`.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub source: Source,
    pub pull_policy: String,
    pub labels: Vec<String>,
    pub env: Vec<String>,
}

/// The API endpoints a deploy writes to, all scoped to the target namespace.
pub struct Cluster<'a> {
    pub config_maps: &'a dyn Store<ConfigMap>,
    pub build_templates: &'a dyn Store<BuildTemplate>,
    pub services: &'a dyn Store<Service>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

/// Put whatever the source's build needs into the namespace.
async fn provision(cluster: &Cluster<'_>, cfg: &Config, request: &Request) -> Result<(), Error> {
    match &request.source {
        Source::Image(_) => {}
        Source::Git { .. } => {
            templates::ensure_dockerfile_config_map(cluster.config_maps, cfg)
                .await
                .map_err(Error::ConfigMap)?;
            templates::ensure_build_template(cluster.build_templates, &templates::kaniko(cfg))
                .await
                .map_err(Error::BuildTemplate)?;
        }
        Source::Url(_) => {
            templates::ensure_build_template(
                cluster.build_templates,
                &templates::get_and_build(cfg),
            )
            .await
            .map_err(Error::BuildTemplate)?;
        }
        Source::File(path) => {
            let contents = std::fs::read(path).map_err(|err| Error::ReadFile {
                err,
                path: path.display().to_string(),
            })?;
            let config_map = templates::dockerfile_config_map(cfg, &request.name, contents);
            templates::apply_config_map(cluster.config_maps, config_map)
                .await
                .map_err(Error::ConfigMap)?;
            templates::ensure_build_template(cluster.build_templates, &templates::kaniko(cfg))
                .await
                .map_err(Error::BuildTemplate)?;
        }
    }
    Ok(())
}

/// The service object for `request`, stamped with `now`.
pub fn build_service(cfg: &Config, request: &Request, now: DateTime<Local>) -> Service {
    let mut configuration = request.source.configuration(cfg, &request.name);
    let container = &mut configuration.revision_template.spec.container;
    container.image_pull_policy = Some(request.pull_policy.clone());
    container.env = Some(pairs::env(&request.env, now));

    let mut service = Service::new(
        &request.name,
        ServiceSpec {
            run_latest: Some(RunLatestType { configuration }),
        },
    );
    service.metadata.namespace = Some(cfg.namespace.clone());
    service.metadata.creation_timestamp = Some(Time(now.with_timezone(&Utc)));
    service.metadata.labels = Some(pairs::labels(&request.labels, &cfg.created_by));
    service
}

/// Create the service, or update it in place with the stored resource version.
pub async fn reconcile(
    services: &dyn Store<Service>,
    mut service: Service,
) -> Result<Applied, store::Error> {
    let name = service.metadata.name.clone().unwrap_or_default();
    let mut attempt = 0;
    loop {
        let Some(existing) = services.get(&name).await? else {
            services.create(&service).await?;
            return Ok(Applied::Created);
        };
        service.metadata.resource_version = existing.metadata.resource_version;
        match services.replace(&name, &service).await {
            Ok(_) => return Ok(Applied::Updated),
            Err(store::Error::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                attempt += 1;
                warn!("{name} changed while updating, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Provision build prerequisites, then create or update the service.
/// Prerequisites already written stay in place when a later step fails.
pub async fn deploy(
    cluster: &Cluster<'_>,
    cfg: &Config,
    request: &Request,
    now: DateTime<Local>,
) -> Result<Applied, Error> {
    provision(cluster, cfg, request).await?;

    let service = build_service(cfg, request, now);
    debug!("Service object: {service:?}");

    let applied = reconcile(cluster.services, service)
        .await
        .map_err(Error::Service)?;
    match applied {
        Applied::Updated => info!(
            "Service update started. Run \"tm -n {} get revisions\" to see available revisions",
            cfg.namespace
        ),
        Applied::Created => info!(
            "Deployment started. Run \"tm -n {} describe service {}\" to see the details",
            cfg.namespace, request.name
        ),
    }
    Ok(applied)
}

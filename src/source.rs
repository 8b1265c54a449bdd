use crate::config::runtime::Config;
use crate::knative::{
    ArgumentSpec, BuildSpec, ConfigurationSpec, GitSourceSpec, RevisionSpec,
    RevisionTemplateSpec, SourceSpec, TemplateInstantiationSpec,
};
use crate::templates::{DOCKERFILE_MOUNT, GET_AND_BUILD, KANIKO};
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use log::warn;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("nothing to deploy: use one of --from-image, --from-source, --from-url or --from-file")]
    NoSource,
}

/// What the service is deployed from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A ready-made image, no build.
    Image(String),
    /// A Git repository containing a Dockerfile.
    Git { url: String, revision: String },
    /// A Dockerfile downloaded over HTTP.
    Url(String),
    /// A Dockerfile on the local disk.
    File(PathBuf),
}

/// Raw `--from-*` values as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub image: Option<String>,
    pub git: Option<String>,
    pub revision: String,
    pub url: Option<String>,
    pub file: Option<PathBuf>,
}

fn given(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

impl Source {
    /// Pick the source in priority order image, git, url, file.
    pub fn select(flags: Flags) -> Result<Self, Error> {
        let file = flags.file.filter(|path| !path.as_os_str().is_empty());
        let count = [
            given(&flags.image).is_some(),
            given(&flags.git).is_some(),
            given(&flags.url).is_some(),
            file.is_some(),
        ]
        .iter()
        .filter(|given| **given)
        .count();

        let source = if let Some(image) = given(&flags.image) {
            Source::Image(image.to_string())
        } else if let Some(url) = given(&flags.git) {
            Source::Git {
                url: url.to_string(),
                revision: flags.revision,
            }
        } else if let Some(url) = given(&flags.url) {
            Source::Url(url.to_string())
        } else if let Some(path) = file {
            Source::File(path)
        } else {
            return Err(Error::NoSource);
        };

        if count > 1 {
            warn!("Several sources given, deploying from {}", source.kind());
        }
        Ok(source)
    }

    /// Short name of the source, used in log lines and as the
    /// suffix of built image names.
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Image(_) => "image",
            Source::Git { .. } => "source",
            Source::Url(_) => "url",
            Source::File(_) => "file",
        }
    }

    /// Image the revision runs. Built images are named
    /// `{registry}/{namespace}-{name}-{kind}:latest`.
    pub fn image(&self, cfg: &Config, name: &str) -> String {
        match self {
            Source::Image(image) => image.clone(),
            _ => format!(
                "{}/{}-{}-{}:latest",
                cfg.registry,
                cfg.namespace,
                name,
                self.kind()
            ),
        }
    }

    fn build(&self, cfg: &Config, name: &str) -> Option<BuildSpec> {
        let image = ArgumentSpec {
            name: "IMAGE".to_string(),
            value: self.image(cfg, name),
        };
        let custom = || SourceSpec {
            git: None,
            custom: Some(Container {
                image: Some(cfg.images.source.clone()),
                ..Default::default()
            }),
        };
        let (source, template, extra) = match self {
            Source::Image(_) => return None,
            Source::Git { url, revision } => (
                SourceSpec {
                    git: Some(GitSourceSpec {
                        url: url.clone(),
                        revision: revision.clone(),
                    }),
                    custom: None,
                },
                KANIKO,
                None,
            ),
            Source::Url(url) => (
                custom(),
                GET_AND_BUILD,
                Some(ArgumentSpec {
                    name: "URL".to_string(),
                    value: url.clone(),
                }),
            ),
            Source::File(_) => (
                custom(),
                KANIKO,
                Some(ArgumentSpec {
                    name: "DOCKERFILE".to_string(),
                    value: format!("{DOCKERFILE_MOUNT}/{name}"),
                }),
            ),
        };
        Some(BuildSpec {
            source: Some(source),
            template: Some(TemplateInstantiationSpec {
                name: template.to_string(),
                arguments: std::iter::once(image).chain(extra).collect(),
            }),
        })
    }

    /// Configuration for the next revision of service `name`.
    pub fn configuration(&self, cfg: &Config, name: &str) -> ConfigurationSpec {
        ConfigurationSpec {
            build: self.build(cfg, name),
            revision_template: RevisionTemplateSpec {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    annotations: Some(BTreeMap::from([(
                        "sidecar.istio.io/inject".to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: RevisionSpec {
                    container: Container {
                        image: Some(self.image(cfg, name)),
                        ..Default::default()
                    },
                },
            },
        }
    }
}

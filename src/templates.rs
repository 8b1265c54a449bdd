//! Objects a build needs in the namespace before the service can be created.

use crate::config::runtime::Config;
use crate::knative::{BuildTemplate, BuildTemplateSpec, ParameterSpec};
use crate::store::{self, Store};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use log::debug;
use std::collections::BTreeMap;

pub const KANIKO: &str = "kaniko";
pub const GET_AND_BUILD: &str = "getandbuild";
pub const DOCKERFILE_CONFIG_MAP: &str = "dockerfile";
pub const DEFAULT_DOCKERFILE: &str = "/workspace/Dockerfile";
/// Where kaniko sees the `dockerfile` ConfigMap.
pub const DOCKERFILE_MOUNT: &str = "/docker-file";

const DOCKERFILE_VOLUME: &str = "docker-file";

fn parameter(name: &str, default: Option<&str>) -> ParameterSpec {
    ParameterSpec {
        name: name.to_string(),
        description: None,
        default: default.map(str::to_string),
    }
}

fn build_and_push(cfg: &Config) -> Container {
    Container {
        name: "build-and-push".to_string(),
        image: Some(cfg.images.kaniko.clone()),
        args: Some(vec![
            "--dockerfile=${DOCKERFILE}".to_string(),
            "--destination=${IMAGE}".to_string(),
            "--skip-tls-verify".to_string(),
        ]),
        ..Default::default()
    }
}

fn template(name: &str, cfg: &Config, spec: BuildTemplateSpec) -> BuildTemplate {
    let mut template = BuildTemplate::new(name, spec);
    template.metadata.namespace = Some(cfg.namespace.clone());
    template
}

/// Builds `IMAGE` from `DOCKERFILE`, with the `dockerfile` ConfigMap mounted
/// so a locally supplied file can be referenced.
pub fn kaniko(cfg: &Config) -> BuildTemplate {
    template(
        KANIKO,
        cfg,
        BuildTemplateSpec {
            parameters: vec![
                parameter("IMAGE", None),
                parameter("DOCKERFILE", Some(DEFAULT_DOCKERFILE)),
            ],
            steps: vec![Container {
                volume_mounts: Some(vec![VolumeMount {
                    name: DOCKERFILE_VOLUME.to_string(),
                    mount_path: DOCKERFILE_MOUNT.to_string(),
                    ..Default::default()
                }]),
                ..build_and_push(cfg)
            }],
            volumes: vec![Volume {
                name: DOCKERFILE_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: DOCKERFILE_CONFIG_MAP.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        },
    )
}

/// Downloads `URL` to `DOCKERFILE`, then builds `IMAGE` from it.
pub fn get_and_build(cfg: &Config) -> BuildTemplate {
    template(
        GET_AND_BUILD,
        cfg,
        BuildTemplateSpec {
            parameters: vec![
                parameter("URL", None),
                parameter("IMAGE", None),
                parameter("DOCKERFILE", Some(DEFAULT_DOCKERFILE)),
            ],
            steps: vec![
                Container {
                    name: "get".to_string(),
                    image: Some(cfg.images.fetch.clone()),
                    args: Some(vec![
                        "-o".to_string(),
                        "${DOCKERFILE}".to_string(),
                        "${URL}".to_string(),
                    ]),
                    ..Default::default()
                },
                Container {
                    env: Some(vec![EnvVar {
                        name: "DOCKER_CONFIG".to_string(),
                        value: Some("/docker-config".to_string()),
                        ..Default::default()
                    }]),
                    ..build_and_push(cfg)
                },
            ],
            volumes: vec![],
        },
    )
}

/// Create the template unless one with the same name is already there.
/// Returns whether it was created.
pub async fn ensure_build_template(
    templates: &dyn Store<BuildTemplate>,
    template: &BuildTemplate,
) -> Result<bool, store::Error> {
    let name = template.metadata.name.as_deref().unwrap_or_default();
    if templates.get(name).await?.is_some() {
        debug!("{name} template already exists");
        return Ok(false);
    }
    debug!("deploying {name} template");
    match templates.create(template).await {
        Ok(_) => Ok(true),
        Err(store::Error::AlreadyExists(_)) => {
            debug!("{name} template was created concurrently");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// The `dockerfile` ConfigMap holding `contents` under `key`.
/// Anything that is not UTF-8 goes into `binaryData`.
pub fn dockerfile_config_map(cfg: &Config, key: &str, contents: Vec<u8>) -> ConfigMap {
    let (data, binary_data) = match String::from_utf8(contents) {
        Ok(text) => (Some(BTreeMap::from([(key.to_string(), text)])), None),
        Err(err) => (
            None,
            Some(BTreeMap::from([(
                key.to_string(),
                ByteString(err.into_bytes()),
            )])),
        ),
    };
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(DOCKERFILE_CONFIG_MAP.to_string()),
            namespace: Some(cfg.namespace.clone()),
            ..Default::default()
        },
        data,
        binary_data,
        ..Default::default()
    }
}

/// Create the ConfigMap, or replace the existing one carrying its resource version forward.
pub async fn apply_config_map(
    config_maps: &dyn Store<ConfigMap>,
    mut config_map: ConfigMap,
) -> Result<ConfigMap, store::Error> {
    let name = config_map.metadata.name.clone().unwrap_or_default();
    match config_maps.get(&name).await? {
        Some(existing) => {
            config_map.metadata.resource_version = existing.metadata.resource_version;
            config_maps.replace(&name, &config_map).await
        }
        None => config_maps.create(&config_map).await,
    }
}

/// Make sure the `dockerfile` ConfigMap exists for the kaniko volume.
/// An existing one keeps its data, so a Dockerfile from an earlier file deploy survives.
pub async fn ensure_dockerfile_config_map(
    config_maps: &dyn Store<ConfigMap>,
    cfg: &Config,
) -> Result<(), store::Error> {
    if config_maps.get(DOCKERFILE_CONFIG_MAP).await?.is_some() {
        return Ok(());
    }
    let empty = ConfigMap {
        metadata: ObjectMeta {
            name: Some(DOCKERFILE_CONFIG_MAP.to_string()),
            namespace: Some(cfg.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match config_maps.create(&empty).await {
        Ok(_) | Err(store::Error::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Memory;

    #[tokio::test]
    async fn build_template_created_once() {
        let cfg = Config::for_tests();
        let templates = Memory::<BuildTemplate>::new();

        assert!(ensure_build_template(&templates, &kaniko(&cfg)).await.unwrap());
        assert!(!ensure_build_template(&templates, &kaniko(&cfg)).await.unwrap());

        assert_eq!(templates.creates(), 1);
        assert_eq!(templates.gets(), 2);
        assert!(templates.object(KANIKO).is_some());
    }

    #[tokio::test]
    async fn build_template_lookup_failure_propagates() {
        let cfg = Config::for_tests();
        let templates = Memory::<BuildTemplate>::new().failing_get(403);

        let err = ensure_build_template(&templates, &get_and_build(&cfg))
            .await
            .unwrap_err();
        assert!(matches!(err, store::Error::Status { code: 403, .. }));
        assert_eq!(templates.creates(), 0);
    }

    #[test]
    fn kaniko_mounts_dockerfile_config_map() {
        let cfg = Config::for_tests();
        let template = kaniko(&cfg);
        assert_eq!(template.metadata.namespace.as_deref(), Some("testing"));
        let step = &template.spec.steps[0];
        assert_eq!(step.image.as_deref(), Some("gcr.io/kaniko-project/executor"));
        assert_eq!(
            step.volume_mounts.as_ref().unwrap()[0].mount_path,
            DOCKERFILE_MOUNT
        );
        assert_eq!(
            template.spec.volumes[0].config_map.as_ref().unwrap().name,
            DOCKERFILE_CONFIG_MAP
        );
        assert_eq!(
            template.spec.parameters[1].default.as_deref(),
            Some(DEFAULT_DOCKERFILE)
        );
    }

    #[test]
    fn get_and_build_fetches_then_builds() {
        let cfg = Config::for_tests();
        let template = get_and_build(&cfg);
        let steps: Vec<_> = template.spec.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(steps, vec!["get", "build-and-push"]);
        assert_eq!(
            template.spec.steps[0].args.as_deref().unwrap(),
            ["-o", "${DOCKERFILE}", "${URL}"]
        );
        let names: Vec<_> = template.spec.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["URL", "IMAGE", "DOCKERFILE"]);
    }

    #[tokio::test]
    async fn config_map_replaced_with_previous_resource_version() {
        let cfg = Config::for_tests();
        let config_maps =
            Memory::with(vec![dockerfile_config_map(&cfg, "old", b"FROM a".to_vec())]);
        let previous = config_maps.object(DOCKERFILE_CONFIG_MAP).unwrap();

        apply_config_map(&config_maps, dockerfile_config_map(&cfg, "app", b"FROM b".to_vec()))
            .await
            .unwrap();

        assert_eq!(config_maps.creates(), 0);
        assert_eq!(config_maps.replaces(), 1);
        let current = config_maps.object(DOCKERFILE_CONFIG_MAP).unwrap();
        assert_ne!(current.metadata.resource_version, previous.metadata.resource_version);
        assert_eq!(
            current.data.unwrap().get("app").map(String::as_str),
            Some("FROM b")
        );
    }

    #[test]
    fn binary_contents_go_to_binary_data() {
        let cfg = Config::for_tests();
        let config_map = dockerfile_config_map(&cfg, "app", vec![0xff, 0xfe]);
        assert!(config_map.data.is_none());
        assert_eq!(
            config_map.binary_data.unwrap()["app"],
            ByteString(vec![0xff, 0xfe])
        );
    }

    #[tokio::test]
    async fn existing_dockerfile_config_map_left_alone() {
        let cfg = Config::for_tests();
        let config_maps =
            Memory::with(vec![dockerfile_config_map(&cfg, "app", b"FROM a".to_vec())]);

        ensure_dockerfile_config_map(&config_maps, &cfg).await.unwrap();

        assert_eq!(config_maps.creates(), 0);
        assert_eq!(config_maps.replaces(), 0);
        assert!(config_maps.object(DOCKERFILE_CONFIG_MAP).unwrap().data.is_some());
    }

    #[tokio::test]
    async fn config_map_lookup_failure_writes_nothing() {
        let cfg = Config::for_tests();
        let config_maps = Memory::<ConfigMap>::new().failing_get(403);

        let config_map = dockerfile_config_map(&cfg, "app", b"FROM b".to_vec());
        let err = apply_config_map(&config_maps, config_map).await.unwrap_err();
        assert!(matches!(err, store::Error::Status { code: 403, .. }));

        let err = ensure_dockerfile_config_map(&config_maps, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, store::Error::Status { code: 403, .. }));

        assert_eq!(config_maps.gets(), 2);
        assert_eq!(config_maps.creates(), 0);
        assert_eq!(config_maps.replaces(), 0);
    }
}

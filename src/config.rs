pub mod file {
    use serde::Deserialize;
    use serde_inline_default::serde_inline_default;
    use thiserror::Error;

    const DEFAULT_CONFIG: &str = include_str!("../default.toml");

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("read {path}: {err}")]
        ReadFile {
            err: std::io::Error,
            path: String,
        },

        #[error("parse: {0}")]
        Parse(#[from] toml::de::Error),
    }

    /// A tm.toml file.
    #[derive(Deserialize, Debug)]
    pub struct File {
        pub description: Option<String>,
        pub namespace: String,
        pub registry: String,
        pub created_by: String,
        #[serde(default = "Default::default")]
        pub images: Images,
    }

    impl Default for File {
        fn default() -> Self {
            // The default config is compiled into the program, so
            // make sure to test default() to catch panics compile-time.
            toml::from_str(DEFAULT_CONFIG).unwrap()
        }
    }

    impl File {
        /// Merge a user supplied configuration file on top of the built-in defaults.
        /// Keys missing from the user file keep their default values.
        pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
            let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
                err,
                path: path.to_string(),
            })?;
            Self::default_with_user_config(&user)
        }

        pub fn default_with_user_config(user: &str) -> Result<Self, Error> {
            let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
            merge(&mut merged, toml::from_str(user)?);
            Ok(toml::Value::Table(merged).try_into()?)
        }
    }

    fn merge(base: &mut toml::Table, overlay: toml::Table) {
        for (key, value) in overlay {
            let value = match (base.get_mut(&key), value) {
                (Some(toml::Value::Table(inner)), toml::Value::Table(overlay)) => {
                    merge(inner, overlay);
                    continue;
                }
                (_, value) => value,
            };
            base.insert(key, value);
        }
    }

    const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor";
    const FETCH_IMAGE: &str = "index.docker.io/byrnedo/alpine-curl";
    const SOURCE_IMAGE: &str = "registry.hub.docker.com/library/busybox";

    /// Container images used by the build templates.
    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Images {
        /// Builds and pushes the image from a Dockerfile.
        #[serde_inline_default(KANIKO_IMAGE.to_string())]
        pub kaniko: String,
        /// Downloads a Dockerfile over HTTP.
        #[serde_inline_default(FETCH_IMAGE.to_string())]
        pub fetch: String,
        /// Placeholder source step for builds that bring their own Dockerfile.
        #[serde_inline_default(SOURCE_IMAGE.to_string())]
        pub source: String,
    }

    impl Default for Images {
        fn default() -> Self {
            Self {
                kaniko: KANIKO_IMAGE.to_string(),
                fetch: FETCH_IMAGE.to_string(),
                source: SOURCE_IMAGE.to_string(),
            }
        }
    }

}

pub mod runtime {
    use super::file;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("namespace must not be empty")]
        EmptyNamespace,

        #[error("registry must not be empty")]
        EmptyRegistry,
    }

    /// Settings shared by every step of a deploy, read once at startup.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub namespace: String,
        pub registry: String,
        pub created_by: String,
        pub images: file::Images,
    }

    impl Config {
        /// Command line values take precedence over the configuration file.
        pub fn new(
            file: &file::File,
            namespace: Option<String>,
            registry: Option<String>,
        ) -> Result<Self, Error> {
            let namespace = namespace.unwrap_or_else(|| file.namespace.clone());
            let registry = registry.unwrap_or_else(|| file.registry.clone());
            if namespace.trim().is_empty() {
                return Err(Error::EmptyNamespace);
            }
            if registry.trim().is_empty() {
                return Err(Error::EmptyRegistry);
            }
            Ok(Self {
                namespace,
                registry,
                created_by: file.created_by.clone(),
                images: file.images.clone(),
            })
        }
    }

    #[cfg(test)]
    impl Config {
        pub fn for_tests() -> Self {
            Self::new(&file::File::default(), Some("testing".into()), None).unwrap()
        }
    }

}

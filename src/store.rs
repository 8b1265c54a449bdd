//! Get / create / replace access to namespaced objects on the cluster.

use async_trait::async_trait;
use kube::{api::PostParams, core::ErrorResponse, Api, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("api server responded with {code}: {message}")]
    Status { code: u16, message: String },

    #[error("kubernetes client: {0}")]
    Client(#[source] kube::Error),

    #[error("encode: {0}")]
    Encode(#[from] serde_yaml::Error),
}

impl Error {
    fn from_kube(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ErrorResponse { code: 409, reason, .. })
                if reason == "AlreadyExists" =>
            {
                Error::AlreadyExists(name.to_string())
            }
            kube::Error::Api(ErrorResponse { code: 409, .. }) => Error::Conflict(name.to_string()),
            kube::Error::Api(ErrorResponse { code, message, .. }) => Error::Status { code, message },
            err => Error::Client(err),
        }
    }
}

/// The three calls a deploy makes against one kind of object.
/// A missing object is `Ok(None)`, not an error.
#[async_trait]
pub trait Store<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>, Error>;
    async fn create(&self, obj: &K) -> Result<K, Error>;
    async fn replace(&self, name: &str, obj: &K) -> Result<K, Error>;
}

fn object_name<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl<K> Store<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, Error> {
        match Api::get(self, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(err) => Err(Error::from_kube(name, err)),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        Api::create(self, &PostParams::default(), obj)
            .await
            .map_err(|err| Error::from_kube(&object_name(obj), err))
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, Error> {
        Api::replace(self, name, &PostParams::default(), obj)
            .await
            .map_err(|err| Error::from_kube(name, err))
    }
}

/// Prints every object that would be written as a YAML document and
/// pretends the cluster is empty.
#[derive(Debug, Default)]
pub struct DryRun;

#[async_trait]
impl<K> Store<K> for DryRun
where
    K: Serialize + Clone + Send + Sync + 'static,
{
    async fn get(&self, _name: &str) -> Result<Option<K>, Error> {
        Ok(None)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        println!("---\n{}", serde_yaml::to_string(obj)?);
        Ok(obj.clone())
    }

    async fn replace(&self, _name: &str, obj: &K) -> Result<K, Error> {
        self.create(obj).await
    }
}

#[cfg(test)]
pub mod memory {
    //! In-process stand-in for the API server, counting every call.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct Memory<K> {
        objects: Mutex<BTreeMap<String, K>>,
        version: AtomicUsize,
        gets: AtomicUsize,
        creates: AtomicUsize,
        replaces: AtomicUsize,
        conflicts: AtomicUsize,
        get_failure: Option<u16>,
    }

    impl<K: Resource + Clone> Memory<K> {
        pub fn new() -> Self {
            Self::with(vec![])
        }

        pub fn with(objects: Vec<K>) -> Self {
            let store = Self {
                objects: Mutex::new(BTreeMap::new()),
                version: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
                creates: AtomicUsize::new(0),
                replaces: AtomicUsize::new(0),
                conflicts: AtomicUsize::new(0),
                get_failure: None,
            };
            for mut obj in objects {
                store.stamp(&mut obj);
                store.objects.lock().unwrap().insert(object_name(&obj), obj);
            }
            store
        }

        /// Fail the next `count` replace calls as if another writer got there first.
        pub fn conflicting(self, count: usize) -> Self {
            self.conflicts.store(count, Ordering::SeqCst);
            self
        }

        /// Fail every get with the given status code.
        pub fn failing_get(mut self, code: u16) -> Self {
            self.get_failure = Some(code);
            self
        }

        pub fn object(&self, name: &str) -> Option<K> {
            self.objects.lock().unwrap().get(name).cloned()
        }

        pub fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }

        pub fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }

        pub fn replaces(&self) -> usize {
            self.replaces.load(Ordering::SeqCst)
        }

        fn stamp(&self, obj: &mut K) {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            obj.meta_mut().resource_version = Some(version.to_string());
        }
    }

    #[async_trait]
    impl<K> Store<K> for Memory<K>
    where
        K: Resource + Clone + Send + Sync,
    {
        async fn get(&self, name: &str) -> Result<Option<K>, Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.get_failure {
                return Err(Error::Status {
                    code,
                    message: format!("get {name} refused"),
                });
            }
            Ok(self.object(name))
        }

        async fn create(&self, obj: &K) -> Result<K, Error> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = object_name(obj);
            if self.object(&name).is_some() {
                return Err(Error::AlreadyExists(name));
            }
            let mut obj = obj.clone();
            self.stamp(&mut obj);
            self.objects.lock().unwrap().insert(name, obj.clone());
            Ok(obj)
        }

        async fn replace(&self, name: &str, obj: &K) -> Result<K, Error> {
            self.replaces.fetch_add(1, Ordering::SeqCst);
            let mut current = self.object(name).ok_or_else(|| Error::Status {
                code: 404,
                message: format!("{name} not found"),
            })?;
            let pending = self.conflicts.load(Ordering::SeqCst);
            if pending > 0 {
                // someone else wrote in between
                self.conflicts.store(pending - 1, Ordering::SeqCst);
                self.stamp(&mut current);
                self.objects.lock().unwrap().insert(name.to_string(), current);
                return Err(Error::Conflict(name.to_string()));
            }
            if current.meta().resource_version != obj.meta().resource_version {
                return Err(Error::Conflict(name.to_string()));
            }
            let mut obj = obj.clone();
            self.stamp(&mut obj);
            self.objects.lock().unwrap().insert(name.to_string(), obj.clone());
            Ok(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("dockerfile".into()),
                namespace: Some("testing".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("app".into(), "FROM scratch".into())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dry_run_sees_an_empty_cluster() {
        let found = Store::<ConfigMap>::get(&DryRun, "dockerfile").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn dry_run_writes_return_the_object_unchanged() {
        let created = Store::<ConfigMap>::create(&DryRun, &config_map()).await.unwrap();
        assert_eq!(created, config_map());
        assert!(created.metadata.resource_version.is_none());

        let replaced = Store::<ConfigMap>::replace(&DryRun, "dockerfile", &config_map())
            .await
            .unwrap();
        assert_eq!(replaced, config_map());
    }
}

//! A thin factory for Kubernetes clients.
//!
//! Everything that talks to the cluster goes through one [`ClientFactory`] so
//! that connection tuning is applied in a single place. The factory hands out
//! cheap [`kube::Client`] clones along with typed, dynamic, and discovery
//! views over them.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use k8s_openapi::NamespaceResourceScope;
use kube::{
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    Api, Client, Config,
};
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(295);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to infer a kubeconfig: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error(transparent)]
    Client(#[from] kube::Error),
}

/// Builds Kubernetes clients from one shared, pre-tuned [`Config`].
#[derive(Clone, Debug)]
pub struct ClientFactory {
    config: Config,
}

// === impl ClientFactory ===

impl ClientFactory {
    /// Infers the config from the environment (in-cluster or kubeconfig).
    pub async fn infer() -> Result<Self, Error> {
        Ok(Self::from_config(Config::infer().await?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: tune(config),
        }
    }

    pub fn client(&self) -> Result<Client, Error> {
        Ok(Client::try_from(self.config.clone())?)
    }

    pub fn default_namespace(&self) -> &str {
        &self.config.default_namespace
    }

    /// The cluster CA bundle, when the config carries one.
    pub fn cluster_ca(&self) -> Option<&[Vec<u8>]> {
        self.config.root_cert.as_deref()
    }

    pub fn typed_api<K>(&self, namespace: &str) -> Result<Api<K>, Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Ok(Api::namespaced(self.client()?, namespace))
    }

    pub fn dynamic_api(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let client = self.client()?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(client, ns, resource),
            None => Api::all_with(client, resource),
        })
    }

    /// Runs API discovery against the cluster.
    pub async fn discovery(&self) -> Result<Discovery, Error> {
        tracing::debug!(cluster = %self.config.cluster_url, "running api discovery");
        Ok(Discovery::new(self.client()?).run().await?)
    }
}

fn tune(mut config: Config) -> Config {
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    config
}

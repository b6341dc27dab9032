//! The narrow cluster-API surface the control loop consumes.
//!
//! Reads of the watched objects go through informer caches; this trait
//! covers only the direct API calls: the one-shot node list and the writes
//! against the two owned objects. Keeping it a trait keeps generated client
//! plumbing out of the reconciler and lets tests record the exact call
//! sequence.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::Result;

/// Direct cluster API calls made by the reconciler.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node in the cluster, with no selector.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Create the owned load balancer Service.
    async fn create_load_balancer(&self, service: Service) -> Result<()>;

    /// Delete the owned load balancer Service; NotFound is tolerated.
    async fn delete_load_balancer(&self, name: &str) -> Result<()>;

    /// Create the owned TLS Secret.
    async fn create_tls_secret(&self, secret: Secret) -> Result<()>;

    /// Delete the owned TLS Secret; NotFound is tolerated.
    async fn delete_tls_secret(&self, name: &str) -> Result<()>;
}

/// [`ClusterApi`] backed by a kube [`Client`] in the install namespace.
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    /// Create a cluster API bound to the install namespace.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create_load_balancer(&self, service: Service) -> Result<()> {
        debug!(namespace = %self.namespace, "creating load balancer Service");
        self.services()
            .create(&PostParams::default(), &service)
            .await?;
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        debug!(namespace = %self.namespace, name = %name, "deleting load balancer Service");
        match self.services().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_tls_secret(&self, secret: Secret) -> Result<()> {
        debug!(namespace = %self.namespace, "creating TLS Secret");
        self.secrets()
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn delete_tls_secret(&self, name: &str) -> Result<()> {
        debug!(namespace = %self.namespace, name = %name, "deleting TLS Secret");
        match self.secrets().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

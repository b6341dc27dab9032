//! The impersonator config reconciler.
//!
//! One reconcile pass reads the latest watched state from informer caches,
//! resolves the effective mode, and drives the load balancer, the TLS
//! Secret and the in-process listener to the desired state. The pass is
//! idempotent and re-entrant; it returns at most one error, which the run
//! loop requeues with backoff.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::config::{ImpersonationProxyConfig, Mode};
use crate::error::Error;
use crate::loadbalancer;
use crate::pki::{self, SecretVerdict, ServingName, TlsMaterial};
use crate::server::{HandlerFactory, ImpersonatorServer};
use crate::topology::{self, ControlPlane};
use crate::Result;

use super::ControllerOptions;

/// Level-triggered reconciler for the impersonation proxy.
pub struct ImpersonatorConfigController {
    options: ControllerOptions,
    cluster: Arc<dyn ClusterApi>,
    config_maps: Store<ConfigMap>,
    services: Store<Service>,
    secrets: Store<Secret>,
    server: ImpersonatorServer,
    handler_factory: HandlerFactory,
    /// Cached one-shot probe result. Cluster topology does not change for
    /// the lifetime of a cluster, so nodes are listed at most once.
    control_plane: Option<ControlPlane>,
}

impl ImpersonatorConfigController {
    /// Create a reconciler over the given caches and collaborators.
    pub fn new(
        options: ControllerOptions,
        cluster: Arc<dyn ClusterApi>,
        config_maps: Store<ConfigMap>,
        services: Store<Service>,
        secrets: Store<Secret>,
        server: ImpersonatorServer,
        handler_factory: HandlerFactory,
    ) -> Self {
        Self {
            options,
            cluster,
            config_maps,
            services,
            secrets,
            server,
            handler_factory,
            control_plane: None,
        }
    }

    /// Run one reconcile pass.
    pub async fn sync(&mut self) -> Result<()> {
        let config = self.load_config()?;
        let control_plane = self.probe_control_plane().await?;

        let desired_on = match config.mode {
            Mode::Disabled => false,
            Mode::Enabled => true,
            Mode::Auto => control_plane == ControlPlane::Absent,
        };

        debug!(
            mode = ?config.mode,
            control_plane = ?control_plane,
            desired_on,
            "resolved effective impersonation proxy mode"
        );

        if !desired_on {
            return self.tear_down().await;
        }

        self.reconcile_load_balancer(&config).await?;
        self.server.start(&self.handler_factory.clone()).await?;

        let Some(desired_name) = self.desired_serving_name(&config)? else {
            // The load balancer has no usable ingress yet. Serve without
            // certs until a status update re-enters this path; a Secret
            // minted for a previous name no longer applies.
            self.server.set_serving_cert(None);
            self.delete_tls_secret_if_cached().await?;
            return Ok(());
        };

        self.reconcile_tls_secret(&desired_name).await
    }

    /// Stop the server once the process is shutting down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.server.stop().await
    }

    fn load_config(&self) -> Result<ImpersonationProxyConfig> {
        let key = ObjectRef::new(&self.options.config_map_name).within(&self.options.namespace);
        let config_map = self.config_maps.get(&key);
        ImpersonationProxyConfig::from_config_map(config_map.as_deref())
    }

    async fn probe_control_plane(&mut self) -> Result<ControlPlane> {
        if let Some(cached) = self.control_plane {
            return Ok(cached);
        }
        let nodes = self.cluster.list_nodes().await?;
        let control_plane = topology::classify_nodes(&nodes)?;
        info!(control_plane = ?control_plane, "probed cluster topology");
        self.control_plane = Some(control_plane);
        Ok(control_plane)
    }

    /// Desired-off path: stop the listener first so the port is released,
    /// then remove both owned objects.
    async fn tear_down(&mut self) -> Result<()> {
        self.server.stop().await?;

        if self.cached_load_balancer().is_some() {
            info!(name = %self.options.load_balancer_name, "deleting load balancer");
            self.cluster
                .delete_load_balancer(&self.options.load_balancer_name)
                .await?;
        }

        self.delete_tls_secret_if_cached().await
    }

    async fn reconcile_load_balancer(&self, config: &ImpersonationProxyConfig) -> Result<()> {
        let needed = config.endpoint().is_none();
        let exists = self.cached_load_balancer().is_some();

        match (needed, exists) {
            (true, false) => {
                info!(name = %self.options.load_balancer_name, "creating load balancer");
                let service = loadbalancer::build_load_balancer(
                    &self.options.load_balancer_name,
                    &self.options.namespace,
                    &self.options.labels,
                );
                self.cluster
                    .create_load_balancer(service)
                    .await
                    .map_err(|e| Error::CreateLoadBalancer(Box::new(e)))
            }
            (false, true) => {
                // An endpoint was configured while an owned load balancer is
                // still around; it is torn down in the same pass.
                info!(name = %self.options.load_balancer_name, "deleting obsolete load balancer");
                self.cluster
                    .delete_load_balancer(&self.options.load_balancer_name)
                    .await
            }
            _ => Ok(()),
        }
    }

    fn desired_serving_name(
        &self,
        config: &ImpersonationProxyConfig,
    ) -> Result<Option<ServingName>> {
        if let Some(endpoint) = config.endpoint() {
            return Ok(Some(ServingName::classify(endpoint)));
        }
        match self.cached_load_balancer() {
            Some(service) => loadbalancer::ingress_serving_name(&service),
            None => Ok(None),
        }
    }

    async fn reconcile_tls_secret(&mut self, desired_name: &ServingName) -> Result<()> {
        if let Some(secret) = self.cached_tls_secret() {
            match pki::evaluate_tls_secret(&secret, desired_name) {
                SecretVerdict::Valid { certified_key } => {
                    debug!(name = %desired_name, "existing TLS Secret matches the desired name");
                    self.server.set_serving_cert(Some(certified_key));
                    return Ok(());
                }
                SecretVerdict::WrongName => {
                    info!(name = %desired_name, "TLS Secret is for a different name, rotating");
                    self.delete_bad_tls_secret(|e| e).await?;
                }
                SecretVerdict::MissingOrNotPem => {
                    info!("TLS Secret is missing data or not PEM-encoded, rotating");
                    self.delete_bad_tls_secret(|e| Error::MalformedSecretDeletion(Box::new(e)))
                        .await?;
                }
                SecretVerdict::InvalidCert => {
                    info!("TLS Secret holds an invalid certificate, rotating");
                    self.delete_bad_tls_secret(|e| Error::InvalidCertDeletion(Box::new(e)))
                        .await?;
                }
                SecretVerdict::InvalidKey => {
                    info!("TLS Secret holds an invalid private key, rotating");
                    self.delete_bad_tls_secret(|e| Error::InvalidKeyDeletion(Box::new(e)))
                        .await?;
                }
            }
        }

        let material = TlsMaterial::mint(desired_name)?;
        let secret = material.to_secret(
            &self.options.tls_secret_name,
            &self.options.namespace,
            &self.options.labels,
        );
        info!(name = %desired_name, "minted fresh CA and serving certificate");
        self.cluster.create_tls_secret(secret).await?;
        self.server.set_serving_cert(Some(material.certified_key()?));
        Ok(())
    }

    /// Remove a Secret that failed validation. The serving cert is cleared
    /// first: material judged bad must not be served even if the delete
    /// fails, and the failure is composed by `wrap` so the message names the
    /// validation reason.
    async fn delete_bad_tls_secret(&mut self, wrap: impl FnOnce(Error) -> Error) -> Result<()> {
        self.server.set_serving_cert(None);
        self.cluster
            .delete_tls_secret(&self.options.tls_secret_name)
            .await
            .map_err(wrap)
    }

    async fn delete_tls_secret_if_cached(&self) -> Result<()> {
        if self.cached_tls_secret().is_some() {
            info!(name = %self.options.tls_secret_name, "deleting TLS Secret");
            self.cluster
                .delete_tls_secret(&self.options.tls_secret_name)
                .await?;
        }
        Ok(())
    }

    fn cached_load_balancer(&self) -> Option<Arc<Service>> {
        let key = ObjectRef::new(&self.options.load_balancer_name).within(&self.options.namespace);
        self.services.get(&key)
    }

    fn cached_tls_secret(&self) -> Option<Arc<Secret>> {
        let key = ObjectRef::new(&self.options.tls_secret_name).within(&self.options.namespace);
        self.secrets.get(&key)
    }
}

//! Controller wiring for the impersonation proxy control loop.
//!
//! Three namespaced watchers (ConfigMap, Service, Secret), each narrowed to
//! a single object name, feed reflector caches and a shared trigger channel.
//! A single-task run loop executes reconcile passes one at a time, so no two
//! passes ever run concurrently. Failed passes requeue with exponential
//! backoff, and a periodic resync re-runs the pass even without events.

mod filters;
mod impersonator;

pub use filters::ObjectFilter;
pub use impersonator::ImpersonatorConfigController;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::KubeClusterApi;
use crate::server::{HandlerFactory, ImpersonatorServer};
use crate::Result;

/// Initial requeue delay after a failed reconcile pass.
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);

/// Upper bound for the requeue delay.
const BACKOFF_MAX: Duration = Duration::from_secs(16);

/// Static configuration for the control loop.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Namespace the controller is installed into; all owned objects live
    /// here.
    pub namespace: String,
    /// Name of the watched ConfigMap holding the config document.
    pub config_map_name: String,
    /// Name of the owned load balancer Service.
    pub load_balancer_name: String,
    /// Name of the owned TLS Secret.
    pub tls_secret_name: String,
    /// Labels applied verbatim to both owned objects; the `app` entry also
    /// selects the impersonator workload.
    pub labels: BTreeMap<String, String>,
    /// Listen address for the in-process TLS listener.
    pub listen_addr: SocketAddr,
    /// Period of the event-independent resync pass.
    pub resync_interval: Duration,
}

/// Run the control loop until the shutdown future resolves.
///
/// The shutdown path stops the informers, drains pending triggers, and
/// performs a final stop on the in-process listener.
pub async fn run(
    client: Client,
    options: ControllerOptions,
    handler_factory: HandlerFactory,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);

    let (config_maps, cm_watch) = watch_named::<ConfigMap>(
        &client,
        &options.namespace,
        &options.config_map_name,
        trigger_tx.clone(),
    );
    let (services, svc_watch) = watch_named::<Service>(
        &client,
        &options.namespace,
        &options.load_balancer_name,
        trigger_tx.clone(),
    );
    let (secrets, secret_watch) = watch_named::<Secret>(
        &client,
        &options.namespace,
        &options.tls_secret_name,
        trigger_tx.clone(),
    );

    // Synthetic initial event: the ConfigMap may not exist, and the loop
    // must run anyway.
    let _ = trigger_tx.try_send(());

    let cluster = Arc::new(KubeClusterApi::new(client, options.namespace.clone()));
    let server = ImpersonatorServer::new(options.listen_addr);
    let resync_interval = options.resync_interval;
    let mut controller = ImpersonatorConfigController::new(
        options,
        cluster,
        config_maps,
        services,
        secrets,
        server,
        handler_factory,
    );

    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_interval,
        resync_interval,
    );
    let mut backoff = BACKOFF_INITIAL;

    tokio::pin!(shutdown);
    info!("impersonation proxy controller started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = trigger_rx.recv() => {}
            _ = resync.tick() => {}
        }

        // Triggers are level triggered; coalesce whatever queued up while
        // the previous pass ran.
        while trigger_rx.try_recv().is_ok() {}

        match controller.sync().await {
            Ok(()) => {
                backoff = BACKOFF_INITIAL;
            }
            Err(err) => {
                warn!(error = %err, delay = ?backoff, "reconcile failed, requeueing");
                let tx = trigger_tx.clone();
                let delay = backoff;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.try_send(());
                });
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }

    info!("shutting down impersonation proxy controller");
    cm_watch.abort();
    svc_watch.abort();
    secret_watch.abort();

    if let Err(err) = controller.shutdown().await {
        error!(error = %err, "failed to stop the impersonation proxy listener");
        return Err(err);
    }
    Ok(())
}

/// Watch a single named object, maintaining a reflector cache and nudging
/// the trigger channel for every relevant event.
fn watch_named<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    trigger_tx: mpsc::Sender<()>,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default + Clone + Eq + Hash,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let filter = ObjectFilter::new(namespace, name);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

    let (reader, writer) = reflector::store();
    let task = tokio::spawn(async move {
        let mut stream = reflector::reflector(writer, watcher(api, config).default_backoff()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if filter.wants_event(&event) {
                        // A full channel already holds a pending trigger;
                        // dropping this one loses nothing.
                        let _ = trigger_tx.try_send(());
                    }
                }
                Err(err) => warn!(error = %err, "watch stream error"),
            }
        }
    });

    (reader, task)
}

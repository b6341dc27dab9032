//! Load balancer Service management.
//!
//! The proxy is reached through a `Service` of type `LoadBalancer` owned by
//! the controller. The Service spec is written once on create and never
//! updated; external spec drift is out of scope, only the status is read.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::error::Error;
use crate::pki::ServingName;
use crate::IMPERSONATION_PROXY_PORT;

/// Selector label key targeting the impersonator workload.
const APP_LABEL_KEY: &str = "app";

/// Build the owned load balancer Service.
///
/// The caller-supplied label map is copied verbatim onto the object, and the
/// selector targets the workload via the `app` label.
pub fn build_load_balancer(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Service {
    let selector = labels
        .get(APP_LABEL_KEY)
        .map(|app| BTreeMap::from([(APP_LABEL_KEY.to_string(), app.clone())]));

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector,
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(i32::from(IMPERSONATION_PROXY_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pick the serving name from the load balancer's ingress status.
///
/// Returns `Ok(None)` while the provider has not populated any usable
/// ingress yet (no entries, or only entries with both fields empty).
/// A non-empty hostname in any entry beats every IP; otherwise the first
/// entry whose IP parses wins. Entries carrying data that is neither a
/// hostname nor a parseable IP make this an error so the reconcile is
/// retried when the status changes.
pub fn ingress_serving_name(service: &Service) -> Result<Option<ServingName>, Error> {
    let entries: Vec<&LoadBalancerIngress> = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter(|e| non_empty(&e.hostname).is_some() || non_empty(&e.ip).is_some())
                .collect()
        })
        .unwrap_or_default();

    if entries.is_empty() {
        return Ok(None);
    }

    if let Some(hostname) = entries.iter().find_map(|e| non_empty(&e.hostname)) {
        return Ok(Some(ServingName::Dns(hostname.to_string())));
    }

    if let Some(ip) = entries
        .iter()
        .filter_map(|e| non_empty(&e.ip))
        .find_map(|ip| ip.parse().ok())
    {
        return Ok(Some(ServingName::Ip(ip)));
    }

    Err(Error::NoUsableIngress {
        namespace: service.metadata.namespace.clone().unwrap_or_default(),
        name: service.metadata.name.clone().unwrap_or_default(),
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

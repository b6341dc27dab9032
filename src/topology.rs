//! Cluster topology probe.
//!
//! Decides whether the cluster has visible control-plane nodes. On managed
//! clusters the control plane is hidden from the node list, which is exactly
//! the situation where the impersonation proxy is needed in `auto` mode.

use k8s_openapi::api::core::v1::Node;

use crate::error::Error;

/// Label keys whose presence marks a node as part of the control plane.
const ROLE_LABEL_KEYS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Label key whose value names the node role on some distributions.
const ROLE_VALUE_LABEL_KEY: &str = "kubernetes.io/node-role";

/// Role values that count as control plane.
const CONTROL_PLANE_ROLES: &[&str] = &["control-plane", "master"];

/// Outcome of the control-plane probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlane {
    /// At least one visible node carries a control-plane role.
    Present,
    /// Nodes are visible but none carries a control-plane role.
    Absent,
}

/// Classify a listed node set.
///
/// An empty node list is an error, not [`ControlPlane::Absent`]: a cluster
/// that reports zero nodes almost certainly means the controller lacks list
/// permission, and proceeding would tear down resources based on bad data.
pub fn classify_nodes(nodes: &[Node]) -> Result<ControlPlane, Error> {
    if nodes.is_empty() {
        return Err(Error::NoNodesFound);
    }
    if nodes.iter().any(is_control_plane) {
        Ok(ControlPlane::Present)
    } else {
        Ok(ControlPlane::Absent)
    }
}

fn is_control_plane(node: &Node) -> bool {
    let Some(labels) = node.metadata.labels.as_ref() else {
        return false;
    };
    if ROLE_LABEL_KEYS.iter().any(|key| labels.contains_key(*key)) {
        return true;
    }
    labels
        .get(ROLE_VALUE_LABEL_KEY)
        .is_some_and(|role| CONTROL_PLANE_ROLES.contains(&role.as_str()))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    use super::*;

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn zero_nodes_is_an_error() {
        let err = classify_nodes(&[]).unwrap_err();
        assert_eq!(err.to_string(), "no nodes found");
    }

    #[test]
    fn role_value_label_is_recognized() {
        let nodes = vec![node_with_labels(&[("kubernetes.io/node-role", "control-plane")])];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Present);

        let nodes = vec![node_with_labels(&[("kubernetes.io/node-role", "worker")])];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Absent);
    }

    #[test]
    fn role_key_labels_are_recognized() {
        let nodes = vec![node_with_labels(&[(
            "node-role.kubernetes.io/control-plane",
            "",
        )])];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Present);

        let nodes = vec![node_with_labels(&[("node-role.kubernetes.io/master", "")])];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Present);
    }

    #[test]
    fn mixed_pools_count_as_present() {
        let nodes = vec![
            node_with_labels(&[("kubernetes.io/node-role", "worker")]),
            node_with_labels(&[("kubernetes.io/node-role", "control-plane")]),
        ];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Present);
    }

    #[test]
    fn unlabeled_nodes_are_workers() {
        let nodes = vec![Node::default()];
        assert_eq!(classify_nodes(&nodes).unwrap(), ControlPlane::Absent);
    }
}

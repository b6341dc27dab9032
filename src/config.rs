//! Impersonation proxy configuration document.
//!
//! The document lives in a ConfigMap in the install namespace and decides
//! whether the proxy runs and which name it serves under. YAML is accepted
//! as a superset of JSON, unknown keys are rejected, and an absent document
//! is equivalent to `{mode: auto}`.

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;

use crate::error::Error;

/// ConfigMap data key holding the configuration document.
pub const CONFIG_MAP_DATA_KEY: &str = "config.yaml";

/// How the impersonation proxy should be run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Run only when the cluster's control plane is not reachable directly,
    /// i.e. no visible control-plane nodes.
    #[default]
    Auto,
    /// Always run.
    Enabled,
    /// Never run; owned resources are torn down.
    Disabled,
}

/// Parsed configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImpersonationProxyConfig {
    /// Run mode, defaulting to [`Mode::Auto`] when absent.
    #[serde(default)]
    pub mode: Mode,

    /// Externally reachable name for the proxy. When set, no load balancer
    /// is provisioned and the serving certificate is minted for this name.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ImpersonationProxyConfig {
    /// Decode a configuration document.
    pub fn parse(document: &str) -> Result<Self, Error> {
        serde_yaml::from_str(document).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Resolve the configuration from the watched ConfigMap, if any.
    ///
    /// A missing ConfigMap, or one without the `config.yaml` key, means the
    /// operator has not configured anything and defaults apply.
    pub fn from_config_map(config_map: Option<&ConfigMap>) -> Result<Self, Error> {
        let document = config_map
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(CONFIG_MAP_DATA_KEY));
        match document {
            Some(document) => Self::parse(document),
            None => Ok(Self::default()),
        }
    }

    /// The configured endpoint, treating an empty string as unset.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().filter(|e| !e.is_empty())
    }
}

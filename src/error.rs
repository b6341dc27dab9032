//! Error types for the impersonation proxy control loop.
//!
//! Several of these messages are part of the user-visible contract: operators
//! grep for them and the controller tests assert them verbatim, so the exact
//! wording must not drift.

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for control-loop operations.
///
/// One error is returned per reconcile pass; the run loop logs it and
/// requeues with backoff.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the cluster API or an injected collaborator, surfaced
    /// verbatim.
    #[error(transparent)]
    Api(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Listener or serve-loop I/O error, surfaced verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The config document failed to decode or used an unknown schema.
    #[error("invalid impersonator configuration: {0}")]
    InvalidConfiguration(String),

    /// The node list came back empty, which usually means RBAC is
    /// misconfigured rather than a genuinely empty cluster.
    #[error("no nodes found")]
    NoNodesFound,

    /// The load balancer has ingress entries but none with a non-empty
    /// hostname or a parseable IP address.
    #[error("could not find valid IP addresses or hostnames from load balancer {namespace}/{name}")]
    NoUsableIngress {
        /// Namespace of the load balancer Service.
        namespace: String,
        /// Name of the load balancer Service.
        name: String,
    },

    /// Creating the load balancer Service failed.
    #[error("could not create load balancer: {0}")]
    CreateLoadBalancer(#[source] Box<Error>),

    /// The TLS Secret held a certificate that did not parse, and deleting it
    /// for re-mint failed too.
    #[error("PEM data represented an invalid cert, but got error while deleting it: {0}")]
    InvalidCertDeletion(#[source] Box<Error>),

    /// The TLS Secret was missing data or held non-PEM data, and deleting it
    /// for re-mint failed too.
    #[error(
        "found missing or not PEM-encoded data in TLS Secret, but got error while deleting it: {0}"
    )]
    MalformedSecretDeletion(#[source] Box<Error>),

    /// The TLS Secret held a key that did not parse or did not match the
    /// certificate, and deleting it for re-mint failed too.
    #[error("cert had an invalid private key, but got error while deleting it: {0}")]
    InvalidKeyDeletion(#[source] Box<Error>),

    /// TLS listener configuration could not be built.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Certificate minting or parsing failed.
    #[error(transparent)]
    Pki(#[from] PkiError),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Api(Box::new(err))
    }
}

impl Error {
    /// Wrap an arbitrary collaborator error for verbatim propagation.
    pub fn api(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Api(Box::new(err))
    }
}

//! Doppel - identity and credential layer for Kubernetes clusters.
//!
//! The heart of this crate is the impersonation proxy control loop: a
//! level-triggered reconciler that decides whether an in-cluster
//! TLS-terminating impersonation proxy should run, provisions the load
//! balancer used to reach it, mints and rotates its serving certificate
//! material, and drives the in-process TLS listener, all from one watched
//! configuration document.
//!
//! # Modules
//!
//! - [`config`] - configuration document parsing
//! - [`topology`] - control-plane node probe
//! - [`loadbalancer`] - owned load balancer Service management
//! - [`pki`] - CA and serving-certificate minting and validation
//! - [`server`] - the in-process TLS listener handle
//! - [`cluster`] - the cluster API surface the reconciler consumes
//! - [`controller`] - the reconciler and its watch wiring
//! - [`error`] - error types, including the stable user-visible messages

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod loadbalancer;
pub mod pki;
pub mod server;
pub mod topology;

pub use error::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Port the impersonation proxy listener binds.
///
/// The load balancer fronts this with port 443; binding a high port keeps
/// root privileges out of the proxy container.
pub const IMPERSONATION_PROXY_PORT: u16 = 8444;

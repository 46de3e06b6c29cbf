//! Service Mirror - mirror services from a remote Kubernetes cluster
//!
//! A `Link` resource names a remote cluster, its DNS domain, and a secret
//! holding a kubeconfig for it. The service mirror watches the remote
//! cluster's services and endpoints and keeps a local mirror of each one,
//! so local workloads (and routing components) can address remote services
//! as if they were local.
//!
//! # Architecture
//!
//! - The [`supervisor`] owns at most one [`controller::Engine`] and hands
//!   off between engines on Link or credential changes.
//! - An engine lists and watches the remote cluster through [`remote`] and
//!   [`watch`], and applies changes to the local cluster through [`store`]
//!   one at a time, with bounded retries and a periodic repair pass.
//!
//! # Modules
//!
//! - [`crd`] - the `Link` custom resource
//! - [`credentials`] - remote access config parsed from the credentials secret
//! - [`mirror`] - mirror value types, labels, and naming
//! - [`remote`] - remote cluster API seam
//! - [`watch`] - typed remote watch source
//! - [`store`] - local mirror store
//! - [`controller`] - reconciliation engine
//! - [`supervisor`] - single-engine supervisor
//! - [`link_watch`] - Link watch loop
//! - [`admin`] - liveness, readiness, and stats endpoints
//! - [`shutdown`] - SIGINT and SIGTERM handling
//! - [`metrics`] / [`telemetry`] - observability
//! - [`config`] / [`retry`] / [`error`] - shared plumbing

#![deny(missing_docs)]

pub mod admin;
pub mod config;
pub mod controller;
pub mod crd;
pub mod credentials;
pub mod error;
pub mod kube_utils;
pub mod link_watch;
pub mod metrics;
pub mod mirror;
pub mod remote;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod watch;

pub use error::Error;

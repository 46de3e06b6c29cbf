//! Link Custom Resource Definition
//!
//! A Link describes a mirroring relationship with one remote cluster: its
//! identity, the DNS domain its services resolve under, and the secret that
//! holds credentials for its API server.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Maximum length of a DNS-1123 label
const DNS_LABEL_MAX_LEN: usize = 63;

/// Link to a remote cluster whose services are mirrored locally.
///
/// Example:
/// ```yaml
/// apiVersion: multicluster.lattice.dev/v1alpha1
/// kind: Link
/// metadata:
///   name: east
///   namespace: service-mirror
/// spec:
///   targetClusterName: east
///   targetClusterDomain: cluster.local
///   clusterCredentialsSecret: cluster-credentials-east
///   selector: mirror.lattice.dev/exported=true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "multicluster.lattice.dev",
    version = "v1alpha1",
    kind = "Link",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.targetClusterName"}"#,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.targetClusterDomain"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    /// Name of the remote cluster; suffixes every mirror object name
    pub target_cluster_name: String,

    /// DNS domain of the remote cluster (e.g. `cluster.local`)
    pub target_cluster_domain: String,

    /// Name of the secret (in the Link's namespace) holding the remote kubeconfig
    pub cluster_credentials_secret: String,

    /// Label selector restricting which remote services are mirrored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl LinkSpec {
    /// Validate the link specification
    pub fn validate(&self, link_name: &str) -> Result<(), Error> {
        if !is_dns_label(&self.target_cluster_name) {
            return Err(Error::validation(
                link_name,
                format!(
                    "targetClusterName '{}' must be a lowercase DNS label of at most {} characters",
                    self.target_cluster_name, DNS_LABEL_MAX_LEN
                ),
            ));
        }

        if self.target_cluster_domain.is_empty()
            || !self.target_cluster_domain.split('.').all(is_dns_label)
        {
            return Err(Error::validation(
                link_name,
                format!(
                    "targetClusterDomain '{}' is not a valid DNS domain",
                    self.target_cluster_domain
                ),
            ));
        }

        if self.cluster_credentials_secret.trim().is_empty() {
            return Err(Error::validation(
                link_name,
                "clusterCredentialsSecret must not be empty",
            ));
        }

        if let Some(selector) = &self.selector {
            if selector.trim().is_empty() {
                return Err(Error::validation(
                    link_name,
                    "selector must not be empty when set",
                ));
            }
        }

        Ok(())
    }
}

impl Link {
    /// Validate the link, using its own name for error context
    pub fn validate(&self) -> Result<(), Error> {
        self.spec.validate(&self.name_any())
    }

    /// Name of the remote cluster this link targets
    pub fn cluster_name(&self) -> &str {
        &self.spec.target_cluster_name
    }

    /// DNS domain of the remote cluster
    pub fn cluster_domain(&self) -> &str {
        &self.spec.target_cluster_domain
    }
}

/// Check whether `value` is a DNS-1123 label: lowercase alphanumerics and
/// '-', starting and ending with an alphanumeric, at most 63 characters.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    bytes.len() <= DNS_LABEL_MAX_LEN
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

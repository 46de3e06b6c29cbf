//! Mirror Service and Mirror Endpoint Set value types
//!
//! These are projections of the Kubernetes objects onto the fields the
//! mirror owns. Both directions normalize the same way (default protocol,
//! sorted addresses, empty subsets dropped), so a desired value computed
//! from the remote cluster compares equal to the same value read back from
//! the local cluster. That equality is what keeps the repair pass from
//! writing when nothing drifted.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use super::naming::mirror_name;
use super::{
    CLUSTER_NAME_LABEL, MIRRORED_SERVICE_LABEL, REMOTE_DOMAIN_ANNOTATION,
    REMOTE_FQ_NAME_ANNOTATION, REMOTE_SERVICE_ANNOTATION,
};
use crate::Error;

const DEFAULT_PROTOCOL: &str = "TCP";

/// Remote cluster a mirror is derived from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MirrorTarget {
    /// Remote cluster name (suffix of mirror names)
    pub cluster_name: String,
    /// Remote cluster DNS domain
    pub cluster_domain: String,
}

impl MirrorTarget {
    /// Create a target for a remote cluster
    pub fn new(cluster_name: impl Into<String>, cluster_domain: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cluster_domain: cluster_domain.into(),
        }
    }
}

/// A port exposed by a mirror service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorPort {
    /// Port name (required by Kubernetes when there is more than one port)
    pub name: Option<String>,
    /// Protocol (TCP, UDP, SCTP)
    pub protocol: String,
    /// Service port number
    pub port: i32,
}

impl From<&ServicePort> for MirrorPort {
    fn from(port: &ServicePort) -> Self {
        Self {
            name: port.name.clone().filter(|n| !n.is_empty()),
            protocol: port
                .protocol
                .clone()
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            port: port.port,
        }
    }
}

/// Local representation of a remote service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorService {
    /// Local (mirror) name
    pub name: String,
    /// Namespace; the same on both clusters
    pub namespace: String,
    /// Name of the service on the remote cluster
    pub remote_name: String,
    /// Remote cluster this mirror belongs to
    pub cluster_name: String,
    /// DNS domain of the remote cluster
    pub cluster_domain: String,
    /// Ports mirrored from the remote service
    pub ports: Vec<MirrorPort>,
}

impl MirrorService {
    /// Derive the desired mirror of a remote service
    pub fn from_remote(service: &Service, target: &MirrorTarget) -> Result<Self, Error> {
        let (remote_name, namespace) = name_and_namespace(&service.metadata, "Service")?;

        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(MirrorPort::from).collect())
            .unwrap_or_default();

        Ok(Self {
            name: mirror_name(&remote_name, &target.cluster_name),
            namespace,
            remote_name,
            cluster_name: target.cluster_name.clone(),
            cluster_domain: target.cluster_domain.clone(),
            ports,
        })
    }

    /// Read a mirror back from a local Service, if it is one
    pub fn from_local(service: &Service) -> Option<Self> {
        let labels = service.metadata.labels.as_ref()?;
        if labels.get(MIRRORED_SERVICE_LABEL).map(String::as_str) != Some("true") {
            return None;
        }
        let annotations = service.metadata.annotations.as_ref()?;

        Some(Self {
            name: service.metadata.name.clone()?,
            namespace: service.metadata.namespace.clone()?,
            remote_name: annotations.get(REMOTE_SERVICE_ANNOTATION)?.clone(),
            cluster_name: labels.get(CLUSTER_NAME_LABEL)?.clone(),
            cluster_domain: annotations.get(REMOTE_DOMAIN_ANNOTATION)?.clone(),
            ports: service
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .map(|ports| ports.iter().map(MirrorPort::from).collect())
                .unwrap_or_default(),
        })
    }

    /// Fully qualified name of the remote service in the remote domain
    pub fn remote_fq_name(&self) -> String {
        format!(
            "{}.{}.svc.{}",
            self.remote_name, self.namespace, self.cluster_domain
        )
    }

    /// Render the local Service object
    pub fn to_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(mirror_labels(&self.cluster_name)),
                annotations: Some(BTreeMap::from([
                    (
                        REMOTE_SERVICE_ANNOTATION.to_string(),
                        self.remote_name.clone(),
                    ),
                    (REMOTE_FQ_NAME_ANNOTATION.to_string(), self.remote_fq_name()),
                    (
                        REMOTE_DOMAIN_ANNOTATION.to_string(),
                        self.cluster_domain.clone(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(
                    self.ports
                        .iter()
                        .map(|p| ServicePort {
                            name: p.name.clone(),
                            protocol: Some(p.protocol.clone()),
                            port: p.port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// A reachable address in a mirror endpoint set
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MirrorAddress {
    /// Remote pod IP
    pub ip: String,
    /// Remote pod hostname, when set
    pub hostname: Option<String>,
}

/// A port in a mirror endpoint subset
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MirrorEndpointPort {
    /// Port name, matching the service port name
    pub name: Option<String>,
    /// Target port number on the remote pods
    pub port: i32,
    /// Protocol (TCP, UDP, SCTP)
    pub protocol: String,
}

/// Addresses sharing a set of ports
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorSubset {
    /// Ready addresses, sorted
    pub addresses: Vec<MirrorAddress>,
    /// Ports, sorted
    pub ports: Vec<MirrorEndpointPort>,
}

/// Local endpoint addresses for a mirror service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorEndpoints {
    /// Same name as the mirror service
    pub name: String,
    /// Same namespace as the mirror service
    pub namespace: String,
    /// Remote cluster the addresses belong to
    pub cluster_name: String,
    /// Remote cluster domain the addresses are tagged with
    pub cluster_domain: String,
    /// Normalized subsets
    pub subsets: Vec<MirrorSubset>,
}

impl MirrorEndpoints {
    /// Empty endpoint set for a freshly created mirror service
    pub fn empty_for(service: &MirrorService) -> Self {
        Self {
            name: service.name.clone(),
            namespace: service.namespace.clone(),
            cluster_name: service.cluster_name.clone(),
            cluster_domain: service.cluster_domain.clone(),
            subsets: Vec::new(),
        }
    }

    /// Derive the full desired endpoint set from a remote Endpoints snapshot
    pub fn from_remote(endpoints: &Endpoints, target: &MirrorTarget) -> Result<Self, Error> {
        let (remote_name, namespace) = name_and_namespace(&endpoints.metadata, "Endpoints")?;

        Ok(Self {
            name: mirror_name(&remote_name, &target.cluster_name),
            namespace,
            cluster_name: target.cluster_name.clone(),
            cluster_domain: target.cluster_domain.clone(),
            subsets: normalize_subsets(endpoints.subsets.as_deref()),
        })
    }

    /// Read a mirror endpoint set back from a local Endpoints object
    pub fn from_local(endpoints: &Endpoints) -> Option<Self> {
        let labels = endpoints.metadata.labels.as_ref()?;
        let annotations = endpoints.metadata.annotations.as_ref()?;

        Some(Self {
            name: endpoints.metadata.name.clone()?,
            namespace: endpoints.metadata.namespace.clone()?,
            cluster_name: labels.get(CLUSTER_NAME_LABEL)?.clone(),
            cluster_domain: annotations.get(REMOTE_DOMAIN_ANNOTATION)?.clone(),
            subsets: normalize_subsets(endpoints.subsets.as_deref()),
        })
    }

    /// All addresses (IPs) across subsets
    pub fn addresses(&self) -> Vec<&str> {
        self.subsets
            .iter()
            .flat_map(|s| s.addresses.iter().map(|a| a.ip.as_str()))
            .collect()
    }

    /// Whether the set holds no addresses
    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    /// Render the local Endpoints object
    pub fn to_endpoints(&self) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(mirror_labels(&self.cluster_name)),
                annotations: Some(BTreeMap::from([(
                    REMOTE_DOMAIN_ANNOTATION.to_string(),
                    self.cluster_domain.clone(),
                )])),
                ..Default::default()
            },
            subsets: Some(
                self.subsets
                    .iter()
                    .map(|s| EndpointSubset {
                        addresses: Some(
                            s.addresses
                                .iter()
                                .map(|a| EndpointAddress {
                                    ip: a.ip.clone(),
                                    hostname: a.hostname.clone(),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ports: Some(
                            s.ports
                                .iter()
                                .map(|p| EndpointPort {
                                    name: p.name.clone(),
                                    port: p.port,
                                    protocol: Some(p.protocol.clone()),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        not_ready_addresses: None,
                    })
                    .collect(),
            ),
        }
    }
}

/// Labels carried by every mirror object of `cluster_name`
fn mirror_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MIRRORED_SERVICE_LABEL.to_string(), "true".to_string()),
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
    ])
}

fn name_and_namespace(meta: &ObjectMeta, kind: &str) -> Result<(String, String), Error> {
    let name = meta
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::malformed(kind, "snapshot has no name"))?;
    let namespace = meta
        .namespace
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::malformed(kind, format!("{} has no namespace", name)))?;
    Ok((name, namespace))
}

/// Keep ready addresses only; sort addresses and ports; drop empty subsets.
/// Node names and target refs point into the remote cluster and are dropped.
fn normalize_subsets(subsets: Option<&[EndpointSubset]>) -> Vec<MirrorSubset> {
    subsets
        .unwrap_or_default()
        .iter()
        .filter_map(|subset| {
            let mut addresses: Vec<MirrorAddress> = subset
                .addresses
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|a| MirrorAddress {
                    ip: a.ip.clone(),
                    hostname: a.hostname.clone().filter(|h| !h.is_empty()),
                })
                .collect();
            if addresses.is_empty() {
                return None;
            }
            addresses.sort();

            let mut ports: Vec<MirrorEndpointPort> = subset
                .ports
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|p| MirrorEndpointPort {
                    name: p.name.clone().filter(|n| !n.is_empty()),
                    port: p.port,
                    protocol: p
                        .protocol
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                })
                .collect();
            ports.sort();

            Some(MirrorSubset { addresses, ports })
        })
        .collect()
}

//! Local representation of mirrored remote objects
//!
//! - [`naming`] - deterministic mirror object names
//! - [`model`] - Mirror Service and Mirror Endpoint Set value types
//!
//! Every local object written by the mirror carries the labels and
//! annotations below, so that mirrors can be attributed to a cluster,
//! listed for repair and garbage collection, and resolved by downstream
//! routing components.

mod model;
mod naming;

pub use model::{
    MirrorAddress, MirrorEndpointPort, MirrorEndpoints, MirrorPort, MirrorService, MirrorSubset,
    MirrorTarget,
};
pub use naming::{mirror_name, MAX_NAME_LEN};

/// Label marking an object as a mirror (value `"true"`)
pub const MIRRORED_SERVICE_LABEL: &str = "mirror.lattice.dev/mirrored-service";

/// Label naming the remote cluster a mirror originates from
pub const CLUSTER_NAME_LABEL: &str = "mirror.lattice.dev/cluster-name";

/// Annotation holding the remote service name
pub const REMOTE_SERVICE_ANNOTATION: &str = "mirror.lattice.dev/remote-service";

/// Annotation holding the fully qualified remote service name
pub const REMOTE_FQ_NAME_ANNOTATION: &str = "mirror.lattice.dev/remote-svc-fq-name";

/// Annotation holding the remote cluster domain
pub const REMOTE_DOMAIN_ANNOTATION: &str = "mirror.lattice.dev/remote-cluster-domain";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "service-mirror";

/// Label selector matching every mirror of `cluster_name`
pub fn cluster_selector(cluster_name: &str) -> String {
    format!(
        "{}=true,{}={}",
        MIRRORED_SERVICE_LABEL, CLUSTER_NAME_LABEL, cluster_name
    )
}

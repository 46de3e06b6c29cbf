//! Remote cluster credentials
//!
//! A Link points at a Secret holding a kubeconfig for the remote cluster.
//! [`RemoteAccessConfig::from_secret`] validates that secret and parses it
//! into the configuration an engine uses to build its remote client.

use k8s_openapi::api::core::v1::Secret;
use kube::config::Kubeconfig;
use kube::ResourceExt;

use crate::Error;

/// Secret type for remote cluster credentials
pub const REMOTE_KUBECONFIG_SECRET_TYPE: &str = "mirror.lattice.dev/remote-kubeconfig";

/// Data key holding the kubeconfig document
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const OPAQUE_SECRET_TYPE: &str = "Opaque";

/// Parsed client configuration for a remote cluster.
///
/// Owned by exactly one engine; dropped with it.
#[derive(Clone, Debug)]
pub struct RemoteAccessConfig {
    /// API server URL of the remote cluster (from the current context)
    pub api_server: String,
    /// Full kubeconfig, including auth material
    pub kubeconfig: Kubeconfig,
}

impl RemoteAccessConfig {
    /// Parse a credentials secret into a remote access config
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let name = secret.name_any();

        let secret_type = secret.type_.as_deref().unwrap_or(OPAQUE_SECRET_TYPE);
        if secret_type != REMOTE_KUBECONFIG_SECRET_TYPE && secret_type != OPAQUE_SECRET_TYPE {
            return Err(Error::credentials(
                &name,
                format!(
                    "secret type '{}' is not '{}'",
                    secret_type, REMOTE_KUBECONFIG_SECRET_TYPE
                ),
            ));
        }

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .map(|b| b.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get(KUBECONFIG_KEY))
                    .map(|s| s.as_bytes().to_vec())
            })
            .ok_or_else(|| {
                Error::credentials(&name, format!("secret is missing key '{}'", KUBECONFIG_KEY))
            })?;

        Self::from_kubeconfig_bytes(&name, &raw)
    }

    /// Parse raw kubeconfig bytes; `source` names the origin for error context
    pub fn from_kubeconfig_bytes(source: &str, raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::credentials(source, format!("kubeconfig is not UTF-8: {}", e)))?;

        let kubeconfig = Kubeconfig::from_yaml(text)
            .map_err(|e| Error::credentials(source, format!("invalid kubeconfig: {}", e)))?;

        let api_server = resolve_api_server(&kubeconfig)
            .ok_or_else(|| Error::credentials(source, "kubeconfig has no resolvable server"))?;

        Ok(Self {
            api_server,
            kubeconfig,
        })
    }
}

/// Find the server URL the kubeconfig's current context points at.
///
/// Falls back to the first context, then to a lone cluster entry.
fn resolve_api_server(kubeconfig: &Kubeconfig) -> Option<String> {
    let context = kubeconfig
        .current_context
        .as_ref()
        .and_then(|current| kubeconfig.contexts.iter().find(|c| &c.name == current))
        .or_else(|| kubeconfig.contexts.first());

    let cluster = match context.and_then(|c| c.context.as_ref()) {
        Some(ctx) => kubeconfig.clusters.iter().find(|c| c.name == ctx.cluster),
        None if kubeconfig.clusters.len() == 1 => kubeconfig.clusters.first(),
        None => None,
    }?;

    cluster
        .cluster
        .as_ref()
        .and_then(|c| c.server.clone())
        .filter(|s| !s.is_empty())
}

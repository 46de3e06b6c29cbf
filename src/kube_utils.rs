//! Kubernetes client construction and API result helpers

use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Connect timeout for both local and remote clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for both local and remote clients.
///
/// Must exceed the server-side watch timeout so long-lived watches are not
/// cut by the client.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(330);

/// Client for the local cluster: the given kubeconfig, or in-cluster/inferred config
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(client_error("local", "read kubeconfig"))?;
            load_config(kubeconfig, "local").await?
        }
        None => Config::infer()
            .await
            .map_err(client_error("local", "infer config"))?,
    };
    build_client(config, "local")
}

/// Client for a remote cluster from its parsed kubeconfig
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let config = load_config(kubeconfig, "remote").await?;
    build_client(config, "remote")
}

async fn load_config(kubeconfig: Kubeconfig, side: &'static str) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(client_error(side, "load kubeconfig"))
}

fn build_client(mut config: Config, side: &'static str) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(client_error(side, "build client"))
}

fn client_error<E: Display>(side: &'static str, step: &'static str) -> impl Fn(E) -> Error {
    move |e: E| {
        Error::internal_with_context(format!("{side}_client"), format!("failed to {step}: {e}"))
    }
}

/// Map a 404 to `Ok(())` so deletes are idempotent
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Map a 409 AlreadyExists to `Ok(())` so creates are idempotent
pub fn ignore_already_exists<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// First 8 bytes of the SHA-256 of `input`, as 16 lowercase hex characters.
///
/// Stable across builds and toolchains; the digests end up in object names
/// and credential fingerprints that must survive restarts.
pub fn deterministic_hash(input: &[u8]) -> String {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input);
    digest.as_ref()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

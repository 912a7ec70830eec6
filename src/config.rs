//! In-cluster configuration loading
//!
//! A process running inside a Kubernetes cluster learns where its API server
//! lives from `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` and
//! authenticates with the service-account token mounted into the pod. The
//! token file is rewritten by the kubelet when credentials rotate, so the
//! client re-reads it on demand through a [`ConfigSource`].

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use reqwest::Certificate;

use crate::error::{Error, Result};

pub const ENV_KUBERNETES_SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
pub const ENV_KUBERNETES_SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";

const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_ROOT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Locations of the mounted service-account credential files.
///
/// The defaults point at the standard in-pod mount; tests substitute
/// temporary files.
#[derive(Clone, Debug)]
pub struct ServiceAccountPaths {
    pub token_file: PathBuf,
    pub root_ca_file: PathBuf,
}

impl Default for ServiceAccountPaths {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
            root_ca_file: PathBuf::from(DEFAULT_ROOT_CA_FILE),
        }
    }
}

/// One immutable snapshot of the in-cluster credentials.
///
/// Snapshots are replaced wholesale on refresh, never mutated in place, so
/// every outstanding request sees a consistent host/token/CA triple.
#[derive(Clone)]
pub struct ClusterConfig {
    /// Base URL of the API server, e.g. `https://10.0.0.1:443`
    pub host: String,
    pub bearer_token: String,
    /// Trust roots for the API server's certificate. Empty means the
    /// transport's default roots (plain-HTTP test servers need none).
    pub ca_certs: Vec<Certificate>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The bearer token must not leak through Debug output.
        f.debug_struct("ClusterConfig")
            .field("host", &self.host)
            .field("bearer_token", &"<redacted>")
            .field("ca_certs", &self.ca_certs.len())
            .finish()
    }
}

/// The reload seam the client depends on: one call producing a fresh
/// credential snapshot. Consulted at construction and again whenever the API
/// server rejects the current token.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ClusterConfig>;
}

impl<F> ConfigSource for F
where
    F: Fn() -> Result<ClusterConfig> + Send + Sync,
{
    fn load(&self) -> Result<ClusterConfig> {
        self()
    }
}

/// Loads credentials from the standard in-cluster environment and mounts.
#[derive(Clone, Debug, Default)]
pub struct InClusterSource {
    pub paths: ServiceAccountPaths,
}

impl InClusterSource {
    pub fn new(paths: ServiceAccountPaths) -> Self {
        Self { paths }
    }
}

impl ConfigSource for InClusterSource {
    fn load(&self) -> Result<ClusterConfig> {
        let host = env::var(ENV_KUBERNETES_SERVICE_HOST).unwrap_or_default();
        let port = env::var(ENV_KUBERNETES_SERVICE_PORT).unwrap_or_default();
        if host.is_empty() || port.is_empty() {
            return Err(Error::NotInCluster);
        }

        let token = fs::read_to_string(&self.paths.token_file).map_err(|e| {
            Error::ConfigReload(format!(
                "unable to read token file {}: {e}",
                self.paths.token_file.display()
            ))
        })?;

        let ca_certs = match fs::read(&self.paths.root_ca_file) {
            Ok(pem) => Certificate::from_pem_bundle(&pem).map_err(|e| {
                Error::ConfigReload(format!(
                    "unable to parse CA bundle {}: {e}",
                    self.paths.root_ca_file.display()
                ))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::ConfigReload(format!(
                    "unable to read CA bundle {}: {e}",
                    self.paths.root_ca_file.display()
                )))
            }
        };

        Ok(ClusterConfig {
            host: format!("https://{host}:{port}"),
            bearer_token: token.trim().to_string(),
            ca_certs,
        })
    }
}

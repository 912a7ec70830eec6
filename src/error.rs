//! Error types for the lightweight Kubernetes client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Target object does not exist (HTTP 404)
    #[error("not found")]
    NotFound,

    /// The environment does not identify a Kubernetes API server
    #[error("unable to load in-cluster configuration, KUBERNETES_SERVICE_HOST and KUBERNETES_SERVICE_PORT must be defined")]
    NotInCluster,

    /// Service-account credential files could not be read or parsed
    #[error("unable to load in-cluster credentials: {0}")]
    ConfigReload(String),

    /// Non-2xx status that is neither 404 nor a recoverable auth rejection.
    /// Carries no headers, so the bearer token never reaches logs.
    #[error("unexpected status code: method: {method}, url: {url}, statuscode: {status}, body: {body}")]
    UnexpectedStatus {
        method: String,
        url: String,
        status: u16,
        /// Response body, truncated and header-free
        body: String,
    },

    /// Transport-level failure (connection, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Successful response whose body does not match the expected shape
    #[error("unable to read response as {type_name}: {body}")]
    Decode {
        type_name: &'static str,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

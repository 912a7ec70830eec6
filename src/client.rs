//! Lightweight authenticated client for the Kubernetes API
//!
//! Supports exactly two operations against a single named Service or Pod:
//! an existence check and a selective label patch. The client owns one
//! credential snapshot and transparently recovers from token rotation: a 401
//! or 403 triggers one reload from the [`ConfigSource`] and one retry of the
//! same logical request, never more.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ClusterConfig, ConfigSource};
use crate::error::{Error, Result};

/// Per-request timeout applied to every snapshot's transport. The upstream
/// retry contract (at most one refresh cycle) is unaffected by timeouts.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Original attempt plus one post-refresh retry.
const MAX_ATTEMPTS: u32 = 2;

/// Upper bound on response-body bytes carried inside an error message.
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// The two object kinds whose labels this client manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Service,
    Pod,
}

impl ObjectKind {
    /// API collection segment, e.g. `/api/v1/namespaces/{ns}/services/{name}`
    fn collection(self) -> &'static str {
        match self {
            ObjectKind::Service => "services",
            ObjectKind::Pod => "pods",
        }
    }

    /// JSON-Pointer base under which routing labels live. Services route on
    /// their selector; Pods carry plain metadata labels.
    fn label_path(self) -> &'static str {
        match self {
            ObjectKind::Service => "/spec/selector",
            ObjectKind::Pod => "/metadata/labels",
        }
    }
}

/// A single non-destructive "set this label to this value" instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelOp {
    pub key: String,
    pub value: String,
}

impl LabelOp {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Metadata subset decoded by [`KubeClient::get_object`].
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectDetails {
    pub metadata: ObjectMetadata,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A frozen credential snapshot together with the transport built from it.
/// Every request captures one snapshot for its whole lifetime; a retry after
/// refresh is a fresh request against the new snapshot.
struct Snapshot {
    config: ClusterConfig,
    http: reqwest::Client,
}

impl Snapshot {
    fn build(config: ClusterConfig, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !config.ca_certs.is_empty() {
            // Trust only the cluster CA, not the system roots.
            builder = builder.use_rustls_tls().tls_built_in_root_certs(false);
            for cert in &config.ca_certs {
                builder = builder.add_root_certificate(cert.clone());
            }
        }
        let http = builder.build()?;
        Ok(Self { config, http })
    }
}

pub struct KubeClient {
    source: Box<dyn ConfigSource>,
    snapshot: RwLock<Arc<Snapshot>>,
    timeout: Duration,
}

impl KubeClient {
    /// Loads the initial credential snapshot from `source`. Fails if the
    /// in-cluster configuration is unavailable.
    pub fn new(source: impl ConfigSource + 'static) -> Result<Self> {
        Self::with_timeout(source, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(source: impl ConfigSource + 'static, timeout: Duration) -> Result<Self> {
        let config = source.load()?;
        let snapshot = Arc::new(Snapshot::build(config, timeout)?);
        Ok(Self {
            source: Box::new(source),
            snapshot: RwLock::new(snapshot),
            timeout,
        })
    }

    /// Verifies that the named object exists.
    ///
    /// Returns [`Error::NotFound`] on 404 and [`Error::UnexpectedStatus`] on
    /// any other non-2xx status.
    pub async fn check_exists(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        self.dispatch(Method::GET, kind, namespace, name, None)
            .await
            .map(|_| ())
    }

    /// Fetches the named object and decodes its metadata.
    pub async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectDetails> {
        let resp = self
            .dispatch(Method::GET, kind, namespace, name, None)
            .await?;
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|_| Error::Decode {
            type_name: "ObjectDetails",
            body: truncate_body(body),
        })
    }

    /// Applies one JSON-Patch `add` per label, in input order. `add` creates
    /// or overwrites the addressed key and never touches sibling keys, so
    /// unrelated labels on the object survive.
    ///
    /// Duplicate keys within one call collapse last-value-wins before
    /// dispatch. An empty `ops` slice is a no-op.
    pub async fn patch_labels(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        ops: &[LabelOp],
    ) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let doc: Vec<Value> = dedup_last_wins(ops)
            .iter()
            .map(|op| {
                json!({
                    "op": "add",
                    "path": format!("{}/{}", kind.label_path(), escape_pointer(&op.key)),
                    "value": op.value,
                })
            })
            .collect();
        self.dispatch(
            Method::PATCH,
            kind,
            namespace,
            name,
            Some(Value::Array(doc).to_string()),
        )
        .await
        .map(|_| ())
    }

    /// Shared dispatch: sends the request with the current snapshot's token,
    /// classifies the status, and performs at most one reload-and-retry on
    /// auth rejection. Transport errors abort immediately.
    async fn dispatch(
        &self,
        method: Method,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        body: Option<String>,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let snap = self.current();
            let url = format!(
                "{}/api/v1/namespaces/{}/{}/{}",
                snap.config.host,
                namespace,
                kind.collection(),
                name
            );
            debug!(%method, %url, attempt, "dispatching Kubernetes API request");

            let mut req = snap
                .http
                .request(method.clone(), &url)
                .header(AUTHORIZATION, format!("Bearer {}", snap.config.bearer_token))
                .header(ACCEPT, "application/json");
            if let Some(body) = &body {
                req = req
                    .header(CONTENT_TYPE, "application/json-patch+json")
                    .body(body.clone());
            }
            let resp = req.send().await?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if attempt < MAX_ATTEMPTS => {
                    // Perhaps the mounted token has been rotated since we
                    // last read it.
                    debug!(status = status.as_u16(), "credentials rejected, reloading in-cluster configuration");
                    self.reload()?;
                }
                StatusCode::NOT_FOUND => return Err(Error::NotFound),
                _ => return Err(unexpected_status(&method, &url, resp).await),
            }
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        // The lock only guards a clone/assign of the Arc, so a poisoned
        // guard still holds a usable snapshot.
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the stored snapshot wholesale. Concurrent callers observe
    /// either the old or the new snapshot, never a mix; requests already in
    /// flight keep the snapshot they captured.
    fn reload(&self) -> Result<()> {
        let config = self.source.load()?;
        let snapshot = Arc::new(Snapshot::build(config, self.timeout)?);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(())
    }
}

/// Collapses duplicate keys last-value-wins, keeping first-occurrence order.
fn dedup_last_wins(ops: &[LabelOp]) -> Vec<LabelOp> {
    let mut out: Vec<LabelOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match out.iter_mut().find(|existing| existing.key == op.key) {
            Some(existing) => existing.value = op.value.clone(),
            None => out.push(op.clone()),
        }
    }
    out
}

/// RFC 6901 escaping; label keys like `app.kubernetes.io/name` contain `/`.
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Builds the diagnostic error for a non-2xx response. Only method, URL,
/// status, and truncated body are captured; headers would leak the token.
async fn unexpected_status(method: &Method, url: &str, resp: Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Error::UnexpectedStatus {
        method: method.to_string(),
        url: url.to_string(),
        status,
        body: truncate_body(body),
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut end = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

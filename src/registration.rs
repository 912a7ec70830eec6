//! Label-based service registration
//!
//! Mirrors a cluster member's lifecycle state onto the Kubernetes Service
//! fronting the cluster. External load balancers match on these labels, so a
//! member that is standby, sealed, or shutting down stops receiving traffic
//! as soon as its labels say so. The registration holds no flag state of its
//! own: the labels on the remote object are the state, which makes every
//! notification idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::client::{KubeClient, LabelOp, ObjectKind};
use crate::error::Result;

/// Kubernetes' default namespace.
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_SERVICE_NAME: &str = "cluster";

pub const LABEL_VERSION: &str = "cluster-version";
pub const LABEL_ACTIVE: &str = "cluster-active";
pub const LABEL_SEALED: &str = "cluster-sealed";
pub const LABEL_PERF_STANDBY: &str = "cluster-perf-standby";
pub const LABEL_INITIALIZED: &str = "cluster-initialized";

/// Snapshot of the member's lifecycle state at startup, written as the
/// initial label set.
#[derive(Clone, Debug, Default)]
pub struct MemberState {
    pub version: String,
    pub active: bool,
    pub sealed: bool,
    pub performance_standby: bool,
    pub initialized: bool,
}

pub struct ServiceRegistration {
    client: Arc<KubeClient>,
    namespace: String,
    service_name: String,
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("namespace", &self.namespace)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistration {
    /// Registers against the Service named in `config` (keys `namespace` and
    /// `service_name`, with defaults; unrecognized keys are ignored).
    ///
    /// Verifies the Service exists and writes the full initial label set;
    /// either failing is a hard construction error. Also spawns a detached
    /// task that writes the terminal label set once `shutdown` signals.
    pub async fn new(
        client: Arc<KubeClient>,
        config: &HashMap<String, String>,
        state: &MemberState,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let namespace = resolve(config, "namespace", DEFAULT_NAMESPACE);
        let service_name = resolve(config, "service_name", DEFAULT_SERVICE_NAME);

        // Registering against a nonexistent target would silently advertise
        // nothing; fail loudly instead.
        client
            .check_exists(ObjectKind::Service, &namespace, &service_name)
            .await?;

        let initial = [
            LabelOp::new(LABEL_VERSION, state.version.clone()),
            LabelOp::new(LABEL_ACTIVE, bool_label(state.active)),
            LabelOp::new(LABEL_SEALED, bool_label(state.sealed)),
            LabelOp::new(LABEL_PERF_STANDBY, bool_label(state.performance_standby)),
            LabelOp::new(LABEL_INITIALIZED, bool_label(state.initialized)),
        ];
        client
            .patch_labels(ObjectKind::Service, &namespace, &service_name, &initial)
            .await?;

        let registration = Arc::new(Self {
            client,
            namespace,
            service_name,
        });
        // Deliberately not joined: the caller's shutdown sequence must not
        // block on network I/O, and the terminal patch is best-effort.
        tokio::spawn(Arc::clone(&registration).watch_shutdown(shutdown));
        Ok(registration)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn notify_active(&self, active: bool) -> Result<()> {
        self.patch_flag(LABEL_ACTIVE, active).await
    }

    pub async fn notify_sealed(&self, sealed: bool) -> Result<()> {
        self.patch_flag(LABEL_SEALED, sealed).await
    }

    pub async fn notify_performance_standby(&self, standby: bool) -> Result<()> {
        self.patch_flag(LABEL_PERF_STANDBY, standby).await
    }

    pub async fn notify_initialized(&self, initialized: bool) -> Result<()> {
        self.patch_flag(LABEL_INITIALIZED, initialized).await
    }

    /// One patch, one label; the other labels are never touched.
    async fn patch_flag(&self, key: &str, value: bool) -> Result<()> {
        self.client
            .patch_labels(
                ObjectKind::Service,
                &self.namespace,
                &self.service_name,
                &[LabelOp::new(key, bool_label(value))],
            )
            .await
    }

    async fn watch_shutdown(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // A dropped sender also releases us; treat it as the signal.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        // Leave the labels in the state we want visible after shutdown: not
        // routable, assumed sealed.
        let terminal = [
            LabelOp::new(LABEL_ACTIVE, bool_label(false)),
            LabelOp::new(LABEL_SEALED, bool_label(true)),
            LabelOp::new(LABEL_PERF_STANDBY, bool_label(false)),
            LabelOp::new(LABEL_INITIALIZED, bool_label(false)),
        ];
        if let Err(e) = self
            .client
            .patch_labels(
                ObjectKind::Service,
                &self.namespace,
                &self.service_name,
                &terminal,
            )
            .await
        {
            warn!(
                service_name = %self.service_name,
                namespace = %self.namespace,
                error = %e,
                "unable to set final status on service during shutdown"
            );
        }
    }
}

fn resolve(config: &HashMap<String, String>, key: &str, default: &str) -> String {
    match config.get(key) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => default.to_string(),
    }
}

/// Renders a flag as the literal label value `"true"` or `"false"`.
fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::error::Error;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_SERVICE: &str = "shell-demo";
    const TEST_VERSION: &str = "v1";

    fn client_for(server: &MockServer) -> Arc<KubeClient> {
        let uri = server.uri();
        let source = move || {
            Ok(ClusterConfig {
                host: uri.clone(),
                bearer_token: "shared-secret".to_string(),
                ca_certs: Vec::new(),
            })
        };
        Arc::new(KubeClient::new(source).unwrap())
    }

    fn test_config() -> HashMap<String, String> {
        HashMap::from([
            ("namespace".to_string(), "default".to_string()),
            ("service_name".to_string(), TEST_SERVICE.to_string()),
            // Unrecognized keys are ignored.
            ("unrelated".to_string(), "x".to_string()),
        ])
    }

    fn all_true_state() -> MemberState {
        MemberState {
            version: TEST_VERSION.to_string(),
            active: true,
            sealed: true,
            performance_standby: true,
            initialized: true,
        }
    }

    fn initial_patch_body() -> serde_json::Value {
        json!([
            {"op": "add", "path": "/spec/selector/cluster-version", "value": TEST_VERSION},
            {"op": "add", "path": "/spec/selector/cluster-active", "value": "true"},
            {"op": "add", "path": "/spec/selector/cluster-sealed", "value": "true"},
            {"op": "add", "path": "/spec/selector/cluster-perf-standby", "value": "true"},
            {"op": "add", "path": "/spec/selector/cluster-initialized", "value": "true"}
        ])
    }

    async fn mount_existing_service(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(format!(
                "/api/v1/namespaces/default/services/{TEST_SERVICE}"
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_construction_writes_full_initial_label_set() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .and(path(format!(
                "/api/v1/namespaces/default/services/{TEST_SERVICE}"
            )))
            .and(body_json(initial_patch_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_construction_fails_when_service_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn test_construction_defaults_namespace_and_service_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/services/cluster"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/namespaces/default/services/cluster"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let registration = ServiceRegistration::new(
            client_for(&server),
            &HashMap::new(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();
        assert_eq!(registration.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(registration.service_name(), DEFAULT_SERVICE_NAME);
    }

    #[tokio::test]
    async fn test_notify_active_patches_only_its_own_label() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .and(body_json(initial_patch_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(body_json(json!([
                {"op": "add", "path": "/spec/selector/cluster-active", "value": "false"}
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let registration = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();

        registration.notify_active(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_each_notify_patches_its_own_label() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .and(body_json(initial_patch_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        for key in [LABEL_SEALED, LABEL_PERF_STANDBY, LABEL_INITIALIZED] {
            Mock::given(method("PATCH"))
                .and(body_json(json!([
                    {"op": "add", "path": format!("/spec/selector/{key}"), "value": "false"}
                ])))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let registration = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();

        registration.notify_sealed(false).await.unwrap();
        registration.notify_performance_standby(false).await.unwrap();
        registration.notify_initialized(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_writes_terminal_label_set() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .and(body_json(initial_patch_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(body_json(json!([
                {"op": "add", "path": "/spec/selector/cluster-active", "value": "false"},
                {"op": "add", "path": "/spec/selector/cluster-sealed", "value": "true"},
                {"op": "add", "path": "/spec/selector/cluster-perf-standby", "value": "false"},
                {"op": "add", "path": "/spec/selector/cluster-initialized", "value": "false"}
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _registration = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        wait_for_patch_count(&server, 2).await;
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_also_triggers_terminal_patch() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _registration = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();

        drop(shutdown_tx);
        wait_for_patch_count(&server, 2).await;
    }

    #[tokio::test]
    async fn test_failed_terminal_patch_is_swallowed() {
        let server = MockServer::start().await;
        mount_existing_service(&server).await;
        Mock::given(method("PATCH"))
            .and(body_json(initial_patch_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        // Terminal patch fails; the watcher must log and move on, not panic.
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _registration = ServiceRegistration::new(
            client_for(&server),
            &test_config(),
            &all_true_state(),
            shutdown_rx,
        )
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        wait_for_patch_count(&server, 2).await;
    }

    /// The shutdown watcher is detached, so poll until its patch lands.
    async fn wait_for_patch_count(server: &MockServer, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let patches = server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|r| r.method.as_str() == "PATCH")
                .count();
            if patches >= expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} PATCH requests but observed {patches}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[test]
    fn test_bool_label_rendering() {
        assert_eq!(bool_label(true), "true");
        assert_eq!(bool_label(false), "false");
    }
}

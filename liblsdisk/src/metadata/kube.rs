//! In-cluster Kubernetes client.
//!
//! Talks to the API server over HTTPS with the pod's service account,
//! reading the bearer token on every request since projected tokens rotate.
//! Only the handful of endpoints the driver needs are covered:
//!
//! - `GET /api/v1/persistentvolumes/{name}`
//! - `GET /apis/storage.k8s.io/v1/storageclasses/{name}`
//! - `POST|GET|DELETE /api/v1/namespaces/{ns}/pods[/{name}]`

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{DriverConfig, ExpansionEnv};
use crate::error::CsiError;
use crate::metadata::{ExpansionHelper, VolumeMetadata};
use crate::types::{StorageParams, VolumeId};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Name of the helper pod expanding `volume_id`.
pub fn helper_pod_name(volume_id: &VolumeId) -> String {
    format!("lsdisk-expand-{volume_id}")
}

// ---------------------------------------------------------------------------
// API object shapes (only the fields read)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PersistentVolume {
    spec: PersistentVolumeSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistentVolumeSpec {
    #[serde(default)]
    storage_class_name: Option<String>,
    #[serde(default)]
    node_affinity: Option<VolumeNodeAffinity>,
}

#[derive(Debug, Deserialize)]
struct VolumeNodeAffinity {
    #[serde(default)]
    required: Option<NodeSelector>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelector {
    #[serde(default)]
    node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelectorTerm {
    #[serde(default)]
    match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Deserialize)]
struct NodeSelectorRequirement {
    key: String,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StorageClass {
    #[serde(default)]
    parameters: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: PodMeta,
    #[serde(default)]
    spec: Option<PodSpec>,
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMeta {
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

/// What POST did with a helper pod manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Created {
    New,
    AlreadyExists,
}

impl Pod {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase(), Some("Succeeded" | "Failed"))
    }

    fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the helper container was started with exactly `env`.
    fn runs_with(&self, env: &ExpansionEnv) -> bool {
        let Some(container) = self.spec.as_ref().and_then(|s| s.containers.first()) else {
            return false;
        };
        let mut have: Vec<(&str, &str)> = container
            .env
            .iter()
            .map(|v| (v.name.as_str(), v.value.as_str()))
            .collect();
        let want_owned = env.to_env();
        let mut want: Vec<(&str, &str)> = want_owned.iter().map(|(k, v)| (*k, v.as_str())).collect();
        have.sort_unstable();
        want.sort_unstable();
        have == want
    }
}

impl PersistentVolumeSpec {
    /// First value of the node-affinity requirement keyed by `topology_key`.
    fn node(&self, topology_key: &str) -> Option<String> {
        self.node_affinity
            .as_ref()?
            .required
            .as_ref()?
            .node_selector_terms
            .iter()
            .flat_map(|term| &term.match_expressions)
            .find(|req| req.key == topology_key)
            .and_then(|req| req.values.first().cloned())
    }
}

/// Manifest of the privileged pod that grows an image file on `node`.
fn helper_pod_manifest(
    name: &str,
    node: &str,
    image: &str,
    scratch_root: &str,
    env: &ExpansionEnv,
) -> Value {
    let env: Vec<Value> = env
        .to_env()
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "labels": { "app.kubernetes.io/name": "lsdisk-expand" },
        },
        "spec": {
            "nodeName": node,
            "restartPolicy": "Never",
            "containers": [{
                "name": "extend-image",
                "image": image,
                "command": ["lsdisk", "extend-image"],
                "env": env,
                "securityContext": { "privileged": true },
                "volumeMounts": [
                    { "name": "dev", "mountPath": "/dev" },
                    { "name": "scratch", "mountPath": scratch_root, "mountPropagation": "Bidirectional" },
                ],
            }],
            "volumes": [
                { "name": "dev", "hostPath": { "path": "/dev" } },
                { "name": "scratch", "hostPath": { "path": scratch_root, "type": "DirectoryOrCreate" } },
            ],
        },
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Kubernetes API client for PV/StorageClass lookups and helper pods.
pub struct KubeClient {
    client: Client,
    base_url: String,
    token_path: PathBuf,
    topology_key: String,
    namespace: String,
    helper_image: String,
    scratch_root: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl KubeClient {
    /// Build a client from the in-cluster service account and the
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` environment.
    pub fn in_cluster(config: &DriverConfig) -> Result<Self, CsiError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| CsiError::Metadata("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);

        let ca = std::fs::read(dir.join("ca.crt"))?;
        let ca = reqwest::Certificate::from_pem(&ca).map_err(CsiError::metadata)?;
        let client = Client::builder()
            .add_root_certificate(ca)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(CsiError::metadata)?;

        // IPv6 service hosts need brackets in the authority.
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        info!(api = %authority, "using in-cluster Kubernetes API");

        Ok(Self::new(client, format!("https://{authority}"), dir.join("token"), config))
    }

    /// Client for the API server at `base_url`, authenticating with the
    /// bearer token stored in `token_path`.
    pub fn new(client: Client, base_url: String, token_path: PathBuf, config: &DriverConfig) -> Self {
        Self {
            client,
            base_url,
            token_path,
            topology_key: config.topology_key.clone(),
            namespace: config.helper_namespace.clone(),
            helper_image: config.helper_image.clone(),
            scratch_root: config.scratch_root.to_string_lossy().into_owned(),
            poll_interval: config.helper_poll_interval,
            timeout: config.helper_timeout,
        }
    }

    async fn token(&self) -> Result<String, CsiError> {
        let token = tokio::fs::read_to_string(&self.token_path).await?;
        Ok(token.trim().to_owned())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn pod_path(&self, name: &str) -> String {
        format!("/api/v1/namespaces/{}/pods/{name}", self.namespace)
    }

    /// GET `path` and decode it, mapping 404 to `MetadataNotFound`.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        name: &str,
    ) -> Result<T, CsiError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(CsiError::metadata)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(CsiError::metadata),
            StatusCode::NOT_FOUND => Err(CsiError::MetadataNotFound {
                kind,
                name: name.to_owned(),
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CsiError::Metadata(format!("GET {path}: {status}: {body}")))
            }
        }
    }

    async fn persistent_volume(&self, name: &VolumeId) -> Result<PersistentVolume, CsiError> {
        self.get(
            &format!("/api/v1/persistentvolumes/{name}"),
            "PersistentVolume",
            name.as_str(),
        )
        .await
    }

    async fn create_pod(&self, manifest: &Value) -> Result<Created, CsiError> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let response = self
            .client
            .post(self.url(&path))
            .bearer_auth(self.token().await?)
            .json(manifest)
            .send()
            .await
            .map_err(CsiError::metadata)?;

        match response.status() {
            status if status.is_success() => Ok(Created::New),
            StatusCode::CONFLICT => Ok(Created::AlreadyExists),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CsiError::Metadata(format!("create pod: {status}: {body}")))
            }
        }
    }

    /// Create the helper pod, replacing a pod of the same name left behind
    /// by an earlier attempt.  Only a pod still running with the same
    /// environment is adopted; a finished pod or one started for another
    /// request is deleted and created anew once it is gone.
    async fn start_helper(&self, name: &str, manifest: &Value, env: &ExpansionEnv) -> Result<(), CsiError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.create_pod(manifest).await? == Created::New {
                return Ok(());
            }
            match self.get::<Pod>(&self.pod_path(name), "Pod", name).await {
                Ok(pod) if pod.is_terminating() => {
                    debug!(pod = name, "previous helper pod still terminating");
                }
                Ok(pod) if !pod.is_terminal() && pod.runs_with(env) => {
                    warn!(pod = name, phase = ?pod.phase(), "adopting running helper pod");
                    return Ok(());
                }
                Ok(pod) => {
                    warn!(pod = name, phase = ?pod.phase(), "replacing stale helper pod");
                    self.delete_pod(name).await?;
                }
                // Deleted between the POST and the GET.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Metadata(format!(
                    "helper pod {name} from an earlier attempt is still present"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll the pod until it reaches a terminal phase or the timeout runs
    /// out.  Returns the last phase seen.
    async fn wait_for_pod(&self, name: &str) -> Result<Option<String>, CsiError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let pod: Pod = self.get(&self.pod_path(name), "Pod", name).await?;
            let phase = pod.status.and_then(|s| s.phase);
            debug!(pod = name, phase = ?phase, "helper pod status");
            if matches!(phase.as_deref(), Some("Succeeded" | "Failed")) {
                return Ok(phase);
            }
            if Instant::now() >= deadline {
                warn!(pod = name, "timed out waiting for helper pod");
                return Ok(phase);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Delete the pod.  Returns whether it is gone.
    async fn delete_pod(&self, name: &str) -> Result<bool, CsiError> {
        let response = self
            .client
            .delete(self.url(&self.pod_path(name)))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(CsiError::metadata)?;
        let status = response.status();
        Ok(status.is_success() || status == StatusCode::NOT_FOUND)
    }
}

#[async_trait]
impl VolumeMetadata for KubeClient {
    async fn storage_class_of(&self, volume_id: &VolumeId) -> Result<String, CsiError> {
        self.persistent_volume(volume_id)
            .await?
            .spec
            .storage_class_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CsiError::Metadata(format!("PersistentVolume {volume_id} has no storage class")))
    }

    async fn storage_params(&self, storage_class: &str) -> Result<StorageParams, CsiError> {
        let class: StorageClass = self
            .get(
                &format!("/apis/storage.k8s.io/v1/storageclasses/{storage_class}"),
                "StorageClass",
                storage_class,
            )
            .await?;
        StorageParams::from_parameters(&class.parameters)
    }

    async fn node_of(&self, volume_id: &VolumeId) -> Result<String, CsiError> {
        self.persistent_volume(volume_id)
            .await?
            .spec
            .node(&self.topology_key)
            .ok_or_else(|| CsiError::Metadata(format!("PersistentVolume {volume_id} has no node affinity")))
    }
}

#[async_trait]
impl ExpansionHelper for KubeClient {
    #[instrument(skip(self, env), fields(volume_id = %env.volume_id))]
    async fn expand(&self, node: &str, env: &ExpansionEnv) -> Result<bool, CsiError> {
        let name = helper_pod_name(&env.volume_id);
        let manifest = helper_pod_manifest(&name, node, &self.helper_image, &self.scratch_root, env);
        self.start_helper(&name, &manifest, env).await?;
        info!(pod = %name, node, "expansion helper scheduled");

        let waited = self.wait_for_pod(&name).await;
        let deleted = self.delete_pod(&name).await?;
        let phase = waited?;

        let succeeded = phase.as_deref() == Some("Succeeded") && deleted;
        info!(pod = %name, phase = ?phase, deleted, succeeded, "expansion helper finished");
        Ok(succeeded)
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Mock, ServerGuard};

    use super::*;
    use crate::types::DiskType;

    const GIB: u64 = 1 << 30;
    const PODS: &str = "/api/v1/namespaces/default/pods";
    const HELPER_POD: &str = "/api/v1/namespaces/default/pods/lsdisk-expand-pvc-1";

    struct MockApi {
        server: ServerGuard,
        client: KubeClient,
        _tmp: tempfile::TempDir,
    }

    async fn mock_api() -> MockApi {
        let server = mockito::Server::new_async().await;
        let tmp = tempfile::tempdir().unwrap();
        let token = tmp.path().join("token");
        std::fs::write(&token, "secret\n").unwrap();
        let config = DriverConfig {
            helper_poll_interval: Duration::from_millis(5),
            helper_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let client = KubeClient::new(Client::new(), server.url(), token, &config);
        MockApi {
            server,
            client,
            _tmp: tmp,
        }
    }

    fn expansion(capacity_bytes: u64) -> ExpansionEnv {
        ExpansionEnv {
            params: StorageParams::new("SSD-A"),
            volume_id: VolumeId::from("pvc-1"),
            capacity_bytes,
            mount_dest: PathBuf::from("/mnt/lsdisk"),
            image_name: "disk.img".into(),
        }
    }

    fn pod_body(phase: &str, env: &ExpansionEnv) -> String {
        let env: Vec<Value> = env
            .to_env()
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "metadata": { "name": "lsdisk-expand-pvc-1" },
            "spec": { "containers": [{ "name": "extend-image", "env": env }] },
            "status": { "phase": phase },
        })
        .to_string()
    }

    impl MockApi {
        async fn post(&mut self, status: usize) -> Mock {
            self.server
                .mock("POST", PODS)
                .match_header("authorization", "Bearer secret")
                .with_status(status)
                .with_body("{}")
                .expect(1)
                .create_async()
                .await
        }

        async fn get(&mut self, phase: &str, env: &ExpansionEnv, hits: usize) -> Mock {
            self.server
                .mock("GET", HELPER_POD)
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(pod_body(phase, env))
                .expect_at_least(hits)
                .create_async()
                .await
        }

        async fn delete(&mut self, hits: usize) -> Mock {
            self.server
                .mock("DELETE", HELPER_POD)
                .with_status(200)
                .with_body("{}")
                .expect(hits)
                .create_async()
                .await
        }
    }

    #[tokio::test]
    async fn helper_success_deletes_the_pod() {
        let mut api = mock_api().await;
        let env = expansion(GIB);
        let post = api
            .server
            .mock("POST", PODS)
            .match_body(Matcher::PartialJson(json!({
                "metadata": { "name": "lsdisk-expand-pvc-1" },
                "spec": { "nodeName": "node-01" },
            })))
            .with_status(201)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        let get = api.get("Succeeded", &env, 1).await;
        let delete = api.delete(1).await;

        assert!(api.client.expand("node-01", &env).await.unwrap());
        post.assert_async().await;
        get.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn failed_helper_reports_false() {
        let mut api = mock_api().await;
        let env = expansion(GIB);
        let post = api.post(201).await;
        let _get = api.get("Failed", &env, 1).await;
        let delete = api.delete(1).await;

        assert!(!api.client.expand("node-01", &env).await.unwrap());
        post.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn helper_that_never_finishes_times_out() {
        let mut api = mock_api().await;
        let env = expansion(GIB);
        let _post = api.post(201).await;
        let get = api.get("Running", &env, 2).await;
        let delete = api.delete(1).await;

        assert!(!api.client.expand("node-01", &env).await.unwrap());
        get.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn finished_pod_from_an_earlier_request_is_replaced() {
        let mut api = mock_api().await;
        let earlier = expansion(GIB);
        let env = expansion(3 * GIB);
        let conflict = api.post(409).await;
        let created = api.post(201).await;
        let stale = api
            .server
            .mock("GET", HELPER_POD)
            .with_status(200)
            .with_body(pod_body("Succeeded", &earlier))
            .expect(1)
            .create_async()
            .await;
        let _finished = api.get("Succeeded", &env, 1).await;
        // Once for the stale pod, once after the new one finished.
        let delete = api.delete(2).await;

        assert!(api.client.expand("node-01", &env).await.unwrap());
        conflict.assert_async().await;
        created.assert_async().await;
        stale.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn running_pod_for_the_same_request_is_adopted() {
        let mut api = mock_api().await;
        let env = expansion(3 * GIB);
        let conflict = api.post(409).await;
        let running = api
            .server
            .mock("GET", HELPER_POD)
            .with_status(200)
            .with_body(pod_body("Running", &env))
            .expect(1)
            .create_async()
            .await;
        let _finished = api.get("Succeeded", &env, 1).await;
        let delete = api.delete(1).await;

        assert!(api.client.expand("node-01", &env).await.unwrap());
        conflict.assert_async().await;
        running.assert_async().await;
        delete.assert_async().await;
    }

    #[test]
    fn pod_env_must_match_the_request() {
        let env = expansion(3 * GIB);
        let pod: Pod = serde_json::from_str(&pod_body("Running", &env)).unwrap();
        assert!(pod.runs_with(&env));
        assert!(!pod.runs_with(&expansion(GIB)));
        assert!(!pod.is_terminal());
        assert!(!Pod::default().runs_with(&env));
    }

    #[test]
    fn node_comes_from_topology_affinity() {
        let pv: PersistentVolume = serde_json::from_value(json!({
            "spec": {
                "storageClassName": "lsdisk-ssd",
                "nodeAffinity": { "required": { "nodeSelectorTerms": [
                    { "matchExpressions": [
                        { "key": "zone", "operator": "In", "values": ["a"] },
                        { "key": "hostname", "operator": "In", "values": ["node-01"] }
                    ]}
                ]}}
            }
        }))
        .unwrap();
        assert_eq!(pv.spec.storage_class_name.as_deref(), Some("lsdisk-ssd"));
        assert_eq!(pv.spec.node("hostname").as_deref(), Some("node-01"));
        assert_eq!(pv.spec.node("rack"), None);
    }

    #[test]
    fn pv_without_affinity_has_no_node() {
        let pv: PersistentVolume = serde_json::from_value(json!({ "spec": {} })).unwrap();
        assert_eq!(pv.spec.node("hostname"), None);
    }

    #[test]
    fn helper_pod_is_pinned_and_privileged() {
        let env = ExpansionEnv {
            params: StorageParams {
                storage_model: "LOGICAL_R1".into(),
                disk_type: Some(DiskType::Ssd),
                full_disk: false,
            },
            volume_id: VolumeId::from("pvc-1"),
            capacity_bytes: 1 << 30,
            mount_dest: PathBuf::from("/mnt/lsdisk"),
            image_name: "disk.img".into(),
        };
        let name = helper_pod_name(&env.volume_id);
        let pod = helper_pod_manifest(&name, "node-01", "lsdisk:1.0", "/mnt/lsdisk", &env);

        assert_eq!(pod["metadata"]["name"], "lsdisk-expand-pvc-1");
        assert_eq!(pod["spec"]["nodeName"], "node-01");
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["securityContext"]["privileged"], true);
        assert_eq!(container["command"], json!(["lsdisk", "extend-image"]));
        let env = container["env"].as_array().unwrap();
        assert!(env.contains(&json!({ "name": "CAPACITY_RANGE", "value": "1073741824" })));
        assert!(env.contains(&json!({ "name": "DISK_TYPE", "value": "SSD" })));
    }
}

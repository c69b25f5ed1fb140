//! Cluster API surface
//!
//! [`ClusterApi`] is the seam between the environment and a live cluster.
//! The live implementation, [`KubeCluster`], drives typed API calls for
//! resource reads and writes, and shells out to `kubectl` for manifest
//! files, throwaway probe objects, and in-pod exec. Tests inject a mock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::shell;
use crate::{Error, Result};

/// Label key the mesh puts on its own pods (ingress, gateways).
const MESH_POD_LABEL: &str = "mesh";

/// Label key test applications carry.
const APP_POD_LABEL: &str = "app";

/// Label marking a secret as a multi-cluster discovery secret.
const DISCOVERY_SECRET_LABEL: &str = "mesh/multiCluster";

/// Identifies one of the participating clusters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterId {
    /// The cluster the control plane is installed on.
    Primary,
    /// The optional second cluster joined to the primary.
    Remote,
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// How a service is exposed for address resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// Reach the service through a node port on the pod's host.
    NodePort,
    /// Reach the service through its load-balancer address.
    LoadBalancer,
}

/// Operations the environment needs from a cluster.
///
/// Implementations must tolerate being called against a cluster in an
/// intermediate state: teardown paths treat "already absent" as success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of the pods in `kube-system`, as an API-responsiveness probe.
    async fn system_pod_names(&self) -> Result<Vec<String>>;

    /// Apply a manifest file into a namespace.
    async fn apply_manifest(&self, namespace: &str, manifest: &Path) -> Result<()>;

    /// Delete the resources described by a manifest file.
    async fn delete_manifest(&self, namespace: &str, manifest: &Path) -> Result<()>;

    /// Apply an inline manifest without logging. Returns combined output so
    /// callers can inspect probe responses.
    async fn apply_inline_silent(&self, manifest: &str) -> Result<String>;

    /// Delete an inline manifest without logging.
    async fn delete_inline_silent(&self, manifest: &str) -> Result<String>;

    /// Create a namespace. An existing namespace is a resource conflict.
    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Delete a namespace. An absent namespace is not an error.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Whether the namespace is fully gone (not just terminating).
    async fn namespace_absent(&self, name: &str) -> Result<bool>;

    /// Create a TLS secret from key/cert files on disk.
    async fn create_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        key_file: &Path,
        cert_file: &Path,
    ) -> Result<()>;

    /// Create an opaque secret from in-memory entries.
    async fn create_opaque_secret(
        &self,
        namespace: &str,
        name: &str,
        entries: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()>;

    /// Register a discovery secret carrying a remote cluster's kubeconfig.
    async fn create_discovery_secret(
        &self,
        namespace: &str,
        name: &str,
        kubeconfig: &Path,
    ) -> Result<()>;

    /// Pods in the namespace grouped by their `app` label value.
    async fn app_pods(&self, namespace: &str) -> Result<HashMap<String, Vec<String>>>;

    /// Pod names matching a label selector.
    async fn pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;

    /// Whether every pod in the namespace is running (or completed).
    async fn pods_running(&self, namespace: &str) -> Result<bool>;

    /// Whether every deployment in the namespace has rolled out.
    async fn deployments_rolled_out(&self, namespace: &str) -> Result<bool>;

    /// Whether the named job has completed successfully.
    async fn job_succeeded(&self, namespace: &str, job: &str) -> Result<bool>;

    /// Run a command inside a pod's container, returning combined output.
    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &str,
    ) -> Result<String>;

    /// External address of a service, resolved per exposure kind.
    async fn service_address(
        &self,
        namespace: &str,
        service: &str,
        pod_label: &str,
        kind: ServiceKind,
    ) -> Result<String>;

    /// Whether a validating-webhook configuration with this name exists.
    async fn validating_webhook_exists(&self, name: &str) -> Result<bool>;

    /// Delete cluster-scoped roles and role bindings whose name contains
    /// `name_fragment`. Substring match, cluster-wide.
    async fn delete_cluster_scoped_rbac(&self, name_fragment: &str) -> Result<()>;

    /// Serialized body of the operator's control-plane resource.
    async fn control_plane_resource_text(&self, namespace: &str, name: &str) -> Result<String>;

    /// Delete the operator's control-plane resource. Absent is not an error.
    async fn delete_control_plane_resource(&self, namespace: &str, name: &str) -> Result<()>;

    /// Dump pod logs from a namespace into a directory, best effort.
    async fn save_pod_logs(&self, namespace: &str, dir: &Path) -> Result<()>;
}

/// The operator's control-plane custom resource.
fn control_plane_api_resource() -> ApiResource {
    ApiResource {
        group: "install.mesh.dev".into(),
        version: "v1alpha1".into(),
        kind: "MeshOperator".into(),
        api_version: "install.mesh.dev/v1alpha1".into(),
        plural: "meshoperators".into(),
    }
}

/// Live cluster backed by a kube client plus `kubectl` for file-based ops.
pub struct KubeCluster {
    client: Client,
    kubeconfig: Option<PathBuf>,
}

impl KubeCluster {
    /// Connect using a kubeconfig file, or the ambient configuration when
    /// `kubeconfig` is `None`.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let parsed = Kubeconfig::read_from(path).map_err(|e| {
                    Error::cluster(format!("cannot read kubeconfig {}: {}", path.display(), e))
                })?;
                let config =
                    kube::Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| Error::cluster(format!("bad kubeconfig: {}", e)))?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self {
            client,
            kubeconfig: kubeconfig.map(Path::to_path_buf),
        })
    }

    fn kubeconfig_arg(&self) -> Option<String> {
        self.kubeconfig
            .as_ref()
            .map(|path| format!("--kubeconfig={}", path.display()))
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        if let Some(arg) = self.kubeconfig_arg() {
            full.push(arg);
        }
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        shell::run("kubectl", &refs).await
    }

    async fn kubectl_silent_stdin(&self, args: &[&str], input: &str) -> Result<String> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        if let Some(arg) = self.kubeconfig_arg() {
            full.push(arg);
        }
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        shell::run_silent_with_stdin("kubectl", &refs, input).await
    }

    async fn create_secret(&self, namespace: &str, secret: Secret, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ref e)) if e.code == 409 => Err(Error::conflict(format!(
                "secret {} already exists in {}",
                name, namespace
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn system_pod_names(&self) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), "kube-system");
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items.iter().map(|p| p.name_any()).collect())
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &Path) -> Result<()> {
        let path = manifest.display().to_string();
        self.kubectl(&["apply", "-n", namespace, "-f", &path]).await?;
        Ok(())
    }

    async fn delete_manifest(&self, namespace: &str, manifest: &Path) -> Result<()> {
        let path = manifest.display().to_string();
        self.kubectl(&["delete", "-n", namespace, "-f", &path]).await?;
        Ok(())
    }

    async fn apply_inline_silent(&self, manifest: &str) -> Result<String> {
        self.kubectl_silent_stdin(&["apply", "-f", "-"], manifest).await
    }

    async fn delete_inline_silent(&self, manifest: &str) -> Result<String> {
        self.kubectl_silent_stdin(&["delete", "-f", "-"], manifest).await
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = name, "namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ref e)) if e.code == 409 => {
                Err(Error::conflict(format!("namespace {} already exists", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = name, "namespace deletion initiated");
                Ok(())
            }
            Err(kube::Error::Api(ref e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn namespace_absent(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_none())
    }

    async fn create_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        key_file: &Path,
        cert_file: &Path,
    ) -> Result<()> {
        let key = std::fs::read(key_file)?;
        let cert = std::fs::read(cert_file)?;

        let mut data = BTreeMap::new();
        data.insert("tls.key".to_string(), ByteString(key));
        data.insert("tls.crt".to_string(), ByteString(cert));

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Secret::default()
        };
        self.create_secret(namespace, secret, name).await
    }

    async fn create_opaque_secret(
        &self,
        namespace: &str,
        name: &str,
        entries: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let data = entries
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        };
        self.create_secret(namespace, secret, name).await
    }

    async fn create_discovery_secret(
        &self,
        namespace: &str,
        name: &str,
        kubeconfig: &Path,
    ) -> Result<()> {
        let contents = std::fs::read(kubeconfig)?;

        let mut labels = BTreeMap::new();
        labels.insert(DISCOVERY_SECRET_LABEL.to_string(), "true".to_string());

        let mut data = BTreeMap::new();
        data.insert(name.to_string(), ByteString(contents));

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        };
        self.create_secret(namespace, secret, name).await
    }

    async fn app_pods(&self, namespace: &str) -> Result<HashMap<String, Vec<String>>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(APP_POD_LABEL)).await?;
        Ok(group_by_app_label(&pods.items))
    }

    async fn pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items.iter().map(|p| p.name_any()).collect())
    }

    async fn pods_running(&self, namespace: &str) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;
        Ok(all_pods_running(&pods.items))
    }

    async fn deployments_rolled_out(&self, namespace: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployments = api.list(&ListParams::default()).await?;
        Ok(deployments.items.iter().all(deployment_ready))
    }

    async fn job_succeeded(&self, namespace: &str, job: &str) -> Result<bool> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = api.get(job).await?;
        Ok(job
            .status
            .as_ref()
            .and_then(|s| s.succeeded)
            .unwrap_or(0)
            > 0)
    }

    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &str,
    ) -> Result<String> {
        self.kubectl(&[
            "exec", "-n", namespace, pod, "-c", container, "--", "sh", "-c", command,
        ])
        .await
    }

    async fn service_address(
        &self,
        namespace: &str,
        service: &str,
        pod_label: &str,
        kind: ServiceKind,
    ) -> Result<String> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get(service).await?;

        match kind {
            ServiceKind::LoadBalancer => {
                let ingress = svc
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref())
                    .and_then(|list| list.first())
                    .ok_or_else(|| {
                        Error::cluster(format!("service {} has no ingress address yet", service))
                    })?;
                ingress
                    .ip
                    .clone()
                    .or_else(|| ingress.hostname.clone())
                    .ok_or_else(|| {
                        Error::cluster(format!("service {} ingress has no address", service))
                    })
            }
            ServiceKind::NodePort => {
                let port = svc
                    .spec
                    .as_ref()
                    .and_then(|s| s.ports.as_ref())
                    .and_then(|ports| ports.iter().find_map(|p| p.node_port))
                    .ok_or_else(|| {
                        Error::cluster(format!("service {} has no node port", service))
                    })?;

                let selector = format!("{}={}", MESH_POD_LABEL, pod_label);
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let list = pods.list(&ListParams::default().labels(&selector)).await?;
                let host_ip = list
                    .items
                    .iter()
                    .find_map(|p| p.status.as_ref().and_then(|s| s.host_ip.clone()))
                    .ok_or_else(|| {
                        Error::cluster(format!("no running pod with label {}", selector))
                    })?;
                Ok(format!("{}:{}", host_ip, port))
            }
        }
    }

    async fn validating_webhook_exists(&self, name: &str) -> Result<bool> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_cluster_scoped_rbac(&self, name_fragment: &str) -> Result<()> {
        let mut failures = Vec::new();

        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        for binding in bindings.list(&ListParams::default()).await?.items {
            let name = binding.name_any();
            if !name.contains(name_fragment) {
                continue;
            }
            if let Err(e) = bindings.delete(&name, &DeleteParams::default()).await {
                if !already_gone(&e) {
                    failures.push(format!("clusterrolebinding {}: {}", name, e));
                }
            }
        }

        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        for role in roles.list(&ListParams::default()).await?.items {
            let name = role.name_any();
            if !name.contains(name_fragment) {
                continue;
            }
            if let Err(e) = roles.delete(&name, &DeleteParams::default()).await {
                if !already_gone(&e) {
                    failures.push(format!("clusterrole {}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::cluster(failures.join("; ")))
        }
    }

    async fn control_plane_resource_text(&self, namespace: &str, name: &str) -> Result<String> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &control_plane_api_resource());
        let resource = api.get(name).await?;
        serde_json::to_string(&resource.data)
            .map_err(|e| Error::cluster(format!("cannot serialize {}: {}", name, e)))
    }

    async fn delete_control_plane_resource(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &control_plane_api_resource());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ref e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_pod_logs(&self, namespace: &str, dir: &Path) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;

        std::fs::create_dir_all(dir)?;
        for pod in &pods.items {
            let name = pod.name_any();
            match self
                .kubectl(&["logs", "-n", namespace, name.as_str(), "--all-containers=true"])
                .await
            {
                Ok(output) => {
                    let file = dir.join(format!("{}.log", name));
                    if let Err(e) = std::fs::write(&file, output) {
                        warn!(pod = %name, error = %e, "cannot write pod log");
                    }
                }
                Err(e) => warn!(pod = %name, error = %e, "cannot fetch pod log"),
            }
        }
        Ok(())
    }
}

fn already_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Group pods by their `app` label value, preserving list order.
fn group_by_app_label(pods: &[Pod]) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for pod in pods {
        let app = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(APP_POD_LABEL));
        if let Some(app) = app {
            grouped.entry(app.clone()).or_default().push(pod.name_any());
        }
    }
    grouped
}

/// All pods have reached `Running` or `Succeeded`, and there is at least one.
fn all_pods_running(pods: &[Pod]) -> bool {
    if pods.is_empty() {
        return false;
    }
    pods.iter().all(|pod| {
        matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Running") | Some("Succeeded")
        )
    })
}

/// A deployment is ready when its updated and ready replica counts have both
/// reached the declared replica count.
fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = match &deployment.status {
        Some(status) => status,
        None => return false,
    };
    status.updated_replicas.unwrap_or(0) >= desired && status.ready_replicas.unwrap_or(0) >= desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod(name: &str, app: Option<&str>, phase: &str) -> Pod {
        let labels = app.map(|value| {
            let mut map = BTreeMap::new();
            map.insert(APP_POD_LABEL.to_string(), value.to_string());
            map
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    fn deployment(desired: i32, updated: i32, ready: i32) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(desired),
                ..DeploymentSpec::default()
            }),
            status: Some(DeploymentStatus {
                updated_replicas: Some(updated),
                ready_replicas: Some(ready),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn test_group_by_app_label() {
        let pods = vec![
            pod("a-1", Some("a"), "Running"),
            pod("b-1", Some("b"), "Running"),
            pod("a-2", Some("a"), "Running"),
            pod("unlabeled", None, "Running"),
        ];
        let grouped = group_by_app_label(&pods);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["a"], vec!["a-1", "a-2"]);
        assert_eq!(grouped["b"], vec!["b-1"]);
    }

    #[test]
    fn test_all_pods_running_requires_every_pod() {
        assert!(!all_pods_running(&[]));
        assert!(all_pods_running(&[
            pod("a", None, "Running"),
            pod("b", None, "Succeeded"),
        ]));
        assert!(!all_pods_running(&[
            pod("a", None, "Running"),
            pod("b", None, "Pending"),
        ]));
    }

    #[test]
    fn test_deployment_ready_checks_updated_and_ready() {
        assert!(deployment_ready(&deployment(2, 2, 2)));
        assert!(!deployment_ready(&deployment(2, 2, 1)));
        assert!(!deployment_ready(&deployment(2, 1, 2)));
        // A deployment with no status has not started rolling out.
        assert!(!deployment_ready(&Deployment::default()));
    }

    #[test]
    fn test_cluster_id_display() {
        assert_eq!(ClusterId::Primary.to_string(), "primary");
        assert_eq!(ClusterId::Remote.to_string(), "remote");
    }
}

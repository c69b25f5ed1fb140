//! Environment manager
//!
//! The facade tests drive. It owns the configuration snapshot and the
//! install plan derived from it, selects the installer strategy once for its
//! lifetime, memoizes the ingress addresses, caches app pods per cluster,
//! and performs best-effort, idempotent teardown. Cluster handles and the
//! package-manager driver are built by the caller and injected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cleanup::CleanupSequencer;
use crate::cluster::{ClusterApi, ClusterId, ServiceKind};
use crate::config::TestConfig;
use crate::helm::PackageManager;
use crate::install::{self, InstallStrategy};
use crate::multicluster::RemoteCoordinator;
use crate::plan::{self, InstallPlan, StrategyKind};
use crate::pods::{AppPods, PodIndex};
use crate::poll::Poller;
use crate::{Error, Result};
use crate::{
    INGRESS_CERTS_SECRET, INGRESS_CERT_FILE, INGRESS_GATEWAY_LABEL, INGRESS_GATEWAY_SERVICE,
    INGRESS_KEY_FILE, INGRESS_LABEL, INGRESS_SERVICE, OPERATOR_NAMESPACE, VALIDATOR_WEBHOOK,
};

/// Upper bound for the cluster API to become responsive.
const API_READY_TIMEOUT: Duration = Duration::from_secs(180);

/// Interval between API responsiveness checks.
const API_READY_INTERVAL: Duration = Duration::from_millis(200);

/// Attempts while waiting for the namespace and webhook to be gone.
const DELETE_WAIT_ATTEMPTS: u32 = 180;

/// Interval between absence checks.
const DELETE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts while waiting for a job to complete.
const JOB_ATTEMPTS: u32 = 15;

/// Interval between job checks. No backoff.
const JOB_INTERVAL: Duration = Duration::from_secs(1);

/// Admin port the route dump is served on inside a pod.
const ADMIN_PORT: u16 = 15000;

/// Memoized address-probe result. The probe runs at most once; success and
/// failure are both permanent for the process.
type AddressCell = Mutex<Option<std::result::Result<String, String>>>;

/// The test environment for one run.
pub struct Environment {
    config: TestConfig,
    plan: InstallPlan,
    primary: Arc<dyn ClusterApi>,
    remote: Option<Arc<RemoteCoordinator>>,
    package_manager: Arc<dyn PackageManager>,
    strategy: Box<dyn InstallStrategy>,
    ingress: AddressCell,
    ingress_gateway: AddressCell,
    primary_pods: PodIndex,
    remote_pods: PodIndex,
}

impl Environment {
    /// Build the environment: resolves the install plan from the snapshot
    /// and fixes the installer strategy for the environment's lifetime.
    pub fn new(
        config: TestConfig,
        primary: Arc<dyn ClusterApi>,
        remote: Option<Arc<RemoteCoordinator>>,
        package_manager: Arc<dyn PackageManager>,
    ) -> Result<Self> {
        let plan = plan::resolve(&config)?;
        let strategy = install::select(
            plan.strategy,
            &config,
            primary.clone(),
            package_manager.clone(),
            remote.clone(),
        );
        Ok(Self {
            config,
            plan,
            primary,
            remote,
            package_manager,
            strategy,
            ingress: AddressCell::default(),
            ingress_gateway: AddressCell::default(),
            primary_pods: PodIndex::new(),
            remote_pods: PodIndex::new(),
        })
    }

    /// The configuration snapshot this environment was built from.
    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// The resolved install plan.
    pub fn install_plan(&self) -> &InstallPlan {
        &self.plan
    }

    /// Bring the environment up: working directories, cluster readiness,
    /// the selected install strategy, and the ingress TLS secret.
    pub async fn setup(&self) -> Result<()> {
        info!(skip_setup = self.config.skip_setup, "setting up test environment");
        std::fs::create_dir_all(self.config.yaml_dir())?;

        self.wait_for_cluster_api().await?;

        if !self.config.skip_setup {
            self.strategy.install(&self.plan).await?;

            // The ingress secret may survive a previous run; that is fine.
            let key = self.config.release_dir.join(INGRESS_KEY_FILE);
            let cert = self.config.release_dir.join(INGRESS_CERT_FILE);
            if let Err(e) = self
                .primary
                .create_tls_secret(
                    &self.config.system_namespace(),
                    INGRESS_CERTS_SECRET,
                    &key,
                    &cert,
                )
                .await
            {
                warn!(error = %e, "ingress secret provisioning skipped");
            }
        }

        Ok(())
    }

    /// Tear the environment down. A no-op when setup or cleanup is skipped.
    ///
    /// Every step runs regardless of earlier failures; all failures come
    /// back in one combined error.
    pub async fn teardown(&self) -> Result<()> {
        if self.config.skip_setup || self.config.skip_cleanup {
            info!("teardown skipped by configuration");
            return Ok(());
        }

        info!("tearing down test environment");
        let namespace = self.config.namespace();
        let mut cleanup = CleanupSequencer::new();

        cleanup.record(
            "uninstall control plane",
            self.strategy.uninstall(&self.plan).await,
        );
        cleanup.record(
            "delete namespace",
            self.primary.delete_namespace(&namespace).await,
        );
        cleanup.record(
            "delete cluster-scoped rbac",
            self.primary.delete_cluster_scoped_rbac(&namespace).await,
        );
        if let Some(remote) = &self.remote {
            cleanup.record(
                "delete remote namespace",
                remote.delete_namespace(&namespace).await,
            );
        }

        // The webhook configuration is garbage-collected asynchronously;
        // both it and the namespace must be gone before tests re-run.
        let watched = match self.plan.strategy {
            StrategyKind::Operator => OPERATOR_NAMESPACE.to_string(),
            _ => namespace.clone(),
        };
        let absence = Poller::attempts(
            format!("namespace {} fully deleted", watched),
            DELETE_WAIT_ATTEMPTS,
            DELETE_WAIT_INTERVAL,
        );
        let watched_ns = watched.as_str();
        let waited = absence
            .run(|| async move {
                match self.primary.namespace_absent(watched_ns).await {
                    Ok(false) => return Err(format!("namespace {} still present", watched_ns)),
                    Ok(true) => {}
                    Err(e) => return Err(e.to_string()),
                }
                match self.primary.validating_webhook_exists(VALIDATOR_WEBHOOK).await {
                    Ok(true) => Err(format!(
                        "validating webhook {} still present",
                        VALIDATOR_WEBHOOK
                    )),
                    Ok(false) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        if let Err(e) = waited {
            cleanup.record_failure("wait for namespace deletion", e.to_string());
        }

        cleanup.finish()
    }

    /// Address of the ingress service, memoized for the process lifetime.
    pub async fn ingress(&self) -> Result<String> {
        self.resolve_address(&self.ingress, INGRESS_SERVICE, INGRESS_LABEL)
            .await
    }

    /// Address of the ingress gateway service, memoized likewise.
    pub async fn ingress_gateway(&self) -> Result<String> {
        self.resolve_address(
            &self.ingress_gateway,
            INGRESS_GATEWAY_SERVICE,
            INGRESS_GATEWAY_LABEL,
        )
        .await
    }

    /// App pods for a cluster, from the cache when non-empty.
    ///
    /// On a cache miss the live cluster is queried; a successful query
    /// replaces the cache, a failed one is logged and not cached, so the
    /// next call retries. The returned map is always the caller's own copy.
    pub async fn get_app_pods(&self, cluster: ClusterId) -> AppPods {
        let index = self.pod_index(cluster);
        let cached = index.snapshot().await;
        if !cached.is_empty() {
            return cached;
        }

        let api = match self.cluster(cluster) {
            Some(api) => api,
            None => return AppPods::new(),
        };
        match api.app_pods(&self.config.namespace()).await {
            Ok(pods) => {
                info!(cluster = %cluster, apps = pods.len(), "fetched app pods");
                index.replace(&pods).await;
                pods
            }
            Err(e) => {
                error!(cluster = %cluster, error = %e, "cannot fetch app pods");
                AppPods::new()
            }
        }
    }

    /// Wait until the named job has completed successfully.
    pub async fn check_job_succeeded(&self, cluster: ClusterId, job: &str) -> Result<()> {
        let api = self
            .cluster(cluster)
            .ok_or_else(|| Error::cluster(format!("no {} cluster configured", cluster)))?;

        let poller = Poller::attempts(format!("job {} completion", job), JOB_ATTEMPTS, JOB_INTERVAL);
        poller
            .run(|| async move {
                match api.job_succeeded(&self.config.namespace(), job).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("job {} not succeeded", job)),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;
        Ok(())
    }

    /// Dump the routing state of the app's first pod on every cluster,
    /// concatenated under per-cluster headers.
    pub async fn get_routes(&self, app: &str) -> Result<String> {
        let command = format!("client --url http://localhost:{}/config_dump", ADMIN_PORT);
        let mut routes = String::new();

        for cluster in self.cluster_ids() {
            let api = match self.cluster(cluster) {
                Some(api) => api,
                None => continue,
            };
            let pods = self.get_app_pods(cluster).await;
            let pod = pods
                .get(app)
                .and_then(|list| list.first())
                .cloned()
                .ok_or_else(|| {
                    Error::cluster(format!(
                        "missing pod names for app {:?} on {} cluster",
                        app, cluster
                    ))
                })?;

            let output = api
                .pod_exec(&self.config.namespace(), &pod, "app", &command)
                .await
                .map_err(|e| Error::cluster(format!("failed to get routes: {}", e)))?;

            routes.push_str(&format!("Routes From {} Cluster:\n", cluster));
            routes.push_str(&output);
        }

        Ok(routes)
    }

    /// Deploy the package-manager controller on demand.
    ///
    /// A no-op when the package manager drives the install: the chart flow
    /// deploys the controller itself.
    pub async fn deploy_package_controller(&self) -> Result<()> {
        if self.plan.strategy == StrategyKind::Helm {
            return Ok(());
        }
        install::helm::deploy_controller(
            &self.config,
            self.primary.as_ref(),
            self.package_manager.as_ref(),
        )
        .await
    }

    async fn wait_for_cluster_api(&self) -> Result<()> {
        info!("waiting for the cluster API to become responsive");
        let poller = Poller::deadline("cluster API", API_READY_TIMEOUT, API_READY_INTERVAL);
        poller
            .run(|| async move {
                self.primary
                    .system_pod_names()
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            })
            .await?;
        Ok(())
    }

    async fn resolve_address(
        &self,
        cell: &AddressCell,
        service: &str,
        pod_label: &str,
    ) -> Result<String> {
        let mut slot = cell.lock().await;
        if let Some(cached) = slot.as_ref() {
            return cached.clone().map_err(Error::Cluster);
        }

        let kind = if self.config.local_cluster {
            ServiceKind::NodePort
        } else {
            ServiceKind::LoadBalancer
        };
        let result = self
            .primary
            .service_address(&self.config.system_namespace(), service, pod_label, kind)
            .await
            .map(|address| format!("http://{}", address))
            .map_err(|e| e.to_string());

        *slot = Some(result.clone());
        result.map_err(Error::Cluster)
    }

    fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids = vec![ClusterId::Primary];
        if self.remote.is_some() {
            ids.push(ClusterId::Remote);
        }
        ids
    }

    fn cluster(&self, id: ClusterId) -> Option<&Arc<dyn ClusterApi>> {
        match id {
            ClusterId::Primary => Some(&self.primary),
            ClusterId::Remote => self.remote.as_ref().map(|r| r.cluster()),
        }
    }

    fn pod_index(&self, id: ClusterId) -> &PodIndex {
        match id {
            ClusterId::Primary => &self.primary_pods,
            ClusterId::Remote => &self.remote_pods,
        }
    }
}

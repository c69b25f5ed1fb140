//! Manifest installer strategy
//!
//! Materializes the init and main manifests from the release templates and
//! applies them directly. Optionally deploys the CNI components (fetched and
//! rendered from their chart), the automatic sidecar injector, and the
//! remote-cluster join, then waits for rollouts and the validation webhook.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{cni_set_values, wait_for_rollouts, wait_for_validation, InstallStrategy};
use crate::cleanup::CleanupSequencer;
use crate::cluster::ClusterApi;
use crate::config::TestConfig;
use crate::helm::PackageManager;
use crate::multicluster::{self, RemoteCoordinator};
use crate::plan::InstallPlan;
use crate::poll::Poller;
use crate::template::{self, TemplateParams};
use crate::{Error, Result};
use crate::{CNI_CHART_NAME, INIT_INSTALL_FILE, INSTALL_DIR};

/// Settle delay after the init manifest. A fixed sleep standing in for a
/// real readiness predicate; kept until one is identifiable.
const INIT_SETTLE_DELAY: Duration = Duration::from_secs(20);

/// Settle delay after the remote join, before dependent steps proceed.
const REMOTE_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Upper bound for the CNI pod to be scheduled.
const CNI_DEPLOY_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between CNI scheduling checks.
const CNI_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound for the CNI pods to reach running.
const CNI_RUNNING_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between CNI running checks.
const CNI_RUNNING_INTERVAL: Duration = Duration::from_secs(1);

/// Label selector for the CNI daemon pods.
const CNI_POD_SELECTOR: &str = "k8s-app=mesh-cni-node";

/// Installs the control plane by applying materialized manifests.
pub struct ManifestStrategy {
    config: TestConfig,
    primary: Arc<dyn ClusterApi>,
    package_manager: Arc<dyn PackageManager>,
    remote: Option<Arc<RemoteCoordinator>>,
}

impl ManifestStrategy {
    /// Strategy over the primary cluster, with an optional remote join.
    pub fn new(
        config: TestConfig,
        primary: Arc<dyn ClusterApi>,
        package_manager: Arc<dyn PackageManager>,
        remote: Option<Arc<RemoteCoordinator>>,
    ) -> Self {
        Self {
            config,
            primary,
            package_manager,
            remote,
        }
    }

    fn materialize(&self, file: &str, params: &TemplateParams) -> Result<PathBuf> {
        let src = self.config.release_dir.join(INSTALL_DIR).join(file);
        let dst = self.config.yaml_dir().join(file);
        template::materialize_file(&src, &dst, params)?;
        Ok(dst)
    }

    async fn deploy_cni(&self, namespace: &str) -> Result<()> {
        if self.config.multi_cluster() {
            warn!("CNI deployment is not supported in multi-cluster runs");
        }
        info!("deploying CNI components");

        let chart_dir = self.config.work_dir.join("cni-chart");
        self.package_manager
            .fetch(&self.config.cni_helm_repo, &chart_dir)
            .await?;

        let output = self.config.work_dir.join("mesh-cni-install.yaml");
        self.package_manager
            .template(
                &chart_dir.join(CNI_CHART_NAME),
                CNI_CHART_NAME,
                namespace,
                &cni_set_values(&self.config),
                &output,
            )
            .await?;

        self.primary.apply_manifest(namespace, &output).await?;

        let scheduled = Poller::deadline("CNI pod scheduling", CNI_DEPLOY_TIMEOUT, CNI_POLL_INTERVAL);
        scheduled
            .run(|| async move {
                match self.primary.pod_names(namespace, CNI_POD_SELECTOR).await {
                    Ok(pods) if !pods.is_empty() => Ok(()),
                    Ok(_) => Err("CNI pod not scheduled yet".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;

        // The CNI is the only workload in the namespace at this point.
        let running = Poller::deadline("CNI pods running", CNI_RUNNING_TIMEOUT, CNI_RUNNING_INTERVAL);
        running
            .run(|| async move {
                match self.primary.pods_running(namespace).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("CNI pods not running yet".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;
        Ok(())
    }

    async fn deploy_injector(&self, namespace: &str, params: &TemplateParams) -> Result<()> {
        let src = self
            .config
            .release_dir
            .join(INSTALL_DIR)
            .join(&self.config.sidecar_injector_file);
        let template_text = std::fs::read_to_string(&src).map_err(|e| {
            Error::manifest(format!("cannot read injector template {}: {}", src.display(), e))
        })?;
        let content = template::materialize_injector(&template_text, params)?;

        let dst = self.config.yaml_dir().join(&self.config.sidecar_injector_file);
        std::fs::write(&dst, content)?;
        self.primary.apply_manifest(namespace, &dst).await
    }
}

#[async_trait]
impl InstallStrategy for ManifestStrategy {
    async fn install(&self, plan: &InstallPlan) -> Result<()> {
        let namespace = self.config.namespace();

        if self.config.use_cni {
            self.deploy_cni(&namespace).await?;
        }

        self.primary.create_namespace(&namespace).await?;

        // Init manifest first, then a settle delay before the main manifest.
        let init = self.materialize(INIT_INSTALL_FILE, &plan.params)?;
        self.primary.apply_manifest(&namespace, &init).await?;
        tokio::time::sleep(INIT_SETTLE_DELAY).await;

        let main = self.materialize(&plan.manifest, &plan.params)?;

        if self.config.multi_cluster() {
            if let Err(e) = multicluster::create_trust_anchors(
                self.primary.as_ref(),
                &namespace,
                &self.config.release_dir,
            )
            .await
            {
                warn!(error = %e, "trust-anchor provisioning on primary skipped");
            }
        }

        self.primary.apply_manifest(&namespace, &main).await?;

        if let Some(remote) = &self.remote {
            remote.join(&self.config, self.primary.as_ref()).await?;
            tokio::time::sleep(REMOTE_SETTLE_DELAY).await;
        }

        if self.config.auto_inject {
            self.deploy_injector(&namespace, &plan.params).await?;
        }

        wait_for_rollouts(self.primary.as_ref(), &namespace).await?;
        if let Some(remote) = &self.remote {
            if remote.await_rollouts(&self.config) {
                wait_for_rollouts(remote.cluster().as_ref(), &namespace).await?;
            }
        }

        if self.config.config_validation {
            wait_for_validation(self.primary.as_ref()).await?;
        }

        Ok(())
    }

    async fn uninstall(&self, plan: &InstallPlan) -> Result<()> {
        let namespace = self.config.namespace();
        let mut cleanup = CleanupSequencer::new();

        if self.config.auto_inject {
            let injector = self.config.yaml_dir().join(&self.config.sidecar_injector_file);
            cleanup.record(
                "delete sidecar injector",
                self.primary.delete_manifest(&namespace, &injector).await,
            );
        }

        let main = self.config.yaml_dir().join(&plan.manifest);
        if let Err(e) = self.primary.delete_manifest(&namespace, &main).await {
            // Resources being gone already is the common case on re-entry;
            // anything that remains goes down with the namespace.
            info!(manifest = %main.display(), error = %e, "manifest delete reported errors");
        }

        cleanup.finish()
    }
}

//! Package-manager installer strategy
//!
//! Deploys the cluster-resident controller first, installs the CRD manifests
//! individually, builds the chart override set from the feature flags,
//! dry-runs the install to fail fast on templating errors, installs for
//! real, and finishes with the chart's built-in smoke tests (all pods must
//! be running before they are allowed to run).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{cni_set_values, wait_for_validation, InstallStrategy};
use crate::cleanup::CleanupSequencer;
use crate::cluster::ClusterApi;
use crate::config::TestConfig;
use crate::helm::PackageManager;
use crate::plan::InstallPlan;
use crate::poll::Poller;
use crate::{Error, Result};
use crate::{CNI_CHART_NAME, CONTROLLER_ACCOUNT_FILE, CRD_INSTALL_FILES, HELM_CHART_NAME, HELM_INSTALL_DIR};

/// Directory holding the CRD manifests inside the release.
const CRD_DIR: &str = "install/kubernetes/helm/mesh-init/files";

/// Attempts while waiting for the controller to serve.
const CONTROLLER_READY_ATTEMPTS: u32 = 30;

/// Interval between controller readiness checks.
const CONTROLLER_READY_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for all pods running before the chart's built-in tests.
const SMOKE_PODS_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between pod checks before the chart's built-in tests.
const SMOKE_PODS_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the control plane through the package-manager CLI.
pub struct HelmStrategy {
    config: TestConfig,
    primary: Arc<dyn ClusterApi>,
    package_manager: Arc<dyn PackageManager>,
}

impl HelmStrategy {
    /// Strategy over the primary cluster.
    pub fn new(
        config: TestConfig,
        primary: Arc<dyn ClusterApi>,
        package_manager: Arc<dyn PackageManager>,
    ) -> Self {
        Self {
            config,
            primary,
            package_manager,
        }
    }

    async fn smoke_test(&self, namespace: &str) -> Result<()> {
        let running = Poller::deadline("all pods running", SMOKE_PODS_TIMEOUT, SMOKE_PODS_INTERVAL);
        running
            .run(|| async move {
                match self.primary.pods_running(namespace).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("pods still starting".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;

        self.package_manager
            .test(HELM_CHART_NAME)
            .await
            .map_err(|e| Error::install(format!("chart smoke tests failed: {}", e)))
    }
}

/// Deploy the package-manager controller: apply its service account, run the
/// CLI's controller init, and wait until it answers.
pub(crate) async fn deploy_controller(
    config: &TestConfig,
    cluster: &dyn ClusterApi,
    package_manager: &dyn PackageManager,
) -> Result<()> {
    let account = config.release_dir.join(CONTROLLER_ACCOUNT_FILE);
    cluster.apply_manifest("kube-system", &account).await?;
    package_manager.controller_init().await?;

    let ready = Poller::attempts(
        "package-manager controller",
        CONTROLLER_READY_ATTEMPTS,
        CONTROLLER_READY_INTERVAL,
    );
    ready
        .run(|| async move {
            match package_manager.controller_running().await {
                Ok(true) => Ok(()),
                Ok(false) => Err("controller not serving yet".to_string()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;
    Ok(())
}

#[async_trait]
impl InstallStrategy for HelmStrategy {
    async fn install(&self, _plan: &InstallPlan) -> Result<()> {
        let namespace = self.config.namespace();

        deploy_controller(
            &self.config,
            self.primary.as_ref(),
            self.package_manager.as_ref(),
        )
        .await?;
        self.package_manager.client_init().await?;

        // CRDs go in individually, before the chart references them.
        for crd in CRD_INSTALL_FILES {
            let path = self.config.release_dir.join(CRD_DIR).join(crd);
            self.primary.apply_manifest("kube-system", &path).await?;
        }

        let mut set_values = build_overrides(&self.config);

        if self.config.use_cni {
            self.package_manager
                .install(
                    &self.config.cni_helm_repo,
                    CNI_CHART_NAME,
                    &namespace,
                    None,
                    &cni_set_values(&self.config),
                )
                .await?;
            set_values.push("cni.enabled=true".to_string());
        }

        let chart = self
            .config
            .release_dir
            .join(HELM_INSTALL_DIR)
            .display()
            .to_string();
        let value_file = self
            .config
            .value_file
            .as_ref()
            .map(|f| self.config.release_dir.join(HELM_INSTALL_DIR).join(f).display().to_string());

        // Dry run first: templating errors surface before anything lands on
        // the cluster.
        self.package_manager
            .install_dry_run(
                &chart,
                HELM_CHART_NAME,
                &namespace,
                value_file.as_deref(),
                &set_values,
            )
            .await?;

        info!(chart = %chart, namespace = %namespace, "installing control-plane chart");
        self.package_manager
            .install(
                &chart,
                HELM_CHART_NAME,
                &namespace,
                value_file.as_deref(),
                &set_values,
            )
            .await?;

        if self.config.config_validation {
            wait_for_validation(self.primary.as_ref()).await?;
        }

        self.smoke_test(&namespace).await
    }

    async fn uninstall(&self, _plan: &InstallPlan) -> Result<()> {
        let mut cleanup = CleanupSequencer::new();
        cleanup.record(
            "uninstall control-plane chart",
            self.package_manager.uninstall(HELM_CHART_NAME).await,
        );
        if self.config.use_cni {
            cleanup.record(
                "uninstall CNI chart",
                self.package_manager.uninstall(CNI_CHART_NAME).await,
            );
        }
        cleanup.finish()
    }
}

/// Override set for the control-plane chart, derived from the feature flags.
/// User-supplied raw overrides go last, verbatim.
pub(crate) fn build_overrides(config: &TestConfig) -> Vec<String> {
    let mut values = vec![format!("global.mtls.enabled={}", config.auth)];

    if config.auto_inject {
        values.push("sidecarInjectorWebhook.enabled=true".to_string());
    }

    match (config.use_mcp, config.config_validation) {
        (true, true) => {
            values.push("validator.enabled=true".to_string());
            values.push("global.useMCP=true".to_string());
            values.push("global.configValidation=true".to_string());
        }
        (true, false) => {
            values.push("validator.enabled=true".to_string());
            values.push("global.useMCP=true".to_string());
            values.push("global.configValidation=false".to_string());
        }
        (false, true) => {
            values.push("validator.enabled=true".to_string());
            values.push("global.useMCP=false".to_string());
            values.push("global.configValidation=true".to_string());
        }
        (false, false) => {
            values.push("validator.enabled=false".to_string());
            values.push("global.useMCP=false".to_string());
        }
    }

    if !config.outbound_traffic_policy.is_empty() {
        values.push(format!(
            "global.outboundTrafficPolicy.mode={}",
            config.outbound_traffic_policy
        ));
    }

    if config.egress_gateway {
        values.push("gateways.mesh-egressgateway.enabled=true".to_string());
    }

    // The chart assumes one hub/tag across components.
    if config.images.discovery.is_set() {
        values.push(format!("global.hub={}", config.images.discovery.hub));
        values.push(format!("global.tag={}", config.images.discovery.tag));
    }

    if !config.cluster_wide {
        values.push("global.oneNamespace=true".to_string());
    }

    values.push("global.enableChartTest=true".to_string());
    values.extend(config.helm_overrides.iter().cloned());
    values
}

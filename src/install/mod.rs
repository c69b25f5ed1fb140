//! Installer strategies
//!
//! Three mutually exclusive strategies bring the control plane up and down:
//! applying materialized manifests directly, driving the package-manager CLI
//! and charts, or applying the operator's custom resource and waiting for
//! the operator to deploy. Selection happens once, from the install plan,
//! and is fixed for the environment's lifetime.

pub mod helm;
pub mod manifest;
pub mod operator;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::config::TestConfig;
use crate::helm::PackageManager;
use crate::multicluster::RemoteCoordinator;
use crate::plan::{InstallPlan, StrategyKind};
use crate::poll::Poller;
use crate::{Result, VALIDATOR_WEBHOOK};

pub use helm::HelmStrategy;
pub use manifest::ManifestStrategy;
pub use operator::OperatorStrategy;

/// Upper bound for all workload rollouts to complete.
pub(crate) const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(960);

/// Interval between rollout checks.
pub(crate) const ROLLOUT_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for the validation webhook configuration to be registered.
const VALIDATION_REGISTER_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between webhook registration checks.
const VALIDATION_REGISTER_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for the webhook to answer an actual admission request.
const WEBHOOK_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between admission probe attempts.
const WEBHOOK_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Throwaway object applied and deleted to probe the validation webhook
/// end to end. Admission only answers once the webhook backend is serving.
const VALIDATION_PROBE: &str = r#"apiVersion: config.mesh.dev/v1alpha2
kind: rule
metadata:
  name: validation-readiness-probe
spec:
  match: request.headers["probe"] == "ready"
"#;

/// Contract shared by the installer strategies.
///
/// `uninstall` must tolerate partially-installed and already-removed state;
/// it is driven by teardown, which never aborts early.
#[async_trait]
pub trait InstallStrategy: Send + Sync {
    /// Bring the control plane up according to the plan.
    async fn install(&self, plan: &InstallPlan) -> Result<()>;

    /// Remove what `install` created.
    async fn uninstall(&self, plan: &InstallPlan) -> Result<()>;
}

/// Build the strategy selected by the plan.
pub fn select(
    kind: StrategyKind,
    config: &TestConfig,
    primary: Arc<dyn ClusterApi>,
    package_manager: Arc<dyn PackageManager>,
    remote: Option<Arc<RemoteCoordinator>>,
) -> Box<dyn InstallStrategy> {
    match kind {
        StrategyKind::Manifest => Box::new(ManifestStrategy::new(
            config.clone(),
            primary,
            package_manager,
            remote,
        )),
        StrategyKind::Helm => Box::new(HelmStrategy::new(config.clone(), primary, package_manager)),
        StrategyKind::Operator => Box::new(OperatorStrategy::new(config.clone(), primary)),
    }
}

/// Wait until every deployment in the namespace has rolled out.
pub(crate) async fn wait_for_rollouts(cluster: &dyn ClusterApi, namespace: &str) -> Result<()> {
    let poller = Poller::deadline(
        format!("workload rollouts in {}", namespace),
        ROLLOUT_TIMEOUT,
        ROLLOUT_INTERVAL,
    );
    poller
        .run(|| async move {
            match cluster.deployments_rolled_out(namespace).await {
                Ok(true) => Ok(()),
                Ok(false) => Err("rollouts still progressing".to_string()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;
    Ok(())
}

/// Wait for the config-validation webhook: first until its configuration is
/// registered, then until it actually answers an admission request. The
/// probe object is deleted afterwards, best effort.
pub(crate) async fn wait_for_validation(cluster: &dyn ClusterApi) -> Result<()> {
    let registered = Poller::deadline(
        "validation webhook registration",
        VALIDATION_REGISTER_TIMEOUT,
        VALIDATION_REGISTER_INTERVAL,
    );
    registered
        .run(|| async move {
            match cluster.validating_webhook_exists(VALIDATOR_WEBHOOK).await {
                Ok(true) => Ok(()),
                Ok(false) => Err("webhook configuration not registered".to_string()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;

    info!("probing validation webhook with a throwaway object");
    let serving = Poller::deadline(
        "validation webhook readiness",
        WEBHOOK_PROBE_TIMEOUT,
        WEBHOOK_PROBE_INTERVAL,
    );
    serving
        .run(|| async move {
            match cluster.apply_inline_silent(VALIDATION_PROBE).await {
                Ok(out) if !out.contains("connection refused") => Ok(()),
                Ok(out) => Err(out),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;

    let _ = cluster.delete_inline_silent(VALIDATION_PROBE).await;
    info!("validation webhook is ready");
    Ok(())
}

/// Override set for the CNI chart, shared by both delivery paths.
pub(crate) fn cni_set_values(config: &TestConfig) -> Vec<String> {
    let mut values = Vec::new();
    if config.images.cni.is_set() {
        values.push(format!("hub={}", config.images.cni.hub));
        values.push(format!("tag={}", config.images.cni.tag));
    }
    values.push("excludeNamespaces={}".to_string());
    values.push("pullPolicy=IfNotPresent".to_string());
    values.push("logLevel=debug".to_string());
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::config::ImageRef;

    #[test]
    fn test_cni_set_values_without_images() {
        let config = TestConfig::new("e2e-1");
        let values = cni_set_values(&config);
        assert!(values.contains(&"excludeNamespaces={}".to_string()));
        assert!(!values.iter().any(|v| v.starts_with("hub=")));
    }

    #[test]
    fn test_cni_set_values_with_images() {
        let mut config = TestConfig::new("e2e-1");
        config.images.cni = ImageRef::new("hub", "dev");
        let values = cni_set_values(&config);
        assert!(values.contains(&"hub=hub".to_string()));
        assert!(values.contains(&"tag=dev".to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_validation_probes_until_webhook_answers() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_validating_webhook_exists()
            .returning(|_| Ok(true));

        let mut calls = 0;
        cluster.expect_apply_inline_silent().returning(move |_| {
            calls += 1;
            if calls < 3 {
                Ok("error: connection refused".to_string())
            } else {
                Ok("rule configured".to_string())
            }
        });
        cluster
            .expect_delete_inline_silent()
            .times(1)
            .returning(|_| Ok(String::new()));

        wait_for_validation(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_rollouts_reports_last_state() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_deployments_rolled_out()
            .returning(|_| Ok(true));
        wait_for_rollouts(&cluster, "e2e-1").await.unwrap();
    }
}

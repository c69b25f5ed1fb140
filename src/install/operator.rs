//! Operator installer strategy
//!
//! Applies the operator's custom-resource manifest and waits for the
//! operator to report a healthy control plane. The manifest is copied into
//! the working directory as-is; the operator owns all parameterization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::InstallStrategy;
use crate::cleanup::CleanupSequencer;
use crate::cluster::ClusterApi;
use crate::config::TestConfig;
use crate::plan::InstallPlan;
use crate::poll::Poller;
use crate::{Error, Result};
use crate::{INSTALL_DIR, OPERATOR_NAMESPACE};

/// Name of the control-plane custom-resource instance.
pub const CONTROL_PLANE_RESOURCE: &str = "mesh-control-plane";

/// Marker the operator writes into the resource status once the control
/// plane is fully deployed.
const HEALTHY_MARKER: &str = "HEALTHY";

/// Upper bound for the operator to report a healthy control plane.
const OPERATOR_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between status reads.
const OPERATOR_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Installs the control plane through the operator.
pub struct OperatorStrategy {
    config: TestConfig,
    primary: Arc<dyn ClusterApi>,
}

impl OperatorStrategy {
    /// Strategy over the primary cluster.
    pub fn new(config: TestConfig, primary: Arc<dyn ClusterApi>) -> Self {
        Self { config, primary }
    }
}

#[async_trait]
impl InstallStrategy for OperatorStrategy {
    async fn install(&self, plan: &InstallPlan) -> Result<()> {
        let src = self.config.release_dir.join(INSTALL_DIR).join(&plan.manifest);
        let dst = self.config.yaml_dir().join(&plan.manifest);
        std::fs::copy(&src, &dst).map_err(|e| {
            Error::manifest(format!("cannot stage operator manifest {}: {}", src.display(), e))
        })?;

        self.primary.apply_manifest(OPERATOR_NAMESPACE, &dst).await?;

        let healthy = Poller::deadline(
            "operator-managed control plane",
            OPERATOR_TIMEOUT,
            OPERATOR_POLL_INTERVAL,
        );
        healthy
            .run(|| async move {
                match self
                    .primary
                    .control_plane_resource_text(OPERATOR_NAMESPACE, CONTROL_PLANE_RESOURCE)
                    .await
                {
                    Ok(text) if text.contains(HEALTHY_MARKER) => Ok(()),
                    Ok(_) => Err("control plane not healthy yet".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;

        info!("operator reports the control plane healthy");
        Ok(())
    }

    async fn uninstall(&self, _plan: &InstallPlan) -> Result<()> {
        let namespace = self.config.namespace();
        let mut cleanup = CleanupSequencer::new();

        // The operator's logs are the only record of why a deploy failed.
        let log_dir = self.config.work_dir.join("logs");
        cleanup.record(
            "save operator logs",
            self.primary.save_pod_logs(OPERATOR_NAMESPACE, &log_dir).await,
        );

        cleanup.record(
            "delete control-plane resource",
            self.primary
                .delete_control_plane_resource(OPERATOR_NAMESPACE, CONTROL_PLANE_RESOURCE)
                .await,
        );
        cleanup.record(
            "delete operator namespace",
            self.primary.delete_namespace(OPERATOR_NAMESPACE).await,
        );
        cleanup.record(
            "delete workload namespace",
            self.primary.delete_namespace(&namespace).await,
        );

        cleanup.finish()
    }
}

//! Package-manager CLI surface
//!
//! Wraps the `helm` client for the chart-driven installer: client and
//! controller initialization, chart install (dry-run and real), uninstall,
//! template rendering, remote chart fetch, and the chart's built-in tests.
//! The trait exists so the strategy can be exercised against a mock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::shell;
use crate::Result;

/// Service account the cluster-resident controller runs under.
const CONTROLLER_SERVICE_ACCOUNT: &str = "mesh-controller";

/// Operations the chart-driven installer needs from the package manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Initialize the CLI's client-side state.
    async fn client_init(&self) -> Result<()>;

    /// Deploy the cluster-resident controller that executes installs.
    async fn controller_init(&self) -> Result<()>;

    /// Whether the controller is up and answering.
    async fn controller_running(&self) -> Result<bool>;

    /// Render and validate a chart without installing anything.
    async fn install_dry_run<'a>(
        &self,
        chart: &str,
        release: &str,
        namespace: &str,
        value_file: Option<&'a str>,
        set_values: &[String],
    ) -> Result<()>;

    /// Install a chart (local directory or repo reference).
    async fn install<'a>(
        &self,
        chart: &str,
        release: &str,
        namespace: &str,
        value_file: Option<&'a str>,
        set_values: &[String],
    ) -> Result<()>;

    /// Uninstall a release.
    async fn uninstall(&self, release: &str) -> Result<()>;

    /// Render a chart into a manifest file.
    async fn template(
        &self,
        chart: &Path,
        release: &str,
        namespace: &str,
        set_values: &[String],
        output: &Path,
    ) -> Result<()>;

    /// Fetch a remote chart into a directory.
    async fn fetch(&self, repo: &str, dest: &Path) -> Result<()>;

    /// Run the release's built-in tests.
    async fn test(&self, release: &str) -> Result<()>;
}

/// Live `helm` CLI driver.
pub struct HelmCli {
    kubeconfig: Option<PathBuf>,
}

impl HelmCli {
    /// Driver using a kubeconfig file, or the ambient configuration.
    pub fn new(kubeconfig: Option<&Path>) -> Self {
        Self {
            kubeconfig: kubeconfig.map(Path::to_path_buf),
        }
    }

    async fn helm(&self, args: Vec<String>) -> Result<String> {
        let mut full = args;
        if let Some(kc) = &self.kubeconfig {
            full.push(format!("--kubeconfig={}", kc.display()));
        }
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        shell::run("helm", &refs).await
    }
}

/// Argument list for `helm install`, shared by the real and dry-run paths.
fn install_args(
    chart: &str,
    release: &str,
    namespace: &str,
    value_file: Option<&str>,
    set_values: &[String],
    dry_run: bool,
) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        chart.to_string(),
        "--name".to_string(),
        release.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ];
    if dry_run {
        args.push("--dry-run".to_string());
    }
    if let Some(file) = value_file {
        args.push("--values".to_string());
        args.push(file.to_string());
    }
    for value in set_values {
        args.push("--set".to_string());
        args.push(value.clone());
    }
    args
}

#[async_trait]
impl PackageManager for HelmCli {
    async fn client_init(&self) -> Result<()> {
        self.helm(vec!["init".to_string(), "--client-only".to_string()])
            .await?;
        Ok(())
    }

    async fn controller_init(&self) -> Result<()> {
        info!("deploying package-manager controller");
        self.helm(vec![
            "init".to_string(),
            "--upgrade".to_string(),
            "--service-account".to_string(),
            CONTROLLER_SERVICE_ACCOUNT.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn controller_running(&self) -> Result<bool> {
        // The server round-trip only answers once the controller is serving.
        let mut args = vec![
            "version".to_string(),
            "--server".to_string(),
            "--short".to_string(),
        ];
        if let Some(kc) = &self.kubeconfig {
            args.push(format!("--kubeconfig={}", kc.display()));
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(shell::run_silent("helm", &refs).await.is_ok())
    }

    async fn install_dry_run<'a>(
        &self,
        chart: &str,
        release: &str,
        namespace: &str,
        value_file: Option<&'a str>,
        set_values: &[String],
    ) -> Result<()> {
        self.helm(install_args(chart, release, namespace, value_file, set_values, true))
            .await?;
        Ok(())
    }

    async fn install<'a>(
        &self,
        chart: &str,
        release: &str,
        namespace: &str,
        value_file: Option<&'a str>,
        set_values: &[String],
    ) -> Result<()> {
        self.helm(install_args(chart, release, namespace, value_file, set_values, false))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, release: &str) -> Result<()> {
        self.helm(vec![
            "delete".to_string(),
            "--purge".to_string(),
            release.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn template(
        &self,
        chart: &Path,
        release: &str,
        namespace: &str,
        set_values: &[String],
        output: &Path,
    ) -> Result<()> {
        let mut args = vec![
            "template".to_string(),
            chart.display().to_string(),
            "--name".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        for value in set_values {
            args.push("--set".to_string());
            args.push(value.clone());
        }
        let rendered = self.helm(args).await?;
        std::fs::write(output, rendered)?;
        Ok(())
    }

    async fn fetch(&self, repo: &str, dest: &Path) -> Result<()> {
        self.helm(vec![
            "fetch".to_string(),
            repo.to_string(),
            "--untar".to_string(),
            "--untardir".to_string(),
            dest.display().to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn test(&self, release: &str) -> Result<()> {
        self.helm(vec!["test".to_string(), release.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_args_shape() {
        let args = install_args(
            "install/kubernetes/helm/mesh",
            "mesh",
            "e2e-1",
            Some("values-e2e.yaml"),
            &["global.mtls.enabled=true".to_string(), "global.tag=dev".to_string()],
            false,
        );
        assert_eq!(args[0], "install");
        assert_eq!(args[1], "install/kubernetes/helm/mesh");
        assert!(args.windows(2).any(|w| w == ["--name", "mesh"]));
        assert!(args.windows(2).any(|w| w == ["--namespace", "e2e-1"]));
        assert!(args.windows(2).any(|w| w == ["--values", "values-e2e.yaml"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--set", "global.mtls.enabled=true"]));
        assert!(!args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn test_dry_run_flag_present() {
        let args = install_args("chart", "mesh", "ns", None, &[], true);
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(!args.contains(&"--values".to_string()));
    }
}

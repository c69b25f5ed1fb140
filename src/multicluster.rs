//! Multi-cluster coordination
//!
//! Joins a second ("remote") cluster to the primary control plane. The
//! remote's credentials come from a file inside the configured registry
//! directory rather than in-cluster identity. Joining creates the companion
//! namespace, provisions shared trust-anchor material on the remote, applies
//! the remote-join manifest in one of two mutually exclusive sub-modes
//! (plain, or split-horizon), and registers a discovery secret on the
//! primary referencing the remote. Mode conflicts are rejected at plan
//! resolution, not here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::config::TestConfig;
use crate::template::{self, ImageOverride, TemplateParams};
use crate::{Error, Result};
use crate::{
    CACERTS_SECRET, CA_CERT_FILE, CA_KEY_FILE, CERT_CHAIN_FILE, INSTALL_DIR, REMOTE_INSTALL_FILE,
    REMOTE_SPLIT_HORIZON_INSTALL_FILE, ROOT_CERT_FILE,
};

/// Locate the remote cluster's kubeconfig inside the registry directory.
///
/// A file named `kubeconfig` wins; otherwise the first regular file in
/// lexical order is taken.
pub fn find_remote_kubeconfig(dir: &Path) -> Result<PathBuf> {
    let preferred = dir.join("kubeconfig");
    if preferred.is_file() {
        return Ok(preferred);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::cluster(format!("cannot read registry dir {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    files.into_iter().next().ok_or_else(|| {
        Error::cluster(format!(
            "no kubeconfig found in registry dir {}",
            dir.display()
        ))
    })
}

/// Provision the shared trust-anchor secret on a cluster from the release
/// cert material. An existing secret is a resource conflict.
pub async fn create_trust_anchors(
    cluster: &dyn ClusterApi,
    namespace: &str,
    release_dir: &Path,
) -> Result<()> {
    let files = [CA_CERT_FILE, CA_KEY_FILE, ROOT_CERT_FILE, CERT_CHAIN_FILE];

    let mut entries = BTreeMap::new();
    for file in files {
        let path = release_dir.join(file);
        let contents = std::fs::read(&path).map_err(|e| {
            Error::cluster(format!("cannot read cert file {}: {}", path.display(), e))
        })?;
        let key = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        entries.insert(key, contents);
    }

    cluster
        .create_opaque_secret(namespace, CACERTS_SECRET, &entries)
        .await
}

/// Drives the remote cluster's participation in the run.
pub struct RemoteCoordinator {
    remote: Arc<dyn ClusterApi>,
    kubeconfig: PathBuf,
}

impl RemoteCoordinator {
    /// Coordinator for a remote cluster reachable through `kubeconfig`.
    pub fn new(remote: Arc<dyn ClusterApi>, kubeconfig: PathBuf) -> Self {
        Self { remote, kubeconfig }
    }

    /// The remote's handle.
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.remote
    }

    /// Registry name the remote is known by: the kubeconfig's file name.
    pub fn registry_name(&self) -> String {
        self.kubeconfig
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Join the remote cluster to the primary control plane.
    pub async fn join(&self, config: &TestConfig, primary: &dyn ClusterApi) -> Result<()> {
        let namespace = config.namespace();

        self.remote.create_namespace(&namespace).await?;

        if let Err(e) =
            create_trust_anchors(self.remote.as_ref(), &namespace, &config.release_dir).await
        {
            // Shared trust anchors may survive a previous run.
            warn!(namespace = %namespace, error = %e, "trust-anchor provisioning on remote skipped");
        }

        let source = if config.split_horizon {
            REMOTE_SPLIT_HORIZON_INSTALL_FILE
        } else {
            REMOTE_INSTALL_FILE
        };
        let src = config.release_dir.join(INSTALL_DIR).join(source);
        let dst = config.yaml_dir().join(REMOTE_INSTALL_FILE);
        template::materialize_file(&src, &dst, &self.remote_params(config))?;

        self.remote.apply_manifest(&namespace, &dst).await?;

        primary
            .create_discovery_secret(&namespace, &self.registry_name(), &self.kubeconfig)
            .await?;

        info!(registry = %self.registry_name(), "remote cluster joined");
        Ok(())
    }

    /// Whether the remote's rollouts should be awaited after the join.
    ///
    /// In split-horizon mode the remote's workloads cannot reach the primary
    /// until the primary starts watching the remote registry, so the wait is
    /// deliberately skipped.
    pub fn await_rollouts(&self, config: &TestConfig) -> bool {
        !config.split_horizon
    }

    /// Delete the remote's companion namespace.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.remote.delete_namespace(namespace).await
    }

    /// Substitution parameters for the remote-join manifest: the run
    /// namespace plus the proxy image; split-horizon also substitutes the
    /// registry name.
    fn remote_params(&self, config: &TestConfig) -> TemplateParams {
        let mut images = Vec::new();
        if config.images.proxy.is_set() {
            images.push(ImageOverride::new(
                "proxy",
                &config.images.proxy.hub,
                &config.images.proxy.tag,
            ));
        }
        TemplateParams {
            namespace: config.namespace(),
            cluster_wide: false,
            images,
            pull_policy: None,
            local_cluster: false,
            split_horizon_registry: config
                .split_horizon
                .then(|| self.registry_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::config::ImageRef;

    fn write_cert_material(release_dir: &Path) {
        for file in [CA_CERT_FILE, CA_KEY_FILE, ROOT_CERT_FILE, CERT_CHAIN_FILE] {
            let path = release_dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("material for {file}")).unwrap();
        }
    }

    fn config_with_dirs(release_dir: &Path, work_dir: &Path) -> TestConfig {
        let mut config = TestConfig::new("e2e-7");
        config.release_dir = release_dir.to_path_buf();
        config.work_dir = work_dir.to_path_buf();
        config.multi_cluster_dir = Some(release_dir.join("registry"));
        config
    }

    #[test]
    fn test_find_remote_kubeconfig_prefers_named_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa"), "first").unwrap();
        std::fs::write(dir.path().join("kubeconfig"), "preferred").unwrap();

        let found = find_remote_kubeconfig(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "kubeconfig");
    }

    #[test]
    fn test_find_remote_kubeconfig_falls_back_to_first_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zz-cluster"), "z").unwrap();
        std::fs::write(dir.path().join("aa-cluster"), "a").unwrap();

        let found = find_remote_kubeconfig(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "aa-cluster");
    }

    #[test]
    fn test_find_remote_kubeconfig_empty_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_remote_kubeconfig(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_trust_anchors_carry_all_four_files() {
        let dir = tempfile::tempdir().unwrap();
        write_cert_material(dir.path());

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_opaque_secret()
            .withf(|namespace, name, entries| {
                namespace == "e2e-7"
                    && name == CACERTS_SECRET
                    && entries.len() == 4
                    && entries.contains_key("root-cert.pem")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        create_trust_anchors(&cluster, "e2e-7", dir.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_applies_manifest_and_registers_discovery_secret() {
        let release = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_cert_material(release.path());
        std::fs::create_dir_all(release.path().join(INSTALL_DIR)).unwrap();
        std::fs::write(
            release.path().join(INSTALL_DIR).join(REMOTE_INSTALL_FILE),
            "namespace: mesh-system\n",
        )
        .unwrap();
        std::fs::create_dir_all(work.path().join("yaml")).unwrap();
        let kubeconfig = work.path().join("remote-cluster");
        std::fs::write(&kubeconfig, "apiVersion: v1").unwrap();

        let config = config_with_dirs(release.path(), work.path());

        let mut remote = MockClusterApi::new();
        remote
            .expect_create_namespace()
            .withf(|name| name == "e2e-7")
            .times(1)
            .returning(|_| Ok(()));
        remote
            .expect_create_opaque_secret()
            .times(1)
            .returning(|_, _, _| Ok(()));
        remote
            .expect_apply_manifest()
            .withf(|namespace, manifest| {
                namespace == "e2e-7"
                    && manifest.file_name().unwrap() == REMOTE_INSTALL_FILE
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut primary = MockClusterApi::new();
        primary
            .expect_create_discovery_secret()
            .withf(|namespace, name, _| namespace == "e2e-7" && name == "remote-cluster")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let coordinator = RemoteCoordinator::new(Arc::new(remote), kubeconfig);
        coordinator.join(&config, &primary).await.unwrap();

        // The materialized manifest carries the run namespace.
        let materialized =
            std::fs::read_to_string(work.path().join("yaml").join(REMOTE_INSTALL_FILE)).unwrap();
        assert!(materialized.contains("namespace: e2e-7"));
    }

    #[tokio::test]
    async fn test_join_survives_existing_trust_anchors() {
        let release = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_cert_material(release.path());
        std::fs::create_dir_all(release.path().join(INSTALL_DIR)).unwrap();
        std::fs::write(
            release.path().join(INSTALL_DIR).join(REMOTE_INSTALL_FILE),
            "namespace: mesh-system\n",
        )
        .unwrap();
        std::fs::create_dir_all(work.path().join("yaml")).unwrap();
        let kubeconfig = work.path().join("remote-cluster");
        std::fs::write(&kubeconfig, "apiVersion: v1").unwrap();

        let config = config_with_dirs(release.path(), work.path());

        let mut remote = MockClusterApi::new();
        remote.expect_create_namespace().returning(|_| Ok(()));
        remote
            .expect_create_opaque_secret()
            .returning(|_, _, _| Err(Error::conflict("cacerts already exists")));
        remote.expect_apply_manifest().returning(|_, _| Ok(()));

        let mut primary = MockClusterApi::new();
        primary
            .expect_create_discovery_secret()
            .returning(|_, _, _| Ok(()));

        let coordinator = RemoteCoordinator::new(Arc::new(remote), kubeconfig);
        assert!(coordinator.join(&config, &primary).await.is_ok());
    }

    #[test]
    fn test_split_horizon_params_carry_registry() {
        let release = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut config = config_with_dirs(release.path(), work.path());
        config.split_horizon = true;
        config.auth = true;
        config.images.proxy = ImageRef::new("hub", "dev");

        let coordinator = RemoteCoordinator::new(
            Arc::new(MockClusterApi::new()),
            PathBuf::from("/registry/remote-east"),
        );
        let params = coordinator.remote_params(&config);
        assert_eq!(params.split_horizon_registry.as_deref(), Some("remote-east"));
        assert_eq!(params.images.len(), 1);
        assert_eq!(params.images[0].module, "proxy");
        assert!(!coordinator.await_rollouts(&config));

        config.split_horizon = false;
        assert!(coordinator.await_rollouts(&config));
    }
}

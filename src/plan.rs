//! Install plan resolution
//!
//! The plan is a pure function of the configuration snapshot: it never
//! consults live cluster state, so setup and teardown can each derive it
//! independently and land on the identical plan. Impossible option
//! combinations surface here as configuration conflicts instead of failing
//! halfway through an install.

use crate::config::{ImageRef, InstallerKind, TestConfig};
use crate::template::{ImageOverride, TemplateParams};
use crate::{Error, Result};
use crate::{
    AUTH_INSTALL_FILE, AUTH_NO_MCP_INSTALL_FILE, AUTH_SDS_INSTALL_FILE, HELM_CHART_NAME,
    MULTICLUSTER_AUTH_INSTALL_FILE, MULTICLUSTER_INSTALL_FILE, NON_AUTH_INSTALL_FILE,
    NON_AUTH_NO_MCP_INSTALL_FILE, ONE_NAMESPACE_AUTH_INSTALL_FILE, ONE_NAMESPACE_INSTALL_FILE,
    OPERATOR_INSTALL_FILE, SPLIT_HORIZON_INSTALL_FILE, TRUST_DOMAIN_INSTALL_FILE,
};

/// Which strategy performs the install and uninstall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// Materialize manifests and apply them directly.
    Manifest,
    /// Drive the package-manager CLI and charts.
    Helm,
    /// Apply the operator custom resource and let the operator deploy.
    Operator,
}

/// The resolved install plan for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallPlan {
    /// Strategy selected for the environment's lifetime.
    pub strategy: StrategyKind,
    /// Main manifest identifier (chart name for the package manager).
    pub manifest: String,
    /// Substitution parameters for manifest materialization.
    pub params: TemplateParams,
}

/// Resolve the install plan from a configuration snapshot.
///
/// Fails with [`Error::ConfigurationConflict`] on impossible combinations;
/// everything else is deterministic selection.
pub fn resolve(config: &TestConfig) -> Result<InstallPlan> {
    check_conflicts(config)?;

    let strategy = match (config.installer, config.use_operator) {
        (InstallerKind::Helm, _) => StrategyKind::Helm,
        (InstallerKind::Manifest, true) => StrategyKind::Operator,
        (InstallerKind::Manifest, false) => StrategyKind::Manifest,
    };

    let manifest = match strategy {
        StrategyKind::Helm => HELM_CHART_NAME.to_string(),
        StrategyKind::Operator => OPERATOR_INSTALL_FILE.to_string(),
        StrategyKind::Manifest => select_manifest(config).to_string(),
    };

    Ok(InstallPlan {
        strategy,
        manifest,
        params: template_params(config),
    })
}

fn check_conflicts(config: &TestConfig) -> Result<()> {
    if config.split_horizon {
        if !config.auth {
            return Err(Error::config_conflict(
                "split-horizon discovery requires auth to be enabled",
            ));
        }
        if config.auto_inject {
            return Err(Error::config_conflict(
                "split-horizon discovery is incompatible with automatic sidecar injection",
            ));
        }
    }

    if config.use_operator && config.installer == InstallerKind::Helm {
        return Err(Error::config_conflict(
            "operator deployment is driven by manifests, not the package manager",
        ));
    }

    // The validation webhook watches the whole cluster; a single-namespace
    // install cannot register it.
    if config.config_validation
        && !config.cluster_wide
        && !config.multi_cluster()
        && config.installer != InstallerKind::Helm
    {
        return Err(Error::config_conflict(
            "config validation requires a cluster-wide install",
        ));
    }

    Ok(())
}

/// Decision table for the main manifest. The trust-domain toggle overrides
/// every other selection.
fn select_manifest(config: &TestConfig) -> &'static str {
    let file = if config.multi_cluster() {
        if config.split_horizon {
            SPLIT_HORIZON_INSTALL_FILE
        } else if config.auth {
            MULTICLUSTER_AUTH_INSTALL_FILE
        } else {
            MULTICLUSTER_INSTALL_FILE
        }
    } else if config.cluster_wide {
        cluster_wide_manifest(config)
    } else if config.auth {
        ONE_NAMESPACE_AUTH_INSTALL_FILE
    } else {
        ONE_NAMESPACE_INSTALL_FILE
    };

    if config.trust_domain {
        return TRUST_DOMAIN_INSTALL_FILE;
    }
    file
}

fn cluster_wide_manifest(config: &TestConfig) -> &'static str {
    if config.auth {
        if !config.use_mcp {
            AUTH_NO_MCP_INSTALL_FILE
        } else if config.auth_sds {
            AUTH_SDS_INSTALL_FILE
        } else {
            AUTH_INSTALL_FILE
        }
    } else if config.use_mcp {
        NON_AUTH_INSTALL_FILE
    } else {
        NON_AUTH_NO_MCP_INSTALL_FILE
    }
}

fn template_params(config: &TestConfig) -> TemplateParams {
    let modules: [(&str, &ImageRef); 6] = [
        ("discovery", &config.images.discovery),
        ("policy", &config.images.policy),
        ("proxy", &config.images.proxy),
        ("ca", &config.images.ca),
        ("validator", &config.images.validator),
        ("injector", &config.images.injector),
    ];

    let images = modules
        .iter()
        .filter(|(_, image)| image.is_set())
        .map(|(module, image)| ImageOverride::new(*module, &image.hub, &image.tag))
        .collect();

    TemplateParams {
        namespace: config.namespace(),
        cluster_wide: config.cluster_wide,
        images,
        pull_policy: config.image_pull_policy.clone(),
        local_cluster: config.local_cluster,
        // Filled in by the multi-cluster coordinator once the remote
        // kubeconfig is known; plan resolution stays cluster-blind.
        split_horizon_registry: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_single_namespace_non_auth_manifest() {
        let config = TestConfig::new("e2e-1");
        let plan = resolve(&config).unwrap();
        assert_eq!(plan.strategy, StrategyKind::Manifest);
        assert_eq!(plan.manifest, ONE_NAMESPACE_INSTALL_FILE);
    }

    #[test]
    fn test_trust_domain_overrides_other_selections() {
        for (use_mcp, auth_sds) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut config = TestConfig::new("e2e-1");
            config.auth = true;
            config.trust_domain = true;
            config.use_mcp = use_mcp;
            config.auth_sds = auth_sds;
            let plan = resolve(&config).unwrap();
            assert_eq!(plan.manifest, TRUST_DOMAIN_INSTALL_FILE);
        }
    }

    #[test]
    fn test_split_horizon_without_auth_is_a_conflict() {
        let mut config = TestConfig::new("e2e-1");
        config.multi_cluster_dir = Some(PathBuf::from("/registry"));
        config.split_horizon = true;
        config.auth = false;
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
    }

    #[test]
    fn test_split_horizon_rejects_automatic_injection() {
        let mut config = TestConfig::new("e2e-1");
        config.multi_cluster_dir = Some(PathBuf::from("/registry"));
        config.split_horizon = true;
        config.auth = true;
        config.auto_inject = true;
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
    }

    #[test]
    fn test_cluster_wide_decision_table() {
        let cases = [
            (true, true, false, AUTH_INSTALL_FILE),
            (true, true, true, AUTH_SDS_INSTALL_FILE),
            (true, false, false, AUTH_NO_MCP_INSTALL_FILE),
            (false, true, false, NON_AUTH_INSTALL_FILE),
            (false, false, false, NON_AUTH_NO_MCP_INSTALL_FILE),
        ];
        for (auth, use_mcp, auth_sds, expected) in cases {
            let mut config = TestConfig::new("e2e-1");
            config.cluster_wide = true;
            config.auth = auth;
            config.use_mcp = use_mcp;
            config.auth_sds = auth_sds;
            let plan = resolve(&config).unwrap();
            assert_eq!(plan.manifest, expected, "auth={auth} mcp={use_mcp} sds={auth_sds}");
        }
    }

    #[test]
    fn test_multicluster_manifests() {
        let mut config = TestConfig::new("e2e-1");
        config.multi_cluster_dir = Some(PathBuf::from("/registry"));
        assert_eq!(
            resolve(&config).unwrap().manifest,
            MULTICLUSTER_INSTALL_FILE
        );

        config.auth = true;
        assert_eq!(
            resolve(&config).unwrap().manifest,
            MULTICLUSTER_AUTH_INSTALL_FILE
        );

        config.split_horizon = true;
        assert_eq!(
            resolve(&config).unwrap().manifest,
            SPLIT_HORIZON_INSTALL_FILE
        );
    }

    #[test]
    fn test_operator_toggle_selects_operator_strategy() {
        let mut config = TestConfig::new("e2e-1");
        config.use_operator = true;
        let plan = resolve(&config).unwrap();
        assert_eq!(plan.strategy, StrategyKind::Operator);
        assert_eq!(plan.manifest, OPERATOR_INSTALL_FILE);
    }

    #[test]
    fn test_helm_installer_selects_helm_strategy() {
        let mut config = TestConfig::new("e2e-1");
        config.installer = InstallerKind::Helm;
        let plan = resolve(&config).unwrap();
        assert_eq!(plan.strategy, StrategyKind::Helm);
        assert_eq!(plan.manifest, HELM_CHART_NAME);
    }

    #[test]
    fn test_one_namespace_validation_is_a_conflict() {
        let mut config = TestConfig::new("e2e-1");
        config.config_validation = true;
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));

        // The package manager delivers the webhook with the chart, so the
        // same combination is allowed there.
        config.installer = InstallerKind::Helm;
        assert!(resolve(&config).is_ok());
    }

    #[test]
    fn test_resolution_is_pure() {
        let mut config = TestConfig::new("e2e-1");
        config.auth = true;
        config.cluster_wide = true;
        config.image_pull_policy = Some("IfNotPresent".to_string());
        config.images.discovery = crate::config::ImageRef::new("hub", "tag");

        let first = resolve(&config).unwrap();
        let second = resolve(&config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_image_overrides_require_hub_and_tag() {
        let mut config = TestConfig::new("e2e-1");
        config.images.discovery = crate::config::ImageRef::new("hub", "tag");
        config.images.proxy = crate::config::ImageRef::new("hub-only", "");
        let plan = resolve(&config).unwrap();
        assert_eq!(plan.params.images.len(), 1);
        assert_eq!(plan.params.images[0].module, "discovery");
    }
}

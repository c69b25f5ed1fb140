//! Immutable configuration snapshot for a test run
//!
//! All options are resolved once (by the CLI layer, outside this crate) into
//! one [`TestConfig`] value that is passed explicitly into every component.
//! Nothing in here changes after construction; both setup and teardown derive
//! the same install plan from the same snapshot.

use std::path::PathBuf;

use crate::MESH_NAMESPACE;

/// Which installer drives the control-plane install.
///
/// The operator toggle is separate (see [`TestConfig::use_operator`]): it
/// redirects the manifest installer to the operator strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstallerKind {
    /// Apply generated manifests directly.
    #[default]
    Manifest,
    /// Drive the package-manager CLI and charts.
    Helm,
}

/// Image hub/tag pair for one component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageRef {
    /// Docker hub prefix, empty when the stock image should be kept.
    pub hub: String,
    /// Image tag, empty when the stock image should be kept.
    pub tag: String,
}

impl ImageRef {
    /// Convenience constructor.
    pub fn new(hub: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            tag: tag.into(),
        }
    }

    /// Whether both hub and tag are configured.
    pub fn is_set(&self) -> bool {
        !self.hub.is_empty() && !self.tag.is_empty()
    }
}

/// Per-component image overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentImages {
    /// Config-distribution component
    pub discovery: ImageRef,
    /// Policy component
    pub policy: ImageRef,
    /// Data-plane proxy
    pub proxy: ImageRef,
    /// Certificate authority
    pub ca: ImageRef,
    /// Config-validation component
    pub validator: ImageRef,
    /// Automatic sidecar injector
    pub injector: ImageRef,
    /// Test application image
    pub app: ImageRef,
    /// CNI component
    pub cni: ImageRef,
}

/// The immutable configuration snapshot for one test run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestConfig {
    /// Unique id for this run, used as the default namespace name.
    pub run_id: String,
    /// Explicit namespace override; empty means derive from the run.
    pub namespace_override: Option<String>,

    /// Enable service-to-service auth.
    pub auth: bool,
    /// Distribute workload keys/certs through SDS instead of mounted files.
    pub auth_sds: bool,
    /// Enable RBAC enforcement.
    pub rbac: bool,
    /// Use a dedicated trust domain for workload identities.
    pub trust_domain: bool,
    /// Register and exercise the config-validation webhook.
    pub config_validation: bool,
    /// Configure components over MCP.
    pub use_mcp: bool,
    /// Deploy through the operator instead of applying manifests directly.
    pub use_operator: bool,
    /// Which installer drives the install.
    pub installer: InstallerKind,

    /// Components watch all namespaces rather than just the test namespace.
    pub cluster_wide: bool,
    /// Single-node local cluster; load-balancer services are downgraded.
    pub local_cluster: bool,
    /// Skip installation entirely (environment is expected to exist).
    pub skip_setup: bool,
    /// Leave the installation in place on teardown.
    pub skip_cleanup: bool,

    /// Deploy the automatic sidecar injector.
    pub auto_inject: bool,
    /// Injector manifest file name.
    pub sidecar_injector_file: String,
    /// Override for every image pull policy in the manifests.
    pub image_pull_policy: Option<String>,
    /// Outbound traffic policy mode.
    pub outbound_traffic_policy: String,
    /// Enable the egress gateway.
    pub egress_gateway: bool,

    /// Deploy the CNI component instead of init-container traffic capture.
    pub use_cni: bool,
    /// Chart repo the CNI component is fetched from.
    pub cni_helm_repo: String,

    /// Cluster-registry directory; set when a second cluster participates.
    pub multi_cluster_dir: Option<PathBuf>,
    /// Split-horizon discovery topology for the second cluster.
    pub split_horizon: bool,

    /// Value file handed to the package manager verbatim.
    pub value_file: Option<String>,
    /// Raw `key=value` overrides handed to the package manager verbatim.
    pub helm_overrides: Vec<String>,

    /// Image overrides per component.
    pub images: ComponentImages,

    /// Release directory holding install manifests and cert material.
    pub release_dir: PathBuf,
    /// Working directory for this run; materialized manifests land here.
    pub work_dir: PathBuf,
}

impl TestConfig {
    /// A snapshot with the standard defaults for the given run id.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            namespace_override: None,
            auth: false,
            auth_sds: false,
            rbac: true,
            trust_domain: false,
            config_validation: false,
            use_mcp: true,
            use_operator: false,
            installer: InstallerKind::Manifest,
            cluster_wide: false,
            local_cluster: false,
            skip_setup: false,
            skip_cleanup: false,
            auto_inject: false,
            sidecar_injector_file: crate::DEFAULT_INJECTOR_FILE.to_string(),
            image_pull_policy: None,
            outbound_traffic_policy: "ALLOW_ANY".to_string(),
            egress_gateway: false,
            use_cni: false,
            cni_helm_repo: "mesh-release/mesh-cni".to_string(),
            multi_cluster_dir: None,
            split_horizon: false,
            value_file: None,
            helm_overrides: Vec::new(),
            images: ComponentImages::default(),
            release_dir: PathBuf::new(),
            work_dir: PathBuf::new(),
        }
    }

    /// Namespace the control plane is installed into for this run.
    pub fn namespace(&self) -> String {
        if let Some(ns) = &self.namespace_override {
            return ns.clone();
        }
        if self.cluster_wide {
            MESH_NAMESPACE.to_string()
        } else {
            self.run_id.clone()
        }
    }

    /// Namespace holding the system components (ingress secret, gateways).
    pub fn system_namespace(&self) -> String {
        if self.cluster_wide {
            MESH_NAMESPACE.to_string()
        } else {
            self.namespace()
        }
    }

    /// Whether a second cluster participates in this run.
    pub fn multi_cluster(&self) -> bool {
        self.multi_cluster_dir.is_some()
    }

    /// Directory materialized manifests are written to.
    pub fn yaml_dir(&self) -> PathBuf {
        self.work_dir.join("yaml")
    }
}

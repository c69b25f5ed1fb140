//! meshtest - end-to-end environment lifecycle for the mesh control plane
//!
//! This crate provisions and tears down a multi-component service-mesh
//! control plane on one or two Kubernetes clusters so integration tests can
//! run against a real installation. The caller resolves configuration once
//! into an immutable [`config::TestConfig`], hands the environment
//! already-built cluster handles, and drives the lifecycle through
//! [`env::Environment`].
//!
//! # Modules
//!
//! - [`config`] - immutable configuration snapshot for a run
//! - [`plan`] - pure resolution of the install plan from the snapshot
//! - [`env`] - environment manager facade (setup, teardown, queries)
//! - [`install`] - installer strategies (manifest, package manager, operator)
//! - [`multicluster`] - remote-cluster join coordination
//! - [`template`] - line-oriented manifest templating
//! - [`poll`] - bounded readiness polling
//! - [`cluster`] - cluster API surface and its kube/kubectl implementation
//! - [`helm`] - package-manager CLI surface
//! - [`pods`] - per-cluster app pod cache
//! - [`cleanup`] - ordered, error-aggregating teardown sequencing
//! - [`shell`] - command execution with timeouts
//! - [`error`] - error taxonomy

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod env;
pub mod error;
pub mod helm;
pub mod install;
pub mod multicluster;
pub mod plan;
pub mod pods;
pub mod poll;
pub mod shell;
pub mod template;

pub use error::Error;

/// Result type alias using the crate's error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Control-plane naming
// =============================================================================

/// Namespace the control plane ships in for cluster-wide installs
pub const MESH_NAMESPACE: &str = "mesh-system";

/// Namespace the operator itself runs in
pub const OPERATOR_NAMESPACE: &str = "mesh-operator";

/// Name of the ingress service
pub const INGRESS_SERVICE: &str = "mesh-ingress";

/// Pod label value carried by ingress pods
pub const INGRESS_LABEL: &str = "ingress";

/// Name of the ingress gateway service
pub const INGRESS_GATEWAY_SERVICE: &str = "mesh-ingressgateway";

/// Pod label value carried by ingress gateway pods
pub const INGRESS_GATEWAY_LABEL: &str = "ingressgateway";

/// Name of the egress gateway service
pub const EGRESS_GATEWAY_SERVICE: &str = "mesh-egressgateway";

/// Name of the ingress TLS secret provisioned during setup
pub const INGRESS_CERTS_SECRET: &str = "mesh-ingress-certs";

/// Name of the config-validation webhook configuration
pub const VALIDATOR_WEBHOOK: &str = "mesh-validator";

/// Name of the shared trust-anchor secret provisioned on every cluster
pub const CACERTS_SECRET: &str = "cacerts";

// =============================================================================
// Install manifests (relative to the release directory)
// =============================================================================

/// Directory holding the generated install manifests
pub const INSTALL_DIR: &str = "install/kubernetes";

/// Init manifest applied before the main manifest
pub const INIT_INSTALL_FILE: &str = "mesh-init.yaml";

/// Cluster-wide, no auth, MCP config distribution
pub const NON_AUTH_INSTALL_FILE: &str = "mesh.yaml";

/// Cluster-wide with auth
pub const AUTH_INSTALL_FILE: &str = "mesh-auth.yaml";

/// Cluster-wide with auth, keys distributed through SDS
pub const AUTH_SDS_INSTALL_FILE: &str = "mesh-auth-sds.yaml";

/// Cluster-wide, no auth, MCP disabled
pub const NON_AUTH_NO_MCP_INSTALL_FILE: &str = "mesh-no-mcp.yaml";

/// Cluster-wide with auth, MCP disabled
pub const AUTH_NO_MCP_INSTALL_FILE: &str = "mesh-auth-no-mcp.yaml";

/// Single-namespace, no auth
pub const ONE_NAMESPACE_INSTALL_FILE: &str = "mesh-one-namespace.yaml";

/// Single-namespace with auth
pub const ONE_NAMESPACE_AUTH_INSTALL_FILE: &str = "mesh-one-namespace-auth.yaml";

/// Single-namespace with a dedicated trust domain
pub const TRUST_DOMAIN_INSTALL_FILE: &str = "mesh-one-namespace-trust-domain.yaml";

/// Multi-cluster primary, no auth
pub const MULTICLUSTER_INSTALL_FILE: &str = "mesh-multicluster.yaml";

/// Multi-cluster primary with auth
pub const MULTICLUSTER_AUTH_INSTALL_FILE: &str = "mesh-auth-multicluster.yaml";

/// Multi-cluster primary for split-horizon discovery
pub const SPLIT_HORIZON_INSTALL_FILE: &str = "mesh-multicluster-split-horizon.yaml";

/// Manifest joining a remote cluster to the primary control plane
pub const REMOTE_INSTALL_FILE: &str = "mesh-remote.yaml";

/// Remote-join manifest for split-horizon discovery
pub const REMOTE_SPLIT_HORIZON_INSTALL_FILE: &str = "mesh-remote-split-horizon.yaml";

/// Operator custom-resource manifest
pub const OPERATOR_INSTALL_FILE: &str = "mesh-operator.yaml";

/// Default automatic sidecar-injector manifest
pub const DEFAULT_INJECTOR_FILE: &str = "mesh-sidecar-injector.yaml";

/// CRD manifests installed individually before the chart
pub const CRD_INSTALL_FILES: [&str; 2] = ["crd-all.yaml", "crd-policy.yaml"];

// =============================================================================
// Package-manager layout
// =============================================================================

/// Chart name for the control plane
pub const HELM_CHART_NAME: &str = "mesh";

/// Chart directory relative to the release directory
pub const HELM_INSTALL_DIR: &str = "install/kubernetes/helm/mesh";

/// Service-account manifest for the package-manager controller
pub const CONTROLLER_ACCOUNT_FILE: &str = "install/kubernetes/helm/helm-service-account.yaml";

/// Chart name for the CNI component
pub const CNI_CHART_NAME: &str = "mesh-cni";

// =============================================================================
// Multi-cluster
// =============================================================================

/// Network name assigned to the remote cluster in split-horizon mode
pub const REMOTE_NETWORK_NAME: &str = "remote-network";

/// Placeholder in the split-horizon manifests, replaced with the registry name
pub const SPLIT_HORIZON_REGISTRY_PLACEHOLDER: &str = "REMOTE_CLUSTER_REGISTRY";

// =============================================================================
// Trust-anchor material (relative to the release directory)
// =============================================================================

/// Intermediate CA certificate
pub const CA_CERT_FILE: &str = "samples/certs/ca-cert.pem";

/// Intermediate CA private key
pub const CA_KEY_FILE: &str = "samples/certs/ca-key.pem";

/// Root certificate
pub const ROOT_CERT_FILE: &str = "samples/certs/root-cert.pem";

/// Certificate chain
pub const CERT_CHAIN_FILE: &str = "samples/certs/cert-chain.pem";

/// Ingress TLS certificate provisioned during setup
pub const INGRESS_CERT_FILE: &str = "tests/testdata/certs/cert.crt";

/// Ingress TLS private key provisioned during setup
pub const INGRESS_KEY_FILE: &str = "tests/testdata/certs/cert.key";

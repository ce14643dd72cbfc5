//! Domain-qualified constants: CRD coordinates, label keys, environment variable names, and
//! the tuning surface named in the system's external interface.
use std::env;
use std::time::Duration;

/// Helper macro to avoid retyping the base domain-like name of our system when creating
/// further string constants from it. When given no parameters, this returns the base
/// domain-like name of the system. When given a string literal parameter it adds `/parameter`
/// to the end.
#[macro_export]
macro_rules! node_refresh_domain {
    () => {
        "stable.example.com"
    };
    ($s:literal) => {
        concat!(node_refresh_domain!(), "/", $s)
    };
}

pub const API_GROUP: &str = node_refresh_domain!();
pub const API_VERSION: &str = "v1alpha1";
pub const CRD_PLURAL: &str = "noderefreshes";

// Label keys
pub const LABEL_COMPONENT: &str = node_refresh_domain!("component");
pub const NODE_REFRESH_OPERATOR_COMPONENT: &str = "node-refresh-operator";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";
pub const APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

// Environment variables
const OPERATOR_NAMESPACE_ENV_VAR: &str = "OPERATOR_NAMESPACE";
const WORKER_POOL_SIZE_ENV_VAR: &str = "WORKER_POOL_SIZE";
const DEFAULT_OPERATOR_NAMESPACE: &str = "default";

/// The namespace the operator's own pod runs in, used to exclude it from drains. Falls back
/// to `"default"` if unset, matching the original implementation's behavior.
pub fn operator_namespace() -> String {
    env::var(OPERATOR_NAMESPACE_ENV_VAR).unwrap_or_else(|_| DEFAULT_OPERATOR_NAMESPACE.to_string())
}

/// Number of concurrently-running per-object handler tasks. Overridable for environments
/// that need a different concurrency budget; defaults to `DEFAULT_WORKER_POOL_SIZE`.
pub fn worker_pool_size() -> usize {
    env::var(WORKER_POOL_SIZE_ENV_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WORKER_POOL_SIZE)
}

// Tuning constants (see SPEC_FULL.md section 6).
pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;
pub const REFRESH_TIMER_INTERVAL: Duration = Duration::from_secs(300);
pub const RETRY_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RETRIES: u32 = 5;

//! Controller configuration.
//!
//! Read once from the environment at startup and passed by reference to the
//! reconciler and the providers.

use crate::error::ControllerError;
use std::env;
use std::time::Duration;
use tracing::info;

const DEFAULT_VIRTV2V_IMAGE: &str = "quay.io/kubevirt/kubevirt-v2v-conversion:v2.0.0";
const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
const DEFAULT_REQUEUE_INTERVAL_SECS: u64 = 10;
const DEFAULT_RETRY_MIN_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 300;

/// Name and namespace of a ConfigMap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMapRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch (all namespaces when unset)
    pub watch_namespace: Option<String>,
    
    /// ConfigMap overriding the built-in OS mapping tables
    pub os_config_map: Option<ConfigMapRef>,
    
    /// Namespace holding KubeVirt common templates; templates are not used when unset
    pub template_namespace: Option<String>,
    
    /// Image of the virt-v2v guest conversion job
    pub virtv2v_image: String,
    
    pub image_pull_policy: String,
    
    /// Poll interval while DataVolumes copy or the conversion job runs
    pub requeue_interval: Duration,
    
    /// Fibonacci retry bounds for transient errors
    pub retry_min_secs: u64,
    pub retry_max_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            os_config_map: None,
            template_namespace: None,
            virtv2v_image: DEFAULT_VIRTV2V_IMAGE.to_string(),
            image_pull_policy: DEFAULT_IMAGE_PULL_POLICY.to_string(),
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_INTERVAL_SECS),
            retry_min_secs: DEFAULT_RETRY_MIN_SECS,
            retry_max_secs: DEFAULT_RETRY_MAX_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup (environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let seconds = |key: &str, default: u64| -> Result<u64, ControllerError> {
            match get(key) {
                Some(raw) => raw.parse().map_err(|_| {
                    ControllerError::InvalidConfig(format!("{} must be a number of seconds, got '{}'", key, raw))
                }),
                None => Ok(default),
            }
        };

        let os_config_map = match (get("OS_CONFIG_MAP_NAME"), get("OS_CONFIG_MAP_NAMESPACE")) {
            (Some(name), Some(namespace)) => Some(ConfigMapRef { name, namespace }),
            (None, None) => None,
            _ => {
                return Err(ControllerError::InvalidConfig(
                    "OS_CONFIG_MAP_NAME and OS_CONFIG_MAP_NAMESPACE must be set together".to_string(),
                ));
            }
        };

        let image_pull_policy = get("IMAGE_PULL_POLICY").unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string());
        if !matches!(image_pull_policy.as_str(), "Always" | "IfNotPresent" | "Never") {
            return Err(ControllerError::InvalidConfig(format!(
                "IMAGE_PULL_POLICY must be Always, IfNotPresent or Never, got '{}'",
                image_pull_policy
            )));
        }

        let retry_min_secs = seconds("RETRY_MIN_SECS", DEFAULT_RETRY_MIN_SECS)?;
        let retry_max_secs = seconds("RETRY_MAX_SECS", DEFAULT_RETRY_MAX_SECS)?;
        if retry_min_secs == 0 || retry_min_secs > retry_max_secs {
            return Err(ControllerError::InvalidConfig(format!(
                "retry bounds must satisfy 0 < RETRY_MIN_SECS <= RETRY_MAX_SECS, got {}..{}",
                retry_min_secs, retry_max_secs
            )));
        }

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            os_config_map,
            template_namespace: get("TEMPLATE_NAMESPACE"),
            virtv2v_image: get("VIRTV2V_IMAGE").unwrap_or_else(|| DEFAULT_VIRTV2V_IMAGE.to_string()),
            image_pull_policy,
            requeue_interval: Duration::from_secs(seconds("REQUEUE_INTERVAL_SECS", DEFAULT_REQUEUE_INTERVAL_SECS)?),
            retry_min_secs,
            retry_max_secs,
        })
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("  Namespace: {}", self.watch_namespace.as_deref().unwrap_or("all namespaces"));
        match &self.os_config_map {
            Some(cm) => info!("  OS mapping ConfigMap: {}/{}", cm.namespace, cm.name),
            None => info!("  OS mapping ConfigMap: built-in tables only"),
        }
        info!("  Template namespace: {}", self.template_namespace.as_deref().unwrap_or("templates disabled"));
        info!("  virt-v2v image: {} ({})", self.virtv2v_image, self.image_pull_policy);
        info!("  Requeue interval: {}s", self.requeue_interval.as_secs());
        info!("  Retry backoff: {}s..{}s", self.retry_min_secs, self.retry_max_secs);
    }
}

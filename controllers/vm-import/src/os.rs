//! OS resolver.
//!
//! Resolves the common OS identity (`rhel7.7`, `win2k19`, ...) of a source VM
//! used for the template lookup and the OS label of the target VM.
//!
//! Lookup order, first hit wins:
//! 1. guest-agent distribution in the guest-to-common table, suffixed with the full version
//! 2. platform OS type in the info-to-common table, used verbatim
//! 3. substring heuristics: "linux"/"rhel" resolve to [`DEFAULT_LINUX`], "win" to [`DEFAULT_WINDOWS`]
//!
//! Both tables start from built-ins. A ConfigMap can override entries per key;
//! a broken override never removes the built-ins.

use crate::config::ConfigMapRef;
use crate::error::ControllerError;
use crate::store::ResourceStore;
use hypervisor_client::GuestOs;
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// ConfigMap key holding guest distribution overrides (YAML map)
pub const GUEST_OS_TO_COMMON_KEY: &str = "guestos2common";
/// ConfigMap key holding OS type overrides (YAML map)
pub const OS_INFO_TO_COMMON_KEY: &str = "osinfo2common";

pub const DEFAULT_LINUX: &str = "rhel8.1";
pub const DEFAULT_WINDOWS: &str = "win10";

const BUILTIN_GUEST_OS_TO_COMMON: &[(&str, &str)] = &[
    ("Red Hat Enterprise Linux Server", "rhel"),
    ("Red Hat Enterprise Linux", "rhel"),
    ("CentOS Linux", "centos"),
    ("Fedora", "fedora"),
    ("Ubuntu", "ubuntu"),
    ("openSUSE", "opensuse"),
];

const BUILTIN_OS_INFO_TO_COMMON: &[(&str, &str)] = &[
    // oVirt OS types
    ("rhel_6", "rhel6.9"),
    ("rhel_6x64", "rhel6.9"),
    ("rhel_7x64", "rhel7.7"),
    ("rhel_8x64", "rhel8.1"),
    ("windows_10", "win10"),
    ("windows_10x64", "win10"),
    ("windows_2012R2x64", "win2k12r2"),
    ("windows_2016x64", "win2k16"),
    ("windows_2019x64", "win2k19"),
    // vSphere guest OS identifiers
    ("RHEL_6_64", "rhel6.9"),
    ("RHEL_7_64", "rhel7.7"),
    ("RHEL_8_64", "rhel8.1"),
    ("WINDOWS_9_64", "win10"),
    ("WINDOWS_9_SERVER_64", "win2k16"),
    ("WINDOWS_HYPERV", "win2k12r2"),
];

/// Lookup tables for OS resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsMaps {
    pub guest_to_common: BTreeMap<String, String>,
    pub info_to_common: BTreeMap<String, String>,
}

impl OsMaps {
    /// Tables seeded with the built-in entries only
    pub fn builtin() -> Self {
        let table = |entries: &[(&str, &str)]| {
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            guest_to_common: table(BUILTIN_GUEST_OS_TO_COMMON),
            info_to_common: table(BUILTIN_OS_INFO_TO_COMMON),
        }
    }

    /// Apply override entries from ConfigMap data.
    ///
    /// Entries are applied per key. A value that does not parse leaves that
    /// table untouched and is reported; the other table is still applied.
    pub fn apply_overrides(&mut self, data: &BTreeMap<String, String>) -> Result<(), ControllerError> {
        let mut failures = Vec::new();
        for (key, table) in [
            (GUEST_OS_TO_COMMON_KEY, &mut self.guest_to_common),
            (OS_INFO_TO_COMMON_KEY, &mut self.info_to_common),
        ] {
            let Some(raw) = data.get(key).filter(|raw| !raw.trim().is_empty()) else {
                continue;
            };
            match serde_yaml::from_str::<BTreeMap<String, String>>(raw) {
                Ok(overrides) => {
                    debug!("Applying {} OS override(s) from {}", overrides.len(), key);
                    table.extend(overrides);
                }
                Err(e) => failures.push(format!("{}: {}", key, e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::InvalidConfig(format!(
                "invalid OS mapping overrides: {}",
                failures.join("; ")
            )))
        }
    }

    /// Resolve the common OS identity of a guest
    pub fn resolve(&self, guest: &GuestOs) -> Result<String, ControllerError> {
        let common = guest
            .distribution
            .as_deref()
            .and_then(|distribution| self.guest_to_common.get(distribution));
        if let Some(common) = common {
            let version = guest.full_version.as_deref().unwrap_or_default();
            return Ok(format!("{}{}", common, version));
        }

        if let Some(os_type) = guest.os_type.as_deref() {
            if let Some(common) = self.info_to_common.get(os_type) {
                return Ok(common.clone());
            }
            let lower = os_type.to_ascii_lowercase();
            if lower.contains("linux") || lower.contains("rhel") {
                return Ok(DEFAULT_LINUX.to_string());
            }
            if lower.contains("win") {
                return Ok(DEFAULT_WINDOWS.to_string());
            }
        }

        Err(ControllerError::OsNotFound(format!(
            "distribution={} version={} type={}",
            guest.distribution.as_deref().unwrap_or("-"),
            guest.full_version.as_deref().unwrap_or("-"),
            guest.os_type.as_deref().unwrap_or("-"),
        )))
    }
}

/// OS tables together with any failure reading the override ConfigMap
#[derive(Debug)]
pub struct LoadedOsMaps {
    pub maps: OsMaps,
    pub override_error: Option<ControllerError>,
}

/// Load the OS tables, applying the override ConfigMap when one is configured.
///
/// A missing or unreadable ConfigMap is reported in `override_error`; the
/// returned tables always hold at least the built-ins.
pub async fn load_os_maps(
    config_maps: &dyn ResourceStore<ConfigMap>,
    override_ref: Option<&ConfigMapRef>,
) -> LoadedOsMaps {
    let mut maps = OsMaps::builtin();
    let Some(reference) = override_ref else {
        return LoadedOsMaps { maps, override_error: None };
    };

    let override_error = match config_maps.get(&reference.namespace, &reference.name).await {
        Ok(Some(config_map)) => {
            let data = config_map.data.unwrap_or_default();
            let result = maps.apply_overrides(&data);
            if result.is_ok() {
                info!("Loaded OS mapping overrides from {}/{}", reference.namespace, reference.name);
            }
            result.err()
        }
        Ok(None) => Some(ControllerError::MissingResource(format!(
            "OS mapping ConfigMap {}/{}",
            reference.namespace, reference.name
        ))),
        Err(e) => Some(e.into()),
    };
    if let Some(e) = &override_error {
        warn!("Using built-in OS mappings: {}", e);
    }
    LoadedOsMaps { maps, override_error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use kube::api::ObjectMeta;

    fn guest(distribution: Option<&str>, version: Option<&str>, os_type: Option<&str>) -> GuestOs {
        GuestOs {
            distribution: distribution.map(str::to_string),
            full_version: version.map(str::to_string),
            os_type: os_type.map(str::to_string),
        }
    }

    fn override_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    fn reference(name: &str) -> ConfigMapRef {
        ConfigMapRef {
            name: name.to_string(),
            namespace: "vm-import".to_string(),
        }
    }

    #[test]
    fn test_guest_distribution_with_version() {
        let maps = OsMaps::builtin();
        let os = maps
            .resolve(&guest(Some("Red Hat Enterprise Linux Server"), Some("7.7"), Some("rhel_7x64")))
            .unwrap();
        assert_eq!(os, "rhel7.7");
    }

    #[test]
    fn test_os_type_verbatim() {
        let maps = OsMaps::builtin();
        assert_eq!(maps.resolve(&guest(None, None, Some("rhel_6"))).unwrap(), "rhel6.9");
        assert_eq!(maps.resolve(&guest(Some("Unknown Distro"), Some("1"), Some("RHEL_7_64"))).unwrap(), "rhel7.7");
    }

    #[test]
    fn test_substring_defaults() {
        let maps = OsMaps::builtin();
        assert_eq!(maps.resolve(&guest(None, None, Some("windows_2022x64"))).unwrap(), DEFAULT_WINDOWS);
        assert_eq!(maps.resolve(&guest(None, None, Some("other_linux"))).unwrap(), DEFAULT_LINUX);
        assert_eq!(maps.resolve(&guest(None, None, Some("RHEL_9_64"))).unwrap(), DEFAULT_LINUX);
    }

    #[test]
    fn test_no_signal_is_os_not_found() {
        let maps = OsMaps::builtin();
        let err = maps.resolve(&guest(None, None, None)).unwrap_err();
        assert!(matches!(err, ControllerError::OsNotFound(_)));
        assert!(err.is_permanent());
        assert!(maps.resolve(&guest(None, None, Some("freebsd64"))).is_err());
    }

    #[test]
    fn test_override_wins_and_builtins_stay() {
        let mut maps = OsMaps::builtin();
        let data = [(GUEST_OS_TO_COMMON_KEY.to_string(), "Fedora: fedora-custom\n".to_string())].into();
        maps.apply_overrides(&data).unwrap();

        assert_eq!(maps.resolve(&guest(Some("Fedora"), Some("31"), None)).unwrap(), "fedora-custom31");
        assert_eq!(maps.resolve(&guest(Some("CentOS Linux"), Some("8"), None)).unwrap(), "centos8");
        assert_eq!(maps.resolve(&guest(None, None, Some("rhel_6"))).unwrap(), "rhel6.9");
    }

    #[test]
    fn test_unparsable_override_keeps_builtins() {
        let mut maps = OsMaps::builtin();
        let data = [
            (GUEST_OS_TO_COMMON_KEY.to_string(), "[not, a, map]".to_string()),
            (OS_INFO_TO_COMMON_KEY.to_string(), "custom_os: custom1\n".to_string()),
        ]
        .into();

        let err = maps.apply_overrides(&data).unwrap_err();
        assert!(err.to_string().contains(GUEST_OS_TO_COMMON_KEY));
        assert_eq!(maps.guest_to_common, OsMaps::builtin().guest_to_common);
        assert_eq!(maps.info_to_common["custom_os"], "custom1");
    }

    #[tokio::test]
    async fn test_load_os_maps_reports_missing_config_map() {
        let store = MemoryStore::<ConfigMap>::new();
        let loaded = load_os_maps(&store, Some(&reference("os-overrides"))).await;
        assert!(matches!(loaded.override_error, Some(ControllerError::MissingResource(_))));
        assert_eq!(loaded.maps, OsMaps::builtin());
    }

    #[tokio::test]
    async fn test_load_os_maps_applies_config_map() {
        let store = MemoryStore::<ConfigMap>::new();
        store.insert(
            "vm-import",
            override_map("os-overrides", &[(OS_INFO_TO_COMMON_KEY, "rhel_7x64: rhel7.9\n")]),
        );

        let loaded = load_os_maps(&store, Some(&reference("os-overrides"))).await;

        assert!(loaded.override_error.is_none());
        assert_eq!(loaded.maps.resolve(&guest(None, None, Some("rhel_7x64"))).unwrap(), "rhel7.9");

        let unconfigured = load_os_maps(&store, None).await;
        assert!(unconfigured.override_error.is_none());
        assert_eq!(unconfigured.maps, OsMaps::builtin());
    }
}

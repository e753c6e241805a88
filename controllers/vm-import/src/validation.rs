//! Source VM admission checks.
//!
//! Every failed check is reported; only `Block` failures stop the import.
//! All of them end up as `Validation.<check-id>` status conditions.

use crate::mapper::{is_supported_disk_interface, map_nic_model};
use crds::{
    CONDITION_MAPPING_RULES_VERIFIED, CONDITION_VALID, CONDITION_VALIDATION_PREFIX, Condition, ConditionStatus,
    Mappings,
};
use hypervisor_client::{PowerState, SourceVmSnapshot};

/// How a failed check affects the import
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Recorded only
    Log,
    /// Recorded and surfaced as a warning
    Warn,
    /// Stops the import
    Block,
}

impl Severity {
    fn reason(&self) -> &'static str {
        match self {
            Severity::Log => "ValidationLogged",
            Severity::Warn => "ValidationWarning",
            Severity::Block => "ValidationBlocked",
        }
    }
}

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub check_id: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl ValidationFailure {
    fn new(check_id: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            check_id,
            severity,
            message: message.into(),
        }
    }
}

/// One `Validation.<check-id>` condition per failed check.
///
/// Failures sharing a check id are combined: their messages are joined in
/// order and the most severe one sets the reason.
pub fn failure_conditions(failures: &[ValidationFailure]) -> Vec<Condition> {
    let mut grouped: Vec<(&'static str, Severity, Vec<&str>)> = Vec::new();
    for failure in failures {
        match grouped.iter_mut().find(|(id, _, _)| *id == failure.check_id) {
            Some((_, severity, messages)) => {
                *severity = (*severity).max(failure.severity);
                messages.push(failure.message.as_str());
            }
            None => grouped.push((failure.check_id, failure.severity, vec![failure.message.as_str()])),
        }
    }

    grouped
        .into_iter()
        .map(|(check_id, severity, messages)| {
            Condition::new(
                format!("{}{}", CONDITION_VALIDATION_PREFIX, check_id),
                ConditionStatus::False,
                severity.reason(),
                messages.join("; "),
            )
        })
        .collect()
}

/// Checks on the source VM itself
pub fn validate_vm(vm: &SourceVmSnapshot) -> Vec<ValidationFailure> {
    let mut failures = Vec::new();

    if let PowerState::Other(state) = &vm.power_state {
        failures.push(ValidationFailure::new(
            "vm.status.illegal",
            Severity::Block,
            format!("VM {} is in state '{}'", vm.name, state),
        ));
    }
    if vm.disks.is_empty() {
        failures.push(ValidationFailure::new(
            "vm.disks.none",
            Severity::Block,
            format!("VM {} has no disks", vm.name),
        ));
    }
    for disk in &vm.disks {
        if disk.lun {
            failures.push(ValidationFailure::new(
                "disk.storage-type.lun",
                Severity::Block,
                format!("disk {} is a direct LUN and cannot be imported", disk.name),
            ));
        }
        if !is_supported_disk_interface(&disk.interface) {
            failures.push(ValidationFailure::new(
                "disk.interface.unsupported",
                Severity::Block,
                format!("disk {} uses unsupported interface '{}'", disk.name, disk.interface),
            ));
        }
    }
    for nic in &vm.nics {
        if map_nic_model(&nic.interface_model).is_err() {
            failures.push(ValidationFailure::new(
                "nic.interface.unsupported",
                Severity::Block,
                format!("NIC {} uses unsupported model '{}'", nic.name, nic.interface_model),
            ));
        }
        if nic.mac_address.as_deref().is_none_or(str::is_empty) {
            failures.push(ValidationFailure::new(
                "nic.mac.missing",
                Severity::Warn,
                format!("NIC {} has no MAC address, a new one will be generated", nic.name),
            ));
        }
    }
    if vm.has_snapshots {
        failures.push(ValidationFailure::new(
            "vm.snapshots.present",
            Severity::Warn,
            format!("VM {} has snapshots, only the active layer is imported", vm.name),
        ));
    }
    if vm.usb_enabled {
        failures.push(ValidationFailure::new(
            "vm.usb.enabled",
            Severity::Log,
            format!("VM {} has USB enabled, USB devices are not imported", vm.name),
        ));
    }

    failures
}

/// Checks that every NIC network and disk resolves through the mapping rules
pub fn validate_mappings(vm: &SourceVmSnapshot, mappings: &Mappings) -> Vec<ValidationFailure> {
    let mut failures = Vec::new();

    for nic in &vm.nics {
        let mapped = mappings.network_mappings.iter().any(|rule| {
            nic.network_id.as_deref().is_some_and(|id| rule.source.matches_id(id))
                || nic.network_name.as_deref().is_some_and(|name| rule.source.matches_name(name))
        });
        if !mapped {
            failures.push(ValidationFailure::new(
                "mapping.network.missing",
                Severity::Block,
                format!(
                    "network '{}' of NIC {} has no network mapping",
                    nic.network_name.as_deref().or(nic.network_id.as_deref()).unwrap_or("<none>"),
                    nic.name
                ),
            ));
        }
    }

    for disk in &vm.disks {
        let mapped = mappings
            .disk_mappings
            .iter()
            .any(|r| r.source.matches_id(&disk.id) || r.source.matches_name(&disk.name))
            || mappings.storage_mappings.iter().any(|r| {
                disk.storage_id.as_deref().is_some_and(|id| r.source.matches_id(id))
                    || disk.storage_name.as_deref().is_some_and(|name| r.source.matches_name(name))
            });
        if !mapped {
            failures.push(ValidationFailure::new(
                "mapping.storage.missing",
                Severity::Log,
                format!("disk {} has no storage mapping, the default storage class is used", disk.name),
            ));
        }
    }

    failures
}

/// Summary conditions for a set of check results
pub fn summary_conditions(vm_checks: &[ValidationFailure], mapping_checks: &[ValidationFailure]) -> Vec<Condition> {
    let blocking = |checks: &[ValidationFailure]| {
        let mut ids: Vec<&str> = Vec::new();
        for failure in checks.iter().filter(|f| f.severity == Severity::Block) {
            if !ids.contains(&failure.check_id) {
                ids.push(failure.check_id);
            }
        }
        ids
    };

    let vm_blocking = blocking(vm_checks);
    let valid = if vm_blocking.is_empty() {
        Condition::new(CONDITION_VALID, ConditionStatus::True, "Validated", "source VM passed validation")
    } else {
        Condition::new(
            CONDITION_VALID,
            ConditionStatus::False,
            "ValidationBlocked",
            format!("blocking checks failed: {}", vm_blocking.join(", ")),
        )
    };

    let mapping_blocking = blocking(mapping_checks);
    let mapping = if mapping_blocking.is_empty() {
        Condition::new(
            CONDITION_MAPPING_RULES_VERIFIED,
            ConditionStatus::True,
            "MappingRulesVerified",
            "all source networks are mapped",
        )
    } else {
        Condition::new(
            CONDITION_MAPPING_RULES_VERIFIED,
            ConditionStatus::False,
            "IncompleteMappingRules",
            format!("blocking checks failed: {}", mapping_blocking.join(", ")),
        )
    };

    vec![valid, mapping]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn ids(failures: &[ValidationFailure]) -> Vec<&'static str> {
        failures.iter().map(|f| f.check_id).collect()
    }

    #[test]
    fn test_clean_vm_passes() {
        assert!(validate_vm(&ovirt_vm()).is_empty());
        assert!(validate_mappings(&ovirt_vm(), &ovirt_mappings()).is_empty());
    }

    #[test]
    fn test_blocking_checks() {
        let mut vm = ovirt_vm();
        vm.power_state = PowerState::Other("image_locked".to_string());
        vm.disks[0].lun = true;
        vm.disks[0].interface = "floppy".to_string();
        vm.nics[0].interface_model = "pci_passthrough".to_string();

        let failures = validate_vm(&vm);

        assert_eq!(
            ids(&failures),
            vec!["vm.status.illegal", "disk.storage-type.lun", "disk.interface.unsupported", "nic.interface.unsupported"]
        );
        assert!(failures.iter().all(|f| f.severity == Severity::Block));
    }

    #[test]
    fn test_no_disks_blocks() {
        let mut vm = vmware_vm();
        vm.disks.clear();
        let failures = validate_vm(&vm);
        assert_eq!(ids(&failures), vec!["vm.disks.none"]);
    }

    #[test]
    fn test_warn_and_log_checks() {
        let mut vm = ovirt_vm();
        vm.nics[0].mac_address = None;
        vm.has_snapshots = true;
        vm.usb_enabled = true;

        let failures = validate_vm(&vm);

        assert_eq!(ids(&failures), vec!["nic.mac.missing", "vm.snapshots.present", "vm.usb.enabled"]);
        assert_eq!(failures[0].severity, Severity::Warn);
        assert_eq!(failures[2].severity, Severity::Log);
        let conditions = summary_conditions(&failures, &[]);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_missing_mappings() {
        let failures = validate_mappings(&ovirt_vm(), &Mappings::default());
        assert_eq!(ids(&failures), vec!["mapping.network.missing", "mapping.storage.missing"]);

        let conditions = summary_conditions(&[], &failures);
        assert_eq!(conditions[1].condition_type, CONDITION_MAPPING_RULES_VERIFIED);
        assert_eq!(conditions[1].status, ConditionStatus::False);
    }

    #[test]
    fn test_failure_condition() {
        let failure = ValidationFailure::new("vm.usb.enabled", Severity::Log, "usb");
        let conditions = failure_conditions(&[failure]);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].condition_type, "Validation.vm.usb.enabled");
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].reason.as_deref(), Some("ValidationLogged"));
    }

    #[test]
    fn test_failures_of_one_check_share_a_condition() {
        let mut vm = ovirt_vm();
        let mut second = vm.nics[0].clone();
        second.name = "nic2".to_string();
        second.mac_address = Some(String::new());
        vm.nics[0].mac_address = None;
        vm.nics.push(second);
        vm.disks[0].lun = true;
        let mut lun = vm.disks[0].clone();
        lun.name = "disk-2".to_string();
        vm.disks.push(lun);

        let failures = validate_vm(&vm);
        assert_eq!(failures.len(), 4);

        let conditions = failure_conditions(&failures);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].condition_type, "Validation.disk.storage-type.lun");
        let lun_message = conditions[0].message.as_deref().unwrap();
        assert!(lun_message.contains(&vm.disks[0].name));
        assert!(lun_message.contains("disk-2"));
        assert_eq!(conditions[1].condition_type, "Validation.nic.mac.missing");
        assert_eq!(
            conditions[1].message.as_deref(),
            Some(
                "NIC nic1 has no MAC address, a new one will be generated; \
                 NIC nic2 has no MAC address, a new one will be generated"
            )
        );
        assert_eq!(conditions[1].reason.as_deref(), Some("ValidationWarning"));

        let summary = summary_conditions(&failures, &[]);
        assert_eq!(summary[0].message.as_deref(), Some("blocking checks failed: disk.storage-type.lun"));
    }

    #[test]
    fn test_combined_condition_takes_most_severe_reason() {
        let failures = vec![
            ValidationFailure::new("vm.usb.enabled", Severity::Log, "first"),
            ValidationFailure::new("vm.usb.enabled", Severity::Block, "second"),
        ];
        let conditions = failure_conditions(&failures);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason.as_deref(), Some("ValidationBlocked"));
        assert_eq!(conditions[0].message.as_deref(), Some("first; second"));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Virtual-circuit provisioning.
//!
//! Creates and removes a layer-2 circuit between the engine's local
//! endpoint and the peer's endpoint by invoking an external provisioning
//! script as a child process. Endpoints whose switch or port identifier
//! begins with `"dummy"` take a test-mode no-op path instead of spawning
//! anything; this short-circuit must be preserved bit-exactly, since it is
//! the only way the test suite (and CI) exercises the handshake without
//! real layer-2 infrastructure.

use crate::protocol::VcEndpoint;
use std::process::Command;

/// A provisioned circuit's opaque identifier.
pub type CircuitId = String;

/// Errors from provisioning or removing a circuit.
#[derive(Debug, Clone)]
pub enum ProvisionError {
    /// A required input was missing or empty.
    Inval(String),
    /// The provisioning script failed or could not be run.
    System(String),
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inval(s) => write!(f, "invalid argument: {}", s),
            Self::System(s) => write!(f, "system error: {}", s),
        }
    }
}

impl std::error::Error for ProvisionError {}

/// Abstraction over circuit provisioning, so the handshake can be
/// driven in tests without spawning real child processes.
pub trait CircuitProvisioner: Send {
    fn provision(
        &mut self,
        workgroup: &str,
        description: &str,
        end1: &VcEndpoint,
        end2: &VcEndpoint,
    ) -> Result<CircuitId, ProvisionError>;

    fn remove(&mut self, workgroup: &str, circuit_id: &str) -> Result<(), ProvisionError>;
}

const DUMMY_CIRCUIT_ID: &str = "dummy_circuitId";

fn either_is_dummy(end1: &VcEndpoint, end2: &VcEndpoint) -> bool {
    end1.is_dummy() || end2.is_dummy()
}

/// Production provisioner: shells out to an external script.
pub struct ScriptCircuitProvisioner {
    interpreter: String,
    script: String,
}

impl ScriptCircuitProvisioner {
    pub fn new(interpreter: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }
}

impl CircuitProvisioner for ScriptCircuitProvisioner {
    fn provision(
        &mut self,
        workgroup: &str,
        description: &str,
        end1: &VcEndpoint,
        end2: &VcEndpoint,
    ) -> Result<CircuitId, ProvisionError> {
        if workgroup.is_empty() || description.is_empty() {
            return Err(ProvisionError::Inval("empty workgroup or description".into()));
        }

        if either_is_dummy(end1, end2) {
            tracing::debug!("dummy endpoint detected, skipping circuit provisioning");
            return Ok(DUMMY_CIRCUIT_ID.to_string());
        }

        let _guard = PrivilegeGuard::elevate();

        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg(workgroup)
            .arg(&end1.switch_id)
            .arg(&end1.port_id)
            .arg(end1.vlan_id.to_string())
            .arg(&end2.switch_id)
            .arg(&end2.port_id)
            .arg(end2.vlan_id.to_string())
            .output()
            .map_err(|e| ProvisionError::System(format!("failed to spawn provisioner: {}", e)))?;

        drop(_guard);

        if !output.status.success() {
            return Err(ProvisionError::System(format!(
                "provisioning script exited with {}",
                output.status
            )));
        }

        let circuit_id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if circuit_id.is_empty() {
            return Err(ProvisionError::System(
                "provisioning script produced no circuit id".into(),
            ));
        }

        Ok(circuit_id)
    }

    fn remove(&mut self, workgroup: &str, circuit_id: &str) -> Result<(), ProvisionError> {
        if circuit_id.starts_with("dummy") {
            return Ok(());
        }

        let _guard = PrivilegeGuard::elevate();

        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg("remove")
            .arg(workgroup)
            .arg(circuit_id)
            .output()
            .map_err(|e| ProvisionError::System(format!("failed to spawn provisioner: {}", e)))?;

        if !output.status.success() {
            return Err(ProvisionError::System(format!(
                "circuit removal exited with {}",
                output.status
            )));
        }

        Ok(())
    }
}

/// Drops the process's effective privilege to its real user id, retaining
/// the saved set-user-id (the kernel does not clear it on `seteuid`) so
/// that [`PrivilegeGuard::elevate`] can re-escalate back to it later around
/// a provisioning spawn. Call once at startup, before accepting any peer
/// connection -- a setuid-root-installed binary otherwise runs with root
/// privilege for its entire lifetime rather than only around the spawn.
/// A no-op if the process has no elevated effective privilege to drop
/// (e.g. not installed setuid, or already running unprivileged).
#[cfg(unix)]
pub fn drop_startup_privilege() {
    // SAFETY: getuid/geteuid/seteuid take no pointers and cannot corrupt
    // memory; a failed seteuid just leaves euid unchanged.
    let real_uid = unsafe { libc::getuid() };
    let euid = unsafe { libc::geteuid() };
    if euid != real_uid {
        unsafe {
            libc::seteuid(real_uid);
        }
    }
}

#[cfg(not(unix))]
pub fn drop_startup_privilege() {}

/// Re-escalates the process's effective privilege to root for the
/// duration of the provisioning child spawn, and drops it back to the
/// pre-elevate effective uid again on drop. Relies on the saved
/// set-user-id left behind by [`drop_startup_privilege`] at process
/// startup; on platforms or processes without ambient setuid privilege
/// `seteuid(0)` simply fails and this is a no-op -- operators on such
/// platforms are expected to route provisioning through an external
/// privileged helper instead (see DESIGN.md).
struct PrivilegeGuard {
    #[cfg(unix)]
    original_euid: Option<libc::uid_t>,
}

impl PrivilegeGuard {
    #[cfg(unix)]
    fn elevate() -> Self {
        // SAFETY: geteuid/seteuid take no pointers and cannot fail in a way
        // that corrupts memory; a failed seteuid just leaves euid unchanged,
        // which is why the result is checked before recording `original_euid`.
        let current_euid = unsafe { libc::geteuid() };
        if current_euid == 0 {
            // Already running privileged; nothing to elevate or later drop.
            return Self {
                original_euid: None,
            };
        }
        let result = unsafe { libc::seteuid(0) };
        if result != 0 {
            // No saved-root privilege to reclaim (not a setuid-root install).
            return Self {
                original_euid: None,
            };
        }
        Self {
            original_euid: Some(current_euid),
        }
    }

    #[cfg(not(unix))]
    fn elevate() -> Self {
        Self {}
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(euid) = self.original_euid {
            // SAFETY: restoring the effective uid recorded on construction.
            unsafe {
                libc::seteuid(euid);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeCircuitProvisioner;
    use super::*;

    fn endpoint(switch: &str, port: &str) -> VcEndpoint {
        VcEndpoint {
            switch_id: switch.into(),
            port_id: port.into(),
            vlan_id: 100,
        }
    }

    #[test]
    fn dummy_endpoint_short_circuits_without_spawning() {
        let mut p = FakeCircuitProvisioner::default();
        let e1 = endpoint("dummy-sw1", "p1");
        let e2 = endpoint("sw2", "p2");

        let id = p.provision("wg", "desc", &e1, &e2).unwrap();
        assert_eq!(id, DUMMY_CIRCUIT_ID);
        assert!(p.provisioned.is_empty());
    }

    #[test]
    fn dummy_remove_is_noop() {
        let mut p = FakeCircuitProvisioner::default();
        p.remove("wg", DUMMY_CIRCUIT_ID).unwrap();
        assert!(p.removed.is_empty());
    }

    #[test]
    fn real_endpoint_records_provision_and_remove() {
        let mut p = FakeCircuitProvisioner::default();
        let e1 = endpoint("sw1", "p1");
        let e2 = endpoint("sw2", "p2");

        let id = p.provision("wg", "desc", &e1, &e2).unwrap();
        assert_eq!(p.provisioned, vec![id.clone()]);

        p.remove("wg", &id).unwrap();
        assert_eq!(p.removed, vec![id]);
    }

    #[test]
    fn empty_workgroup_is_invalid() {
        let mut p = FakeCircuitProvisioner::default();
        let e1 = endpoint("sw1", "p1");
        let e2 = endpoint("sw2", "p2");
        let err = p.provision("", "desc", &e1, &e2).unwrap_err();
        assert!(matches!(err, ProvisionError::Inval(_)));
    }

    #[cfg(unix)]
    #[test]
    fn drop_startup_privilege_is_harmless_when_not_setuid() {
        // The test process is never setuid-root, so real and effective uid
        // already match; this must leave euid untouched rather than error.
        let before = unsafe { libc::geteuid() };
        drop_startup_privilege();
        let after = unsafe { libc::geteuid() };
        assert_eq!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn privilege_guard_elevate_is_a_noop_without_ambient_privilege() {
        // `seteuid(0)` fails for an unprivileged, non-setuid test process,
        // so the guard must record no euid to restore and its `Drop` must
        // not attempt to touch euid at all.
        let before = unsafe { libc::geteuid() };
        {
            let _guard = PrivilegeGuard::elevate();
            assert_eq!(unsafe { libc::geteuid() }, before);
        }
        assert_eq!(unsafe { libc::geteuid() }, before);
    }
}

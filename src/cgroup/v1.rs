//! Legacy (hierarchical) cgroup backend: one subtree per controller mount.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{
    cpu_quota_of, read_cgroup_procs, v1_controller_name, write_cgroup_file, ControllerFlags,
    CPU_PERIOD_BASE,
};
use crate::device::DeviceMap;
use crate::error::{CranedError, Result};

const V1_CONTROLLERS: [ControllerFlags; 6] = [
    ControllerFlags::CPU,
    ControllerFlags::CPUACCT,
    ControllerFlags::MEMORY,
    ControllerFlags::DEVICES,
    ControllerFlags::BLKIO,
    ControllerFlags::FREEZER,
];

pub struct CgroupV1 {
    name: String,
    root: PathBuf,
    /// Controllers this cgroup was materialized under.
    controllers: ControllerFlags,
}

impl CgroupV1 {
    pub(super) fn create_or_open(
        root: &Path,
        name: &str,
        preferred: ControllerFlags,
        required: ControllerFlags,
        mounted: ControllerFlags,
        recover: bool,
    ) -> Result<Self> {
        let mut enabled = ControllerFlags::empty();

        for flag in V1_CONTROLLERS {
            if !preferred.contains(flag) {
                continue;
            }
            let controller = v1_controller_name(flag);
            if !mounted.contains(flag) {
                if required.contains(flag) {
                    return Err(CranedError::Cgroup(format!(
                        "required cgroup controller {controller} is not mounted"
                    )));
                }
                tracing::warn!(controller, "Cgroup controller is not mounted. Skipping it");
                continue;
            }

            let subtree = root.join(controller).join(name);
            let existed = subtree.is_dir();
            if !existed {
                if let Err(e) = std::fs::create_dir_all(&subtree) {
                    if required.contains(flag) {
                        return Err(CranedError::Cgroup(format!(
                            "cannot create cgroup {}: {e}",
                            subtree.display()
                        )));
                    }
                    tracing::warn!(
                        controller,
                        path = %subtree.display(),
                        error = %e,
                        "Cannot create cgroup subtree"
                    );
                    continue;
                }
            }

            // Hierarchical memory accounting on a freshly created subtree.
            if flag == ControllerFlags::MEMORY && !existed && !recover {
                let hierarchy_file = subtree.join("memory.use_hierarchy");
                if let Err(e) = write_cgroup_file(&hierarchy_file, "1") {
                    tracing::warn!(error = %e, "Unable to set hierarchical memory accounting");
                }
            }

            enabled |= flag;
        }

        Ok(CgroupV1 {
            name: name.to_string(),
            root: root.to_path_buf(),
            controllers: enabled,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn file(&self, controller: ControllerFlags, file: &str) -> PathBuf {
        self.root
            .join(v1_controller_name(controller))
            .join(&self.name)
            .join(file)
    }

    fn require(&self, controller: ControllerFlags) -> Result<()> {
        if !self.controllers.contains(controller) {
            return Err(CranedError::Cgroup(format!(
                "cgroup {} has no {} controller",
                self.name,
                v1_controller_name(controller)
            )));
        }
        Ok(())
    }

    pub fn set_cpu_core_limit(&self, core_num: f64) -> Result<()> {
        self.require(ControllerFlags::CPU)?;
        write_cgroup_file(
            &self.file(ControllerFlags::CPU, "cpu.cfs_quota_us"),
            &cpu_quota_of(core_num).to_string(),
        )?;
        write_cgroup_file(
            &self.file(ControllerFlags::CPU, "cpu.cfs_period_us"),
            &CPU_PERIOD_BASE.to_string(),
        )
    }

    pub fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        self.require(ControllerFlags::CPU)?;
        write_cgroup_file(
            &self.file(ControllerFlags::CPU, "cpu.shares"),
            &shares.to_string(),
        )
    }

    pub fn set_memory_limit_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY)?;
        write_cgroup_file(
            &self.file(ControllerFlags::MEMORY, "memory.limit_in_bytes"),
            &bytes.to_string(),
        )
    }

    pub fn set_memory_soft_limit_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY)?;
        write_cgroup_file(
            &self.file(ControllerFlags::MEMORY, "memory.soft_limit_in_bytes"),
            &bytes.to_string(),
        )
    }

    pub fn set_memory_sw_limit_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY)?;
        write_cgroup_file(
            &self.file(ControllerFlags::MEMORY, "memory.memsw.limit_in_bytes"),
            &bytes.to_string(),
        )
    }

    pub fn set_blockio_weight(&self, weight: u64) -> Result<()> {
        self.require(ControllerFlags::BLKIO)?;
        write_cgroup_file(
            &self.file(ControllerFlags::BLKIO, "blkio.weight"),
            &weight.to_string(),
        )
    }

    /// Write one `devices.deny` line per known device outside the assigned
    /// slot set. No entry means access is allowed.
    pub fn set_device_access(
        &self,
        devices: &DeviceMap,
        assigned: &HashSet<String>,
        set_read: bool,
        set_write: bool,
        set_mknod: bool,
    ) -> Result<()> {
        self.require(ControllerFlags::DEVICES)?;

        let op = device_op_string(set_read, set_write, set_mknod);
        let deny_file = self.file(ControllerFlags::DEVICES, "devices.deny");

        for dev in devices.denied_devices(assigned) {
            let line = format!("{} {}:{} {op}", dev.kind.as_char(), dev.major, dev.minor);
            write_cgroup_file(&deny_file, &line)?;
        }
        Ok(())
    }

    /// One cgroup.procs file per controller subtree.
    pub fn procs_paths(&self) -> Vec<PathBuf> {
        V1_CONTROLLERS
            .iter()
            .filter(|flag| self.controllers.contains(**flag))
            .map(|flag| self.file(*flag, "cgroup.procs"))
            .collect()
    }

    /// Attach a process to every controller subtree of this cgroup.
    pub fn migrate_proc_in(&self, pid: i32) -> Result<()> {
        for flag in V1_CONTROLLERS {
            if !self.controllers.contains(flag) {
                continue;
            }
            write_cgroup_file(&self.file(flag, "cgroup.procs"), &pid.to_string())?;
        }
        Ok(())
    }

    pub fn kill_all_processes(&self) -> Result<()> {
        self.require(ControllerFlags::CPU)?;
        let pids = read_cgroup_procs(&self.file(ControllerFlags::CPU, "cgroup.procs"))?;
        for pid in pids {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        Ok(())
    }

    pub fn empty(&self) -> Result<bool> {
        self.require(ControllerFlags::CPU)?;
        let pids = read_cgroup_procs(&self.file(ControllerFlags::CPU, "cgroup.procs"))?;
        Ok(pids.is_empty())
    }

    pub fn destroy(self) -> Result<()> {
        let mut first_err = None;
        for flag in V1_CONTROLLERS {
            if !self.controllers.contains(flag) {
                continue;
            }
            let subtree = self.root.join(v1_controller_name(flag)).join(&self.name);
            if let Err(e) = std::fs::remove_dir(&subtree) {
                tracing::error!(
                    path = %subtree.display(),
                    error = %e,
                    "Unable to remove cgroup subtree"
                );
                first_err.get_or_insert_with(|| {
                    CranedError::Cgroup(format!("cannot remove {}: {e}", subtree.display()))
                });
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub(super) fn device_op_string(set_read: bool, set_write: bool, set_mknod: bool) -> String {
    let mut op = String::new();
    if set_read {
        op.push('r');
    }
    if set_write {
        op.push('w');
    }
    if set_mknod {
        op.push('m');
    }
    op
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_op_string_bits() {
        assert_eq!(device_op_string(true, true, true), "rwm");
        assert_eq!(device_op_string(true, false, false), "r");
        assert_eq!(device_op_string(false, true, true), "wm");
        assert_eq!(device_op_string(false, false, false), "");
    }
}

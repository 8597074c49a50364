//! Unified-hierarchy cgroup backend: one subtree under the root, device
//! enforcement via the BPF filter program.

use std::collections::HashSet;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use libbpf_rs::Link;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::bpf::{
    self, BpfDeviceMeta, BPF_DEVCG_ACC_MKNOD, BPF_DEVCG_ACC_READ, BPF_DEVCG_ACC_WRITE,
    BPF_DEVCG_DEV_BLOCK, BPF_DEVCG_DEV_CHAR, BPF_DEV_TYPE_ANY, BPF_PERMISSION_DENY,
};
use super::{
    cpu_quota_of, read_cgroup_procs, v2_controller_name, write_cgroup_file, ControllerFlags,
    CPU_PERIOD_BASE,
};
use crate::device::{DeviceKind, DeviceMap};
use crate::error::{CranedError, Result};

const V2_CONTROLLERS: [ControllerFlags; 5] = [
    ControllerFlags::CPU_V2,
    ControllerFlags::MEMORY_V2,
    ControllerFlags::IO_V2,
    ControllerFlags::CPUSET_V2,
    ControllerFlags::PIDS_V2,
];

pub struct CgroupV2 {
    name: String,
    path: PathBuf,
    /// Directory inode; the stable id the in-kernel filter keys on.
    inode: u64,
    controllers: ControllerFlags,
    /// Directory fd held for the cgroup's lifetime; the BPF attach is bound
    /// to it.
    dir: File,
    bpf_devices: Vec<BpfDeviceMeta>,
    bpf_link: Option<Link>,
    bpf_attached: bool,
    bpf_released: bool,
}

impl CgroupV2 {
    pub(super) fn create_or_open(
        root: &Path,
        name: &str,
        preferred: ControllerFlags,
        required: ControllerFlags,
        mounted: ControllerFlags,
        recover: bool,
    ) -> Result<Self> {
        // Controllers must already be delegated from the root to take
        // effect in the job subtree.
        let delegated = std::fs::read_to_string(root.join("cgroup.subtree_control"))
            .map(|s| super::parse_v2_controllers(&s))
            .unwrap_or(ControllerFlags::empty());

        let mut enabled = ControllerFlags::empty();
        for flag in V2_CONTROLLERS {
            if !preferred.contains(flag) {
                continue;
            }
            let controller = v2_controller_name(flag);
            if !mounted.contains(flag) || !delegated.contains(flag) {
                if required.contains(flag) {
                    return Err(CranedError::Cgroup(format!(
                        "required cgroup controller {controller} is not delegated from the root"
                    )));
                }
                tracing::warn!(controller, "Cgroup controller is not delegated. Skipping it");
                continue;
            }
            enabled |= flag;
        }

        let path = root.join(name);
        if !path.is_dir() {
            if recover {
                tracing::warn!(cgroup = name, "Cgroup to recover does not exist. Recreating it");
            }
            std::fs::create_dir_all(&path).map_err(|e| {
                CranedError::Cgroup(format!("cannot create cgroup {}: {e}", path.display()))
            })?;
        }

        let meta = std::fs::metadata(&path).map_err(|e| {
            CranedError::Cgroup(format!("cgroup {name} created but stat failed: {e}"))
        })?;
        let dir = File::open(&path).map_err(|e| {
            CranedError::Cgroup(format!("cannot open cgroup directory {}: {e}", path.display()))
        })?;

        bpf::acquire()?;

        Ok(CgroupV2 {
            name: name.to_string(),
            inode: meta.ino(),
            path,
            controllers: enabled,
            dir,
            bpf_devices: Vec::new(),
            bpf_link: None,
            bpf_attached: false,
            bpf_released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    fn file(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }

    fn require(&self, controller: ControllerFlags) -> Result<()> {
        if !self.controllers.contains(controller) {
            return Err(CranedError::Cgroup(format!(
                "cgroup {} has no {} controller",
                self.name,
                v2_controller_name(controller)
            )));
        }
        Ok(())
    }

    pub fn set_cpu_core_limit(&self, core_num: f64) -> Result<()> {
        self.require(ControllerFlags::CPU_V2)?;
        let value = format!("{} {}", cpu_quota_of(core_num), CPU_PERIOD_BASE);
        write_cgroup_file(&self.file("cpu.max"), &value)
    }

    pub fn set_cpu_weight(&self, weight: u64) -> Result<()> {
        self.require(ControllerFlags::CPU_V2)?;
        write_cgroup_file(&self.file("cpu.weight"), &weight.to_string())
    }

    pub fn set_memory_limit_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY_V2)?;
        write_cgroup_file(&self.file("memory.max"), &bytes.to_string())
    }

    pub fn set_memory_high_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY_V2)?;
        write_cgroup_file(&self.file("memory.high"), &bytes.to_string())
    }

    pub fn set_memory_swap_max_bytes(&self, bytes: u64) -> Result<()> {
        self.require(ControllerFlags::MEMORY_V2)?;
        write_cgroup_file(&self.file("memory.swap.max"), &bytes.to_string())
    }

    pub fn set_io_weight(&self, weight: u64) -> Result<()> {
        self.require(ControllerFlags::IO_V2)?;
        write_cgroup_file(&self.file("io.weight"), &weight.to_string())
    }

    /// Write one deny entry into the shared device map per known device
    /// outside the assigned slot set, and attach the filter program to this
    /// cgroup on first use.
    pub fn set_device_access(
        &mut self,
        devices: &DeviceMap,
        assigned: &HashSet<String>,
        set_read: bool,
        set_write: bool,
        set_mknod: bool,
    ) -> Result<()> {
        let metas = deny_metas(devices, assigned, set_read, set_write, set_mknod);
        if metas.is_empty() {
            return Ok(());
        }

        bpf::update_entries(self.inode, &metas)?;
        self.bpf_devices.extend_from_slice(&metas);

        // No need to attach the filter program twice.
        if !self.bpf_attached {
            let link = bpf::attach(self.dir.as_raw_fd())?;
            self.bpf_link = Some(link);
            self.bpf_attached = true;
        }
        Ok(())
    }

    /// Rebuild the deny set for an adopted cgroup without touching the map:
    /// the entries and the attachment survived the agent restart; only the
    /// bookkeeping needed for later teardown is reconstructed.
    pub fn recover_device_entries(
        &mut self,
        devices: &DeviceMap,
        assigned: &HashSet<String>,
        set_read: bool,
        set_write: bool,
        set_mknod: bool,
    ) {
        self.bpf_devices = deny_metas(devices, assigned, set_read, set_write, set_mknod);
        self.bpf_attached = true;
    }

    pub fn procs_paths(&self) -> Vec<PathBuf> {
        vec![self.file("cgroup.procs")]
    }

    pub fn migrate_proc_in(&self, pid: i32) -> Result<()> {
        write_cgroup_file(&self.file("cgroup.procs"), &pid.to_string())
    }

    pub fn kill_all_processes(&self) -> Result<()> {
        let pids = read_cgroup_procs(&self.file("cgroup.procs"))?;
        for pid in pids {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        Ok(())
    }

    pub fn empty(&self) -> Result<bool> {
        let pids = read_cgroup_procs(&self.file("cgroup.procs"))?;
        Ok(pids.is_empty())
    }

    pub fn destroy(mut self) -> Result<()> {
        // Remove the cgroup before erasing its map entries.
        std::fs::remove_dir(&self.path).map_err(|e| {
            CranedError::Cgroup(format!("cannot remove {}: {e}", self.path.display()))
        })?;

        if !self.bpf_devices.is_empty() {
            if let Err(e) = bpf::delete_entries(self.inode, &self.bpf_devices) {
                tracing::error!(cgroup = %self.name, error = %e, "Failed to erase device map entries");
            }
            self.bpf_devices.clear();
        }
        self.bpf_link = None;
        bpf::release();
        self.bpf_released = true;
        Ok(())
    }
}

impl Drop for CgroupV2 {
    fn drop(&mut self) {
        if !self.bpf_released {
            self.bpf_link = None;
            bpf::release();
            self.bpf_released = true;
        }
    }
}

fn deny_metas(
    devices: &DeviceMap,
    assigned: &HashSet<String>,
    set_read: bool,
    set_write: bool,
    set_mknod: bool,
) -> Vec<BpfDeviceMeta> {
    let mut access = 0u16;
    if set_read {
        access |= BPF_DEVCG_ACC_READ;
    }
    if set_write {
        access |= BPF_DEVCG_ACC_WRITE;
    }
    if set_mknod {
        access |= BPF_DEVCG_ACC_MKNOD;
    }

    devices
        .denied_devices(assigned)
        .into_iter()
        .map(|dev| BpfDeviceMeta {
            major: dev.major,
            minor: dev.minor,
            permission: BPF_PERMISSION_DENY,
            access,
            dev_type: match dev.kind {
                DeviceKind::Char => BPF_DEVCG_DEV_CHAR,
                DeviceKind::Block => BPF_DEVCG_DEV_BLOCK,
                DeviceKind::Other => BPF_DEV_TYPE_ANY,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, EnvInjector};

    fn device_map() -> DeviceMap {
        DeviceMap::from_devices(vec![
            Device {
                slot_id: "/dev/nvidia0".to_string(),
                name: "gpu".to_string(),
                gres_type: "a100".to_string(),
                kind: DeviceKind::Char,
                major: 195,
                minor: 0,
                env_injector: EnvInjector::Nvidia,
            },
            Device {
                slot_id: "/dev/nvidia1".to_string(),
                name: "gpu".to_string(),
                gres_type: "a100".to_string(),
                kind: DeviceKind::Char,
                major: 195,
                minor: 1,
                env_injector: EnvInjector::Nvidia,
            },
        ])
    }

    #[test]
    fn deny_metas_cover_unassigned_devices_only() {
        let devices = device_map();
        let assigned: HashSet<String> = ["/dev/nvidia0".to_string()].into();

        let metas = deny_metas(&devices, &assigned, true, true, true);
        assert_eq!(metas.len(), 1);
        assert_eq!((metas[0].major, metas[0].minor), (195, 1));
        assert_eq!(metas[0].permission, BPF_PERMISSION_DENY);
        assert_eq!(
            metas[0].access,
            BPF_DEVCG_ACC_READ | BPF_DEVCG_ACC_WRITE | BPF_DEVCG_ACC_MKNOD
        );
        assert_eq!(metas[0].dev_type, BPF_DEVCG_DEV_CHAR);
    }

    #[test]
    fn access_bits_follow_flags() {
        let devices = device_map();
        let metas = deny_metas(&devices, &HashSet::new(), true, false, false);
        assert!(metas.iter().all(|m| m.access == BPF_DEVCG_ACC_READ));
    }
}

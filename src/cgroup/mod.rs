//! Cgroup driver for per-job resource enforcement.
//!
//! Abstracts the two cgroup generations behind one handle type:
//! - **v1** (legacy): one subtree per controller mount, limits written to
//!   controller-specific files, device access via `devices.deny`.
//! - **v2** (unified): one subtree under the root hierarchy, limits written
//!   to the unified interface files, device access via a BPF program
//!   attached to the cgroup with entries in a shared device map.
//!
//! Hybrid hosts (both generations mounted) are rejected at startup.

pub mod bpf;
pub mod v1;
pub mod v2;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bitflags::bitflags;
use regex::Regex;

use crate::device::DeviceMap;
use crate::error::{CranedError, Result};
use crate::JobId;

pub use v1::CgroupV1;
pub use v2::CgroupV2;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

bitflags! {
    /// Set of cgroup controllers, across both generations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerFlags: u32 {
        const CPU      = 1 << 0;
        const CPUACCT  = 1 << 1;
        const MEMORY   = 1 << 2;
        const DEVICES  = 1 << 3;
        const BLKIO    = 1 << 4;
        const FREEZER  = 1 << 5;

        const CPU_V2    = 1 << 8;
        const MEMORY_V2 = 1 << 9;
        const IO_V2     = 1 << 10;
        const CPUSET_V2 = 1 << 11;
        const PIDS_V2   = 1 << 12;
    }
}

/// Controllers we materialize for every v1 job cgroup.
pub const V1_PREFERRED_CONTROLLERS: ControllerFlags = ControllerFlags::CPU
    .union(ControllerFlags::MEMORY)
    .union(ControllerFlags::DEVICES)
    .union(ControllerFlags::BLKIO)
    .union(ControllerFlags::FREEZER);

/// Controllers that must be mounted for v1 operation.
pub const V1_REQUIRED_CONTROLLERS: ControllerFlags = ControllerFlags::CPU
    .union(ControllerFlags::MEMORY)
    .union(ControllerFlags::DEVICES)
    .union(ControllerFlags::BLKIO);

/// Controllers we enable for every v2 job cgroup.
pub const V2_PREFERRED_CONTROLLERS: ControllerFlags = ControllerFlags::CPU_V2
    .union(ControllerFlags::MEMORY_V2)
    .union(ControllerFlags::IO_V2)
    .union(ControllerFlags::CPUSET_V2)
    .union(ControllerFlags::PIDS_V2);

/// Controllers that must be available for v2 operation.
pub const V2_REQUIRED_CONTROLLERS: ControllerFlags = ControllerFlags::CPU_V2
    .union(ControllerFlags::MEMORY_V2)
    .union(ControllerFlags::IO_V2);

/// v1 controller mount directory names.
pub fn v1_controller_name(flag: ControllerFlags) -> &'static str {
    match flag {
        ControllerFlags::CPU => "cpu",
        ControllerFlags::CPUACCT => "cpuacct",
        ControllerFlags::MEMORY => "memory",
        ControllerFlags::DEVICES => "devices",
        ControllerFlags::BLKIO => "blkio",
        ControllerFlags::FREEZER => "freezer",
        _ => unreachable!("not a v1 controller flag"),
    }
}

/// v2 controller names as listed in cgroup.controllers.
pub fn v2_controller_name(flag: ControllerFlags) -> &'static str {
    match flag {
        ControllerFlags::CPU_V2 => "cpu",
        ControllerFlags::MEMORY_V2 => "memory",
        ControllerFlags::IO_V2 => "io",
        ControllerFlags::CPUSET_V2 => "cpuset",
        ControllerFlags::PIDS_V2 => "pids",
        _ => unreachable!("not a v2 controller flag"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// The name of a job's cgroup subtree.
pub fn cgroup_name_of(job_id: JobId) -> String {
    format!("Crane_Task_{job_id}")
}

fn cgroup_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Crane_Task_(\d+)$").unwrap())
}

/// Parse a job id back out of a cgroup directory name.
pub fn job_id_from_cgroup_name(name: &str) -> Option<JobId> {
    cgroup_name_regex()
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify /proc/mounts content: (v1 mounts present, v2 mount present).
fn classify_mounts(mounts: &str) -> (bool, bool) {
    let mut has_v1 = false;
    let mut has_v2 = false;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _dev = fields.next();
        let _mountpoint = fields.next();
        match fields.next() {
            Some("cgroup") => has_v1 = true,
            Some("cgroup2") => has_v2 = true,
            _ => {}
        }
    }
    (has_v1, has_v2)
}

/// Parse /proc/cgroups: controllers with a non-zero hierarchy id are
/// mounted somewhere and usable under v1.
fn parse_proc_cgroups(content: &str) -> ControllerFlags {
    let mut mounted = ControllerFlags::empty();
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(hierarchy)) = (fields.next(), fields.next()) else {
            continue;
        };
        if hierarchy.parse::<u32>().map(|h| h != 0).unwrap_or(false) {
            mounted |= match name {
                "cpu" => ControllerFlags::CPU,
                "cpuacct" => ControllerFlags::CPUACCT,
                "memory" => ControllerFlags::MEMORY,
                "devices" => ControllerFlags::DEVICES,
                "blkio" => ControllerFlags::BLKIO,
                "freezer" => ControllerFlags::FREEZER,
                _ => ControllerFlags::empty(),
            };
        }
    }
    mounted
}

/// Parse the root cgroup.controllers listing of a v2 hierarchy.
pub(crate) fn parse_v2_controllers(content: &str) -> ControllerFlags {
    let mut mounted = ControllerFlags::empty();
    for name in content.split_whitespace() {
        mounted |= match name {
            "cpu" => ControllerFlags::CPU_V2,
            "memory" => ControllerFlags::MEMORY_V2,
            "io" => ControllerFlags::IO_V2,
            "cpuset" => ControllerFlags::CPUSET_V2,
            "pids" => ControllerFlags::PIDS_V2,
            _ => ControllerFlags::empty(),
        };
    }
    mounted
}

/// Per-job cgroup handle, dispatching on the host's cgroup generation.
pub enum CgroupHandle {
    V1(CgroupV1),
    V2(CgroupV2),
}

impl CgroupHandle {
    pub fn name(&self) -> &str {
        match self {
            CgroupHandle::V1(cg) => cg.name(),
            CgroupHandle::V2(cg) => cg.name(),
        }
    }

    pub fn set_cpu_core_limit(&self, core_num: f64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_cpu_core_limit(core_num),
            CgroupHandle::V2(cg) => cg.set_cpu_core_limit(core_num),
        }
    }

    pub fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_cpu_shares(shares),
            CgroupHandle::V2(cg) => cg.set_cpu_weight(shares),
        }
    }

    pub fn set_memory_limit_bytes(&self, bytes: u64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_memory_limit_bytes(bytes),
            CgroupHandle::V2(cg) => cg.set_memory_limit_bytes(bytes),
        }
    }

    /// Best effort: failures are logged by the caller, not propagated.
    pub fn set_memory_soft_limit_bytes(&self, bytes: u64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_memory_soft_limit_bytes(bytes),
            CgroupHandle::V2(cg) => cg.set_memory_high_bytes(bytes),
        }
    }

    /// Best effort: failures are logged by the caller, not propagated.
    pub fn set_memory_sw_limit_bytes(&self, bytes: u64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_memory_sw_limit_bytes(bytes),
            CgroupHandle::V2(cg) => cg.set_memory_swap_max_bytes(bytes),
        }
    }

    pub fn set_blockio_weight(&self, weight: u64) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.set_blockio_weight(weight),
            CgroupHandle::V2(cg) => cg.set_io_weight(weight),
        }
    }

    /// Deny access to every known device whose slot is not assigned to this
    /// job. Access bits are independently configurable.
    pub fn set_device_access(
        &mut self,
        devices: &DeviceMap,
        assigned: &HashSet<String>,
        set_read: bool,
        set_write: bool,
        set_mknod: bool,
    ) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => {
                cg.set_device_access(devices, assigned, set_read, set_write, set_mknod)
            }
            CgroupHandle::V2(cg) => {
                cg.set_device_access(devices, assigned, set_read, set_write, set_mknod)
            }
        }
    }

    /// Rebuild device bookkeeping for an adopted cgroup after an agent
    /// restart. The kernel-side state survived; only teardown records are
    /// reconstructed. No-op on v1, where `devices.deny` needs none.
    pub fn recover_device_entries(
        &mut self,
        devices: &DeviceMap,
        assigned: &HashSet<String>,
        set_read: bool,
        set_write: bool,
        set_mknod: bool,
    ) {
        if let CgroupHandle::V2(cg) = self {
            cg.recover_device_entries(devices, assigned, set_read, set_write, set_mknod);
        }
    }

    /// The cgroup.procs files a task pid must be written into.
    pub fn procs_paths(&self) -> Vec<PathBuf> {
        match self {
            CgroupHandle::V1(cg) => cg.procs_paths(),
            CgroupHandle::V2(cg) => cg.procs_paths(),
        }
    }

    pub fn migrate_proc_in(&self, pid: i32) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.migrate_proc_in(pid),
            CgroupHandle::V2(cg) => cg.migrate_proc_in(pid),
        }
    }

    pub fn kill_all_processes(&self) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.kill_all_processes(),
            CgroupHandle::V2(cg) => cg.kill_all_processes(),
        }
    }

    pub fn empty(&self) -> Result<bool> {
        match self {
            CgroupHandle::V1(cg) => cg.empty(),
            CgroupHandle::V2(cg) => cg.empty(),
        }
    }

    /// Tear the cgroup down. The subtree must be empty of tasks.
    pub fn destroy(self) -> Result<()> {
        match self {
            CgroupHandle::V1(cg) => cg.destroy(),
            CgroupHandle::V2(cg) => cg.destroy(),
        }
    }
}

/// Process-scoped driver: probes the host once, then creates, adopts, and
/// reconciles per-job cgroups.
pub struct CgroupDriver {
    version: CgroupVersion,
    mounted: ControllerFlags,
    root: PathBuf,
}

impl CgroupDriver {
    /// Probe the host's cgroup setup. Fails on hybrid hosts and on hosts
    /// missing the required controller set.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mounts = std::fs::read_to_string("/proc/mounts")
            .map_err(|e| CranedError::Cgroup(format!("cannot read /proc/mounts: {e}")))?;
        let (has_v1, has_v2) = classify_mounts(&mounts);

        let (version, mounted) = match (has_v1, has_v2) {
            (true, true) => {
                return Err(CranedError::Cgroup(
                    "hybrid cgroup setup is not supported".to_string(),
                ))
            }
            (true, false) => {
                let cgroups = std::fs::read_to_string("/proc/cgroups")
                    .map_err(|e| CranedError::Cgroup(format!("cannot read /proc/cgroups: {e}")))?;
                (CgroupVersion::V1, parse_proc_cgroups(&cgroups))
            }
            (false, true) => {
                let controllers = std::fs::read_to_string(root.join("cgroup.controllers"))
                    .map_err(|e| {
                        CranedError::Cgroup(format!("cannot read root cgroup.controllers: {e}"))
                    })?;
                (CgroupVersion::V2, parse_v2_controllers(&controllers))
            }
            (false, false) => {
                return Err(CranedError::Cgroup("no cgroup filesystem mounted".to_string()))
            }
        };

        let driver = CgroupDriver {
            version,
            mounted,
            root,
        };
        driver.warn_missing_controllers();
        driver.check_required_controllers()?;
        Ok(driver)
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn mounted(&self, controller: ControllerFlags) -> bool {
        self.mounted.contains(controller)
    }

    fn warn_missing_controllers(&self) {
        let all = match self.version {
            CgroupVersion::V1 => [
                ControllerFlags::CPU,
                ControllerFlags::CPUACCT,
                ControllerFlags::MEMORY,
                ControllerFlags::DEVICES,
                ControllerFlags::BLKIO,
                ControllerFlags::FREEZER,
            ]
            .as_slice(),
            CgroupVersion::V2 => [
                ControllerFlags::CPU_V2,
                ControllerFlags::MEMORY_V2,
                ControllerFlags::IO_V2,
                ControllerFlags::CPUSET_V2,
                ControllerFlags::PIDS_V2,
            ]
            .as_slice(),
        };
        for &flag in all {
            if !self.mounted.contains(flag) {
                let name = match self.version {
                    CgroupVersion::V1 => v1_controller_name(flag),
                    CgroupVersion::V2 => v2_controller_name(flag),
                };
                tracing::warn!(controller = name, "Cgroup controller is not available");
            }
        }
    }

    fn check_required_controllers(&self) -> Result<()> {
        let required = match self.version {
            CgroupVersion::V1 => V1_REQUIRED_CONTROLLERS,
            CgroupVersion::V2 => V2_REQUIRED_CONTROLLERS,
        };
        if !self.mounted.contains(required) {
            return Err(CranedError::Cgroup(format!(
                "required cgroup controllers missing: have {:?}, need {:?}",
                self.mounted, required
            )));
        }
        Ok(())
    }

    /// Create the job's cgroup, or adopt an existing one when `recover` is
    /// set. Failure to enable a required controller is an error; failure on
    /// a non-required one only warns.
    pub fn create_or_open(
        &self,
        job_id: JobId,
        preferred: ControllerFlags,
        required: ControllerFlags,
        recover: bool,
    ) -> Result<CgroupHandle> {
        let name = cgroup_name_of(job_id);
        // Required controllers are always preferred.
        let preferred = preferred | required;

        match self.version {
            CgroupVersion::V1 => {
                let cg = CgroupV1::create_or_open(
                    &self.root,
                    &name,
                    preferred & self.mounted,
                    required,
                    self.mounted,
                    recover,
                )?;
                Ok(CgroupHandle::V1(cg))
            }
            CgroupVersion::V2 => {
                let cg = CgroupV2::create_or_open(
                    &self.root,
                    &name,
                    preferred & self.mounted,
                    required,
                    self.mounted,
                    recover,
                )?;
                Ok(CgroupHandle::V2(cg))
            }
        }
    }

    /// Remove every job cgroup whose id is not in `running_jobs`, left over
    /// from a previous agent incarnation. On v2 this also garbage-collects
    /// device-map entries referencing unknown cgroup inodes.
    pub fn reconcile(&self, running_jobs: &HashSet<JobId>) -> Result<()> {
        match self.version {
            CgroupVersion::V1 => {
                for flag in [
                    ControllerFlags::CPU,
                    ControllerFlags::MEMORY,
                    ControllerFlags::DEVICES,
                    ControllerFlags::BLKIO,
                    ControllerFlags::FREEZER,
                ] {
                    if !self.mounted.contains(flag) {
                        continue;
                    }
                    let controller_root = self.root.join(v1_controller_name(flag));
                    remove_stale_job_dirs(&controller_root, running_jobs);
                }
            }
            CgroupVersion::V2 => {
                remove_stale_job_dirs(&self.root, running_jobs);

                let kept_inodes: HashSet<u64> = self
                    .job_cgroup_inodes()?
                    .into_iter()
                    .filter(|(job_id, _)| running_jobs.contains(job_id))
                    .map(|(_, ino)| ino)
                    .collect();
                bpf::gc_unknown_cgroups(&kept_inodes);
            }
        }
        Ok(())
    }

    /// Map job id to cgroup directory inode for every live v2 job cgroup.
    pub fn job_cgroup_inodes(&self) -> Result<Vec<(JobId, u64)>> {
        let mut result = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(CranedError::Cgroup(format!(
                    "cannot read cgroup root {}: {e}",
                    self.root.display()
                )))
            }
        };
        for entry in entries.flatten() {
            let Some(job_id) = entry
                .file_name()
                .to_str()
                .and_then(job_id_from_cgroup_name)
            else {
                continue;
            };
            if let Ok(meta) = entry.metadata() {
                result.push((job_id, std::os::unix::fs::MetadataExt::ino(&meta)));
            }
        }
        Ok(result)
    }
}

/// Remove every `Crane_Task_<id>` directory under `dir` whose id is not in
/// the kept set.
fn remove_stale_job_dirs(dir: &Path, kept: &HashSet<JobId>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot scan cgroup directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let Some(job_id) = entry
            .file_name()
            .to_str()
            .and_then(job_id_from_cgroup_name)
        else {
            continue;
        };
        if kept.contains(&job_id) {
            tracing::trace!(job_id, path = %entry.path().display(), "Keeping running job cgroup");
            continue;
        }
        tracing::debug!(job_id, path = %entry.path().display(), "Removing stale job cgroup");
        if let Err(e) = std::fs::remove_dir(entry.path()) {
            tracing::error!(path = %entry.path().display(), error = %e, "Failed to remove cgroup");
        }
    }
}

/// Partition the discovered job ids into (kept, removed) against the
/// running set. Factored out of `reconcile` for direct verification.
pub fn reconcile_partitions(
    discovered: &[JobId],
    running: &HashSet<JobId>,
) -> (Vec<JobId>, Vec<JobId>) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for &job_id in discovered {
        if running.contains(&job_id) {
            kept.push(job_id);
        } else {
            removed.push(job_id);
        }
    }
    (kept, removed)
}

/// Write a value to a cgroup interface file, retrying on EINTR up to three
/// attempts.
pub(crate) fn write_cgroup_file(path: &Path, value: &str) -> Result<()> {
    let mut attempts = 0;
    loop {
        match std::fs::write(path, value) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted && attempts < 3 => {
                attempts += 1;
                tracing::debug!(path = %path.display(), "Cgroup write interrupted. Retrying...");
            }
            Err(e) => {
                return Err(CranedError::Cgroup(format!(
                    "cannot write {value:?} to {}: {e}",
                    path.display()
                )))
            }
        }
    }
}

/// Read the pid list of a cgroup subtree.
pub(crate) fn read_cgroup_procs(path: &Path) -> Result<Vec<i32>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CranedError::Cgroup(format!("cannot read {}: {e}", path.display())))?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// CPU bandwidth base: quota = round(core_num * base) over a period of
/// `base` microseconds.
pub const CPU_PERIOD_BASE: u64 = 1 << 16;

pub(crate) fn cpu_quota_of(core_num: f64) -> u64 {
    (core_num * CPU_PERIOD_BASE as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_name_round_trip() {
        assert_eq!(cgroup_name_of(7), "Crane_Task_7");
        assert_eq!(job_id_from_cgroup_name("Crane_Task_7"), Some(7));
        assert_eq!(job_id_from_cgroup_name("Crane_Task_123456"), Some(123456));
        assert_eq!(job_id_from_cgroup_name("Crane_Task_"), None);
        assert_eq!(job_id_from_cgroup_name("Crane_Task_7x"), None);
        assert_eq!(job_id_from_cgroup_name("system.slice"), None);
    }

    #[test]
    fn mount_classification() {
        let v1 = "cgroup /sys/fs/cgroup/cpu cgroup rw,cpu 0 0\n\
                  cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0\n";
        assert_eq!(classify_mounts(v1), (true, false));

        let v2 = "cgroup2 /sys/fs/cgroup cgroup2 rw 0 0\n";
        assert_eq!(classify_mounts(v2), (false, true));

        let hybrid = format!("{v1}{v2}");
        assert_eq!(classify_mounts(&hybrid), (true, true));

        assert_eq!(classify_mounts("proc /proc proc rw 0 0\n"), (false, false));
    }

    #[test]
    fn proc_cgroups_nonzero_hierarchy() {
        let content = "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
                       cpu\t3\t10\t1\n\
                       memory\t0\t1\t1\n\
                       devices\t5\t10\t1\n";
        let mounted = parse_proc_cgroups(content);
        assert!(mounted.contains(ControllerFlags::CPU));
        assert!(mounted.contains(ControllerFlags::DEVICES));
        assert!(!mounted.contains(ControllerFlags::MEMORY));
    }

    #[test]
    fn v2_controller_listing() {
        let mounted = parse_v2_controllers("cpuset cpu io memory pids");
        assert!(mounted.contains(V2_REQUIRED_CONTROLLERS));
        assert!(mounted.contains(ControllerFlags::PIDS_V2));

        let partial = parse_v2_controllers("cpu memory");
        assert!(!partial.contains(V2_REQUIRED_CONTROLLERS));
    }

    #[test]
    fn cpu_quota_rounding() {
        assert_eq!(cpu_quota_of(0.5), 32768);
        assert_eq!(cpu_quota_of(1.0), 65536);
        assert_eq!(cpu_quota_of(2.0), 131072);
        // Round-trip error below one core-fraction unit.
        let f = 0.3;
        let quota = cpu_quota_of(f);
        let effective = quota as f64 / CPU_PERIOD_BASE as f64;
        assert!((effective - f).abs() * (CPU_PERIOD_BASE as f64) < 1.0);
    }

    #[test]
    fn reconcile_partition_is_idempotent() {
        let discovered = vec![1, 2, 3, 4];
        let running: HashSet<JobId> = [2, 4].into();
        let (kept, removed) = reconcile_partitions(&discovered, &running);
        assert_eq!(kept, vec![2, 4]);
        assert_eq!(removed, vec![1, 3]);

        // Running it again over the kept set removes nothing further.
        let (kept2, removed2) = reconcile_partitions(&kept, &running);
        assert_eq!(kept2, kept);
        assert!(removed2.is_empty());
    }
}

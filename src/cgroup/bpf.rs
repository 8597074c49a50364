//! Device-access program host for the unified cgroup hierarchy.
//!
//! One compiled BPF object with one device-permission map exists at process
//! scope. Each v2 job cgroup holds a reference; the filter program is
//! attached per cgroup with the device-cgroup hook and consults the map
//! keyed by `(cgroup inode, major, minor)`. No entry means access is
//! allowed.

use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::sync::Mutex;

use libbpf_rs::{Link, MapCore as _, MapFlags, Object, ObjectBuilder};

use crate::error::{CranedError, Result};

pub const BPF_OBJECT_FILE_PATH: &str = "/usr/lib/craned/crane_dev_filter.bpf.o";
pub const BPF_PROGRAM_NAME: &str = "crane_device_filter";
pub const BPF_MAP_NAME: &str = "craned_dev_map";
/// The map is pinned here so entries survive agent restarts.
pub const BPF_DEVICE_MAP_FILE_PATH: &str = "/sys/fs/bpf/craned_dev_map";

// Access and device-type bits, as defined by the kernel device-cgroup hook.
pub const BPF_DEVCG_ACC_MKNOD: u16 = 1;
pub const BPF_DEVCG_ACC_READ: u16 = 2;
pub const BPF_DEVCG_ACC_WRITE: u16 = 4;
pub const BPF_DEVCG_DEV_BLOCK: u16 = 1;
pub const BPF_DEVCG_DEV_CHAR: u16 = 2;
pub const BPF_DEV_TYPE_ANY: u16 = 0xffff;

pub const BPF_PERMISSION_DENY: u32 = 1;

/// Map key: which device inside which cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BpfKey {
    pub cgroup_id: u64,
    pub major: u32,
    pub minor: u32,
}

impl BpfKey {
    /// The zero key is reserved for the logging sentinel row.
    pub const LOGGING: BpfKey = BpfKey {
        cgroup_id: 0,
        major: 0,
        minor: 0,
    };

    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.cgroup_id.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.major.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.minor.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != 16 {
            return None;
        }
        Some(BpfKey {
            cgroup_id: u64::from_ne_bytes(buf[0..8].try_into().ok()?),
            major: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
            minor: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
        })
    }
}

/// Map value: the permission decision for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfDeviceMeta {
    pub major: u32,
    pub minor: u32,
    pub permission: u32,
    pub access: u16,
    pub dev_type: u16,
}

impl BpfDeviceMeta {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.major.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.minor.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.permission.to_ne_bytes());
        buf[12..14].copy_from_slice(&self.access.to_ne_bytes());
        buf[14..16].copy_from_slice(&self.dev_type.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != 16 {
            return None;
        }
        Some(BpfDeviceMeta {
            major: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            minor: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
            permission: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
            access: u16::from_ne_bytes(buf[12..14].try_into().ok()?),
            dev_type: u16::from_ne_bytes(buf[14..16].try_into().ok()?),
        })
    }
}

struct HostState {
    obj: Object,
    cgroup_count: u32,
}

// `libbpf_rs::Object` wraps a `NonNull<bpf_object>` and so is not `Send` by
// default, but the underlying libbpf handle carries no thread affinity —
// all access is already serialized through `STATE`'s mutex.
unsafe impl Send for HostState {}

static STATE: Mutex<Option<HostState>> = Mutex::new(None);
static VERBOSE_LOGGING: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Enable verbose in-kernel traces. Takes effect for hosts loaded
/// afterwards; the flag is carried by the zero-key sentinel row.
pub fn set_logging(enabled: bool) {
    VERBOSE_LOGGING.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

fn load_object() -> Result<Object> {
    let open_obj = ObjectBuilder::default()
        .open_file(BPF_OBJECT_FILE_PATH)
        .map_err(|e| {
            CranedError::Cgroup(format!(
                "failed to open BPF object file {BPF_OBJECT_FILE_PATH}: {e}"
            ))
        })?;
    let obj = open_obj
        .load()
        .map_err(|e| CranedError::Cgroup(format!("failed to load BPF object: {e}")))?;

    // Sanity-check program and map presence up front.
    if !obj
        .progs()
        .any(|p| p.name().to_str() == Some(BPF_PROGRAM_NAME))
    {
        return Err(CranedError::Cgroup(format!(
            "BPF program {BPF_PROGRAM_NAME} not found in object"
        )));
    }
    if !obj.maps().any(|m| m.name().to_str() == Some(BPF_MAP_NAME)) {
        return Err(CranedError::Cgroup(format!(
            "BPF map {BPF_MAP_NAME} not found in object"
        )));
    }

    // Seed the logging sentinel row.
    let logging = VERBOSE_LOGGING.load(std::sync::atomic::Ordering::Relaxed);
    let meta = BpfDeviceMeta {
        major: logging as u32,
        minor: 0,
        permission: 0,
        access: 0,
        dev_type: 0,
    };
    update_in(&obj, BpfKey::LOGGING, meta)?;

    Ok(obj)
}

fn update_in(obj: &Object, key: BpfKey, meta: BpfDeviceMeta) -> Result<()> {
    let map = obj
        .maps()
        .find(|m| m.name().to_str() == Some(BPF_MAP_NAME))
        .ok_or_else(|| CranedError::Cgroup(format!("BPF map {BPF_MAP_NAME} disappeared")))?;
    map.update(&key.to_bytes(), &meta.to_bytes(), MapFlags::ANY)
        .map_err(|e| {
            CranedError::Cgroup(format!(
                "failed to update BPF map entry {}:{} in cgroup {}: {e}",
                key.major, key.minor, key.cgroup_id
            ))
        })
}

fn delete_in(obj: &Object, key: BpfKey) -> Result<()> {
    let map = obj
        .maps()
        .find(|m| m.name().to_str() == Some(BPF_MAP_NAME))
        .ok_or_else(|| CranedError::Cgroup(format!("BPF map {BPF_MAP_NAME} disappeared")))?;
    map.delete(&key.to_bytes()).map_err(|e| {
        CranedError::Cgroup(format!(
            "failed to delete BPF map entry {}:{} in cgroup {}: {e}",
            key.major, key.minor, key.cgroup_id
        ))
    })
}

fn keys_in(obj: &Object) -> Vec<BpfKey> {
    let Some(map) = obj
        .maps()
        .find(|m| m.name().to_str() == Some(BPF_MAP_NAME))
    else {
        return Vec::new();
    };
    map.keys().filter_map(|k| BpfKey::from_bytes(&k)).collect()
}

/// Take a reference on the process-scoped BPF runtime, loading it on first
/// use.
pub fn acquire() -> Result<()> {
    let mut state = STATE.lock().unwrap();
    match state.as_mut() {
        Some(host) => {
            host.cgroup_count += 1;
            Ok(())
        }
        None => {
            let obj = load_object()?;
            *state = Some(HostState {
                obj,
                cgroup_count: 1,
            });
            tracing::debug!("BPF device filter loaded");
            Ok(())
        }
    }
}

/// Drop a reference. When the last cgroup is gone and only the sentinel row
/// remains, the runtime is unloaded and the pinned map file removed.
pub fn release() {
    let mut state = STATE.lock().unwrap();
    let Some(host) = state.as_mut() else {
        return;
    };
    host.cgroup_count = host.cgroup_count.saturating_sub(1);
    if host.cgroup_count > 0 {
        return;
    }

    let only_sentinel = keys_in(&host.obj)
        .iter()
        .all(|k| *k == BpfKey::LOGGING);
    *state = None;
    if only_sentinel {
        match std::fs::remove_file(BPF_DEVICE_MAP_FILE_PATH) {
            Ok(()) => tracing::trace!(path = BPF_DEVICE_MAP_FILE_PATH, "Removed device map file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                path = BPF_DEVICE_MAP_FILE_PATH,
                error = %e,
                "Failed to remove device map file"
            ),
        }
    }
}

/// Insert deny entries for one cgroup. Serialized by the host mutex.
pub fn update_entries(cgroup_id: u64, metas: &[BpfDeviceMeta]) -> Result<()> {
    let state = STATE.lock().unwrap();
    let host = state
        .as_ref()
        .ok_or_else(|| CranedError::Cgroup("BPF runtime is not initialized".to_string()))?;
    for meta in metas {
        let key = BpfKey {
            cgroup_id,
            major: meta.major,
            minor: meta.minor,
        };
        update_in(&host.obj, key, *meta)?;
    }
    Ok(())
}

/// Delete one cgroup's entries when it is torn down.
pub fn delete_entries(cgroup_id: u64, metas: &[BpfDeviceMeta]) -> Result<()> {
    let state = STATE.lock().unwrap();
    let host = state
        .as_ref()
        .ok_or_else(|| CranedError::Cgroup("BPF runtime is not initialized".to_string()))?;
    for meta in metas {
        let key = BpfKey {
            cgroup_id,
            major: meta.major,
            minor: meta.minor,
        };
        delete_in(&host.obj, key)?;
    }
    Ok(())
}

/// Attach the filter program to a cgroup directory fd with the
/// device-cgroup hook. The returned link must be held for the cgroup's
/// lifetime.
pub fn attach(cgroup_fd: RawFd) -> Result<Link> {
    let mut state = STATE.lock().unwrap();
    let host = state
        .as_mut()
        .ok_or_else(|| CranedError::Cgroup("BPF runtime is not initialized".to_string()))?;
    let mut prog = host
        .obj
        .progs_mut()
        .find(|p| p.name().to_str() == Some(BPF_PROGRAM_NAME))
        .ok_or_else(|| {
            CranedError::Cgroup(format!("BPF program {BPF_PROGRAM_NAME} disappeared"))
        })?;
    prog.attach_cgroup(cgroup_fd)
        .map_err(|e| CranedError::Cgroup(format!("failed to attach BPF program: {e}")))
}

/// Remove every map entry whose cgroup inode is not in the kept set. Runs
/// at startup reconciliation; loads the runtime temporarily if no cgroup
/// holds it yet.
pub fn gc_unknown_cgroups(kept_inodes: &HashSet<u64>) {
    let mut state = STATE.lock().unwrap();
    let temporary = state.is_none();
    if temporary {
        match load_object() {
            Ok(obj) => {
                *state = Some(HostState {
                    obj,
                    cgroup_count: 0,
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "BPF runtime unavailable. Skipping device map GC");
                return;
            }
        }
    }

    let host = state.as_ref().unwrap();
    let mut per_cgroup: HashMap<u64, Vec<BpfKey>> = HashMap::new();
    for key in keys_in(&host.obj) {
        if key == BpfKey::LOGGING {
            continue;
        }
        per_cgroup.entry(key.cgroup_id).or_default().push(key);
    }

    for (cgroup_id, keys) in per_cgroup {
        if kept_inodes.contains(&cgroup_id) {
            continue;
        }
        tracing::debug!(cgroup_id, "Erasing device map entries for stale cgroup");
        for key in keys {
            if let Err(e) = delete_in(&host.obj, key) {
                tracing::error!(
                    major = key.major,
                    minor = key.minor,
                    cgroup_id = key.cgroup_id,
                    error = %e,
                    "Failed to delete device map entry"
                );
            }
        }
    }

    if temporary {
        *state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bytes_round_trip() {
        let key = BpfKey {
            cgroup_id: 0x1122334455667788,
            major: 195,
            minor: 1,
        };
        assert_eq!(BpfKey::from_bytes(&key.to_bytes()), Some(key));
        assert!(BpfKey::from_bytes(&[0u8; 8]).is_none());
    }

    #[test]
    fn meta_bytes_round_trip() {
        let meta = BpfDeviceMeta {
            major: 195,
            minor: 1,
            permission: BPF_PERMISSION_DENY,
            access: BPF_DEVCG_ACC_READ | BPF_DEVCG_ACC_WRITE | BPF_DEVCG_ACC_MKNOD,
            dev_type: BPF_DEVCG_DEV_CHAR,
        };
        assert_eq!(BpfDeviceMeta::from_bytes(&meta.to_bytes()), Some(meta));
    }

    #[test]
    fn logging_key_is_zero() {
        assert_eq!(BpfKey::LOGGING.to_bytes(), [0u8; 16]);
    }
}

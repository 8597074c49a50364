use std::collections::{HashMap, HashSet};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::config::GresConfig;
use crate::error::{CranedError, Result};

/// Stable identifier for a dedicated device: its device file path.
pub type SlotId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
    Other,
}

impl DeviceKind {
    /// The type letter used in cgroup v1 `devices.deny` lines.
    pub fn as_char(self) -> char {
        match self {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
            DeviceKind::Other => 'a',
        }
    }
}

/// Variables a device contributes to the environment of a task it is
/// assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvInjector {
    None,
    Nvidia,
    Hip,
    Ascend,
}

impl EnvInjector {
    pub fn from_config(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("") | Some("none") => Ok(EnvInjector::None),
            Some("nvidia") => Ok(EnvInjector::Nvidia),
            Some("hip") => Ok(EnvInjector::Hip),
            Some("ascend") => Ok(EnvInjector::Ascend),
            Some(other) => Err(CranedError::Config(format!(
                "invalid EnvInjector type: {other}"
            ))),
        }
    }
}

/// One device file known to this node.
#[derive(Debug, Clone)]
pub struct Device {
    pub slot_id: SlotId,
    pub name: String,
    pub gres_type: String,
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
    pub env_injector: EnvInjector,
}

impl Device {
    fn from_path(
        name: &str,
        gres_type: &str,
        path: &str,
        env_injector: EnvInjector,
    ) -> Result<Self> {
        let meta = std::fs::metadata(Path::new(path))
            .map_err(|e| CranedError::Config(format!("cannot access device {path}: {e}")))?;

        let file_type = meta.file_type();
        let kind = if file_type.is_char_device() {
            DeviceKind::Char
        } else if file_type.is_block_device() {
            DeviceKind::Block
        } else {
            DeviceKind::Other
        };

        let rdev = std::os::unix::fs::MetadataExt::rdev(&meta);
        Ok(Device {
            slot_id: path.to_string(),
            name: name.to_string(),
            gres_type: gres_type.to_string(),
            kind,
            major: libc::major(rdev) as u32,
            minor: libc::minor(rdev) as u32,
            env_injector,
        })
    }
}

/// All devices of this node, keyed by slot id. Built once at startup from
/// the config's gres section.
#[derive(Debug, Default)]
pub struct DeviceMap {
    devices: HashMap<SlotId, Device>,
}

impl DeviceMap {
    pub fn from_config(gres: &[GresConfig]) -> Result<Self> {
        let mut devices = HashMap::new();
        for entry in gres {
            let injector = EnvInjector::from_config(entry.env_injector.as_deref())?;
            for path in &entry.device_files {
                let dev = Device::from_path(&entry.name, &entry.gres_type, path, injector)?;
                tracing::debug!(
                    slot = %dev.slot_id,
                    major = dev.major,
                    minor = dev.minor,
                    kind = ?dev.kind,
                    "Registered node device"
                );
                devices.insert(dev.slot_id.clone(), dev);
            }
        }
        Ok(DeviceMap { devices })
    }

    /// Build a map from already-constructed devices. Config-driven startup
    /// uses [`DeviceMap::from_config`]; this constructor serves callers
    /// that enumerate devices another way.
    pub fn from_devices(devices: Vec<Device>) -> Self {
        DeviceMap {
            devices: devices.into_iter().map(|d| (d.slot_id.clone(), d)).collect(),
        }
    }

    pub fn get(&self, slot_id: &str) -> Option<&Device> {
        self.devices.get(slot_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Every known device whose slot is NOT in the assigned set. Access to
    /// these is denied inside the job's cgroup.
    pub fn denied_devices(&self, assigned: &HashSet<SlotId>) -> Vec<&Device> {
        let mut denied: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| !assigned.contains(&d.slot_id))
            .collect();
        denied.sort_by(|a, b| a.slot_id.cmp(&b.slot_id));
        denied
    }

    /// Environment variables contributed by the assigned devices, e.g. the
    /// device index lists exposed to CUDA/HIP runtimes.
    pub fn env_for_assigned(&self, assigned: &HashSet<SlotId>) -> HashMap<String, String> {
        let mut by_injector: HashMap<&'static str, Vec<u32>> = HashMap::new();
        for slot in assigned {
            let Some(dev) = self.devices.get(slot) else {
                continue;
            };
            let var = match dev.env_injector {
                EnvInjector::None => continue,
                EnvInjector::Nvidia => "CUDA_VISIBLE_DEVICES",
                EnvInjector::Hip => "HIP_VISIBLE_DEVICES",
                EnvInjector::Ascend => "ASCEND_RT_VISIBLE_DEVICES",
            };
            by_injector.entry(var).or_default().push(dev.minor);
        }

        by_injector
            .into_iter()
            .map(|(var, mut minors)| {
                minors.sort_unstable();
                let list = minors
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                (var.to_string(), list)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(slot: &str, major: u32, minor: u32, injector: EnvInjector) -> Device {
        Device {
            slot_id: slot.to_string(),
            name: "gpu".to_string(),
            gres_type: "a100".to_string(),
            kind: DeviceKind::Char,
            major,
            minor,
            env_injector: injector,
        }
    }

    #[test]
    fn denied_devices_excludes_assigned_slots() {
        let map = DeviceMap::from_devices(vec![
            dev("/dev/nvidia0", 195, 0, EnvInjector::Nvidia),
            dev("/dev/nvidia1", 195, 1, EnvInjector::Nvidia),
        ]);

        let assigned: HashSet<SlotId> = ["/dev/nvidia0".to_string()].into();
        let denied = map.denied_devices(&assigned);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].slot_id, "/dev/nvidia1");
        assert_eq!((denied[0].major, denied[0].minor), (195, 1));
    }

    #[test]
    fn empty_assignment_denies_everything() {
        let map = DeviceMap::from_devices(vec![
            dev("/dev/nvidia0", 195, 0, EnvInjector::Nvidia),
            dev("/dev/nvidia1", 195, 1, EnvInjector::Nvidia),
        ]);
        assert_eq!(map.denied_devices(&HashSet::new()).len(), 2);
    }

    #[test]
    fn injector_env_lists_assigned_minors() {
        let map = DeviceMap::from_devices(vec![
            dev("/dev/nvidia0", 195, 0, EnvInjector::Nvidia),
            dev("/dev/nvidia1", 195, 1, EnvInjector::Nvidia),
        ]);

        let assigned: HashSet<SlotId> =
            ["/dev/nvidia0".to_string(), "/dev/nvidia1".to_string()].into();
        let env = map.env_for_assigned(&assigned);
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0,1");
    }
}

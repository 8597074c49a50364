use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CranedError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/crane/craned.yaml";
pub const DEFAULT_CRANE_BASE_DIR: &str = "/var/crane";
pub const DEFAULT_CRANED_PORT: u16 = 10010;
pub const DEFAULT_CTLD_PORT: u16 = 10011;
pub const DEFAULT_CFORED_PORT: u16 = 10012;

const DEFAULT_SCRIPT_DIR: &str = "cranedscript";
const DEFAULT_LOG_FILE: &str = "craned.log";
const DEFAULT_MUTEX_FILE: &str = "craned.lock";
const DEFAULT_UNIX_SOCK: &str = "craned.sock";

/// One dedicated device declared for a node in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct GresConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub gres_type: String,
    #[serde(rename = "DeviceFileList", default)]
    pub device_files: Vec<String>,
    #[serde(rename = "EnvInjector", default)]
    pub env_injector: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub cpu: u32,
    pub memory: String,
    #[serde(default)]
    pub gres: Vec<GresConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PluginConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Raw on-disk layout of craned.yaml.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    crane_base_dir: Option<PathBuf>,
    craned_log_file: Option<PathBuf>,
    craned_script_dir: Option<PathBuf>,
    craned_mutex_file_path: Option<PathBuf>,
    craned_unix_sock_path: Option<PathBuf>,
    craned_listen: Option<String>,
    craned_listen_port: Option<u16>,
    control_machine: Option<String>,
    crane_ctld_listen_port: Option<u16>,
    craned_debug_level: Option<String>,
    #[serde(default)]
    nodes: Vec<NodeConfig>,
    #[serde(default)]
    plugin: PluginConfig,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct CranedConfig {
    pub crane_base_dir: PathBuf,
    pub craned_log_file: PathBuf,
    pub craned_script_dir: PathBuf,
    pub craned_mutex_file_path: PathBuf,
    pub craned_unix_sock_path: PathBuf,

    pub listen_addr: String,
    pub listen_port: u16,
    pub control_machine: String,
    pub ctld_port: u16,
    pub debug_level: String,

    /// This node's identity, equal to its hostname.
    pub craned_id: String,

    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub gres: Vec<GresConfig>,

    pub plugin: PluginConfig,
}

impl CranedConfig {
    /// Load the YAML config file and resolve it for this host. The node
    /// table must contain the local hostname.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CranedError::Config(format!("cannot open config file {}: {e}", path.display()))
        })?;
        let raw: RawConfig = serde_yaml::from_str(&content)
            .map_err(|e| CranedError::Config(format!("malformed config file: {e}")))?;

        let hostname = nix::unistd::gethostname()
            .map_err(|e| CranedError::Config(format!("cannot read hostname: {e}")))?
            .to_string_lossy()
            .into_owned();

        let node = raw
            .nodes
            .iter()
            .find(|n| n.name == hostname)
            .ok_or_else(|| {
                CranedError::Config(format!("this machine {hostname} is not contained in Nodes"))
            })?
            .clone();

        let base = raw
            .crane_base_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CRANE_BASE_DIR));

        let under_base = |configured: Option<PathBuf>, default: &str| match configured {
            Some(p) if p.is_absolute() => p,
            Some(p) => base.join(p),
            None => base.join(default),
        };

        Ok(CranedConfig {
            craned_log_file: under_base(raw.craned_log_file, DEFAULT_LOG_FILE),
            craned_script_dir: under_base(raw.craned_script_dir, DEFAULT_SCRIPT_DIR),
            craned_mutex_file_path: under_base(raw.craned_mutex_file_path, DEFAULT_MUTEX_FILE),
            craned_unix_sock_path: under_base(raw.craned_unix_sock_path, DEFAULT_UNIX_SOCK),
            crane_base_dir: base,
            listen_addr: raw.craned_listen.unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port: raw.craned_listen_port.unwrap_or(DEFAULT_CRANED_PORT),
            control_machine: raw.control_machine.unwrap_or_default(),
            ctld_port: raw.crane_ctld_listen_port.unwrap_or(DEFAULT_CTLD_PORT),
            debug_level: raw.craned_debug_level.unwrap_or_else(|| "info".to_string()),
            craned_id: hostname,
            cpu_count: node.cpu,
            memory_bytes: parse_memory(&node.memory)?,
            gres: node.gres,
            plugin: raw.plugin,
        })
    }

    /// Per-job supervisor control socket path.
    pub fn supervisor_sock_path(&self, job_id: u32) -> PathBuf {
        self.crane_base_dir.join(format!("task_{job_id}.sock"))
    }

    /// Per-job script file path.
    pub fn script_path(&self, job_id: u32) -> PathBuf {
        self.craned_script_dir.join(format!("Crane-{job_id}.sh"))
    }
}

/// Parse a memory size like `128M` or `32G` into bytes.
pub fn parse_memory(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CranedError::Config(format!("illegal memory format: {s}")))?;
    let multiplier = match suffix {
        "" | "B" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        _ => return Err(CranedError::Config(format!("illegal memory format: {s}"))),
    };
    Ok(value * multiplier)
}

/// Configuration of one supervisor process, handed over on its command line
/// by the agent at spawn time.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub job_id: u32,
    pub craned_id: String,
    pub crane_base_dir: PathBuf,
    pub craned_script_dir: PathBuf,
    pub craned_unix_sock_path: PathBuf,
    /// The cgroup.procs files the task pid is attached to: one per
    /// controller hierarchy on v1, a single one on v2.
    pub cgroup_procs_paths: Vec<PathBuf>,
    pub debug_level: String,
    pub log_file: PathBuf,
    /// Environment variables contributed by assigned devices.
    pub device_env: HashMap<String, String>,
    /// Job memory cap, surfaced to the task as CRANE_MEM_PER_NODE.
    pub memory_limit_bytes: u64,
}

impl SupervisorConfig {
    pub fn supervisor_sock_path(&self) -> PathBuf {
        self.crane_base_dir.join(format!("task_{}.sock", self.job_id))
    }

    pub fn script_path(&self) -> PathBuf {
        self.craned_script_dir.join(format!("Crane-{}.sh", self.job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("4K").unwrap(), 4096);
        assert_eq!(parse_memory("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory("12T").is_err());
        assert!(parse_memory("abc").is_err());
    }
}

//! Resolve a local TCP port to the process that owns it.
//!
//! Backs `QueryTaskIdFromPort`: the ssh daemon asks which job an inbound
//! connection belongs to so the session can be placed into that job's
//! cgroup. Port to socket inode via `/proc/net/tcp{,6}`, inode to pid via
//! the fd tables under `/proc`.

use std::path::Path;

/// Find the inode of a listening or established socket bound to
/// `local_port`.
fn socket_inode_of_port(table: &str, local_port: u16) -> Option<u64> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // sl local_address rem_address st ... inode
        if fields.len() < 10 {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        if port != local_port {
            continue;
        }
        if let Ok(inode) = fields[9].parse() {
            return Some(inode);
        }
    }
    None
}

fn pid_of_socket_inode(inode: u64) -> Option<i32> {
    let target = format!("socket:[{inode}]");
    let proc_entries = std::fs::read_dir("/proc").ok()?;
    for proc_entry in proc_entries.flatten() {
        let Some(pid) = proc_entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let fd_dir = Path::new("/proc").join(pid.to_string()).join("fd");
        let Ok(fd_entries) = std::fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd_entry in fd_entries.flatten() {
            if let Ok(link) = std::fs::read_link(fd_entry.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// Resolve a local port to the pid owning the socket, consulting both the
/// IPv4 and IPv6 tables.
pub fn pid_of_local_port(local_port: u16) -> Option<i32> {
    for table_path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(table) = std::fs::read_to_string(table_path) else {
            continue;
        };
        if let Some(inode) = socket_inode_of_port(&table, local_port) {
            if let Some(pid) = pid_of_socket_inode(inode) {
                return Some(pid);
            }
        }
    }
    None
}

/// Resolve a pid to the job whose cgroup contains it, walking up the
/// parent chain: the socket owner is usually a descendant (or the sshd
/// ancestor) of the process actually placed in the job cgroup.
pub fn job_id_of_pid(pid: i32) -> Option<u32> {
    let mut current = pid;
    for _ in 0..32 {
        if let Some(job_id) = job_id_of_pid_cgroup(current) {
            return Some(job_id);
        }
        current = parent_pid(current)?;
        if current <= 1 {
            return None;
        }
    }
    None
}

fn job_id_of_pid_cgroup(pid: i32) -> Option<u32> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/cgroup")).ok()?;
    content
        .lines()
        .flat_map(|line| line.split('/'))
        .find_map(crate::cgroup::job_id_from_cgroup_name)
}

fn parent_pid(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; the ppid is the second field after the
    // closing paren.
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 34713 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 20001 1 0000000000000000 100 0 0 10 0";

    #[test]
    fn port_to_inode() {
        // 0x1F90 = 8080, 0x16 = 22
        assert_eq!(socket_inode_of_port(TCP_TABLE, 8080), Some(34713));
        assert_eq!(socket_inode_of_port(TCP_TABLE, 22), Some(20001));
        assert_eq!(socket_inode_of_port(TCP_TABLE, 1234), None);
    }
}

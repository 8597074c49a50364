use std::path::Path;

use crate::error::{CranedError, Result};

/// Resolve a stdout/stderr path pattern against the task's working
/// directory.
///
/// - empty pattern: `<cwd>/Crane-<job_id>.out`
/// - relative pattern: prefixed with `<cwd>/`
/// - absolute pattern: used as-is
/// - trailing `/`: `Crane-<job_id>.out` is appended
pub fn parse_file_path_pattern(pattern: &str, cwd: &str, job_id: u32) -> String {
    let mut resolved = if pattern.is_empty() {
        format!("{cwd}/")
    } else if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("{cwd}/{pattern}")
    };

    if resolved.ends_with('/') {
        resolved.push_str(&format!("Crane-{job_id}.out"));
    }

    resolved
}

/// Apply `%j` (job id), `%u` (username), `%x` (job name) substitutions.
pub fn substitute_path_tokens(path: &str, job_id: u32, username: &str, job_name: &str) -> String {
    path.replace("%j", &job_id.to_string())
        .replace("%u", username)
        .replace("%x", job_name)
}

/// Format a time limit as `HH:MM:SS` for CRANE_TIMELIMIT.
pub fn format_time_limit(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Close every file descriptor from `lowest` up. Called in the forked child
/// before execv so the user program inherits only its stdio.
pub fn close_fd_from(lowest: i32) {
    // close_range(2) first; sweep up to the soft limit if unsupported.
    let rc = unsafe { libc::close_range(lowest as u32, u32::MAX, 0) };
    if rc == 0 {
        return;
    }

    let max_fd = match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => soft as i32,
        Err(_) => 1024,
    };
    for fd in lowest..max_fd {
        unsafe {
            libc::close(fd);
        }
    }
}

pub fn create_folders(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| CranedError::System(format!("cannot create {}: {e}", path.display())))
}

pub fn create_folders_for_file(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => create_folders(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_limit_format() {
        assert_eq!(format_time_limit(0), "00:00:00");
        assert_eq!(format_time_limit(59), "00:00:59");
        assert_eq!(format_time_limit(3600 + 61), "01:01:01");
        assert_eq!(format_time_limit(100 * 3600), "100:00:00");
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CranedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFail(String),

    #[error("Supervisor for job {0} lost")]
    SupervisorLost(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Job {0} exceeded its time limit")]
    ExceedTimeLimit(u32),

    #[error("Job {0} was cancelled")]
    Cancelled(u32),

    #[error("Job not found: {0}")]
    JobNotFound(u32),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("System error: {0}")]
    System(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for CranedError {
    fn from(errno: nix::errno::Errno) -> Self {
        CranedError::System(errno.desc().to_string())
    }
}

pub type Result<T> = std::result::Result<T, CranedError>;

/// Exit codes reported upstream alongside a terminal status. Values above
/// 256 never collide with a real process exit code (0..=255) or a signal
/// death (128+signum).
pub mod exit_code {
    pub const EXCEED_TIME_LIMIT: u32 = 256 + 1;
    pub const CGROUP_ERROR: u32 = 256 + 2;
    pub const SPAWN_PROCESS_FAIL: u32 = 256 + 3;
    pub const PERMISSION_DENIED: u32 = 256 + 4;
    pub const FILE_NOT_FOUND: u32 = 256 + 5;
    pub const SUPERVISOR_LOST: u32 = 256 + 6;

    /// Signal death of the user process maps to the shell convention.
    pub fn from_wait_signal(signum: i32) -> u32 {
        128 + signum as u32
    }
}

pub mod cgroup;
pub mod config;
pub mod device;
pub mod error;
pub mod grpc;
pub mod job;
pub mod shutdown;
pub mod supervisor;
pub mod supervisor_keeper;
pub mod util;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("crane");
}

/// Process-wide unique job identifier, assigned by the controller.
pub type JobId = u32;

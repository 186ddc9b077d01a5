pub mod config;
pub mod job_manager;
pub mod service;

/// Generated from `proto/choo.proto` by `build.rs`.
pub mod proto {
    tonic::include_proto!("choo.v1");
}

//! Configuration file management for the storage layer.

mod cluster_fs;
pub use cluster_fs::{ClusterFilesystem, LocalClusterFs};

pub mod storage;

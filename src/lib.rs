//! Storage management for Proxmox VE
//!
//! The storage layer hides the different storage backends (directories,
//! network shares, LVM, ZFS, ...) behind a single volume model. Volumes are
//! addressed cluster wide by a volume ID (`<storeid>:<volname>`), see
//! [`pve_storage_api_types::volume`] for the grammar.
//!
//! Entry points are the methods of [`storage::StorageContext`]; the
//! [`replication`] engine and [`migration`] build on top of them.

pub mod cluster;
pub mod migration;
pub mod plugin;
pub mod replication;
pub mod storage;
pub mod worker;

pub use storage::StorageContext;
